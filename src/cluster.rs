//! Cluster-wide configuration, loaded once at process startup.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::client::ClientId;
use crate::server::ReplicaId;
use crate::utils::ReplogError;

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// Cluster configuration shared by every replica and client. Immutable
/// after loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of crash failures tolerated. Population is `2f + 1`.
    pub f: u8,

    /// Listen addresses of replicas, indexed by replica ID.
    pub replicas: Vec<SocketAddr>,

    /// Listen addresses of clients, indexed by client ID.
    pub clients: Vec<SocketAddr>,

    /// Client-side reply timeout in millisecs.
    pub client_timeout_ms: u64,

    /// Heartbeat silence in millisecs after which the leader is presumed
    /// dead.
    pub liveness_window_ms: u64,

    /// Interval of broadcasting heartbeats in millisecs.
    pub hb_send_interval_ms: u64,

    /// Interval of checking leader liveness in millisecs.
    pub hb_check_interval_ms: u64,

    /// Probability that any outbound send gets silently dropped.
    pub loss_rate: f64,

    /// If set, the leader occasionally skips a sequence number on intake
    /// so that gap recovery gets exercised.
    pub skip_slot: bool,

    /// Directory holding the per-replica commit log files.
    pub log_dir: String,

    /// Whether to call `fdatasync()` after each commit log append.
    pub logger_sync: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let addr = |port: u16| SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        ClusterConfig::with_addrs(
            1,
            vec![addr(54551), addr(54552), addr(54553)],
            vec![addr(54550)],
        )
    }
}

impl ClusterConfig {
    /// Composes a configuration from defaults overwritten by the given
    /// TOML string, then validates it.
    pub fn from_toml_str(config_str: &str) -> Result<Self, ReplogError> {
        let config = parsed_config!(Some(config_str) => ClusterConfig;
                                    f, replicas, clients, client_timeout_ms,
                                    liveness_window_ms, hb_send_interval_ms,
                                    hb_check_interval_ms, loss_rate,
                                    skip_slot, log_dir, logger_sync)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub async fn from_file(path: &Path) -> Result<Self, ReplogError> {
        let config_str = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&config_str)
    }

    /// Serializes into TOML text.
    pub fn to_toml_string(&self) -> Result<String, ReplogError> {
        Ok(toml::to_string(self)?)
    }

    /// Fills in the default timing and testing knobs around the given
    /// address lists.
    fn with_addrs(
        f: u8,
        replicas: Vec<SocketAddr>,
        clients: Vec<SocketAddr>,
    ) -> Self {
        ClusterConfig {
            f,
            replicas,
            clients,
            client_timeout_ms: 6000,
            liveness_window_ms: 3000,
            hb_send_interval_ms: 2000,
            hb_check_interval_ms: 8000,
            loss_rate: 0.0,
            skip_slot: false,
            log_dir: "logs".into(),
            logger_sync: false,
        }
    }

    /// Generates an all-on-localhost layout: clients take the first ports
    /// starting at `base_port`, replicas take the following ones. Fails if
    /// the layout runs past the last port number.
    pub fn localhost(
        f: u8,
        num_clients: u16,
        base_port: u16,
    ) -> Result<Self, ReplogError> {
        let population = 2 * f as u16 + 1;
        if base_port
            .checked_add(num_clients)
            .and_then(|p| p.checked_add(population - 1))
            .is_none()
        {
            return logged_err!(
                "{} clients and {} replicas do not fit above port {}",
                num_clients,
                population,
                base_port
            );
        }

        let addr = |port: u16| SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        Ok(ClusterConfig::with_addrs(
            f,
            (0..population)
                .map(|i| addr(base_port + num_clients + i))
                .collect(),
            (0..num_clients).map(|i| addr(base_port + i)).collect(),
        ))
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ReplogError> {
        let population = 2 * self.f as usize + 1;
        if population > u8::MAX as usize {
            return logged_err!("invalid config.f '{}'", self.f);
        }
        if self.replicas.len() != population {
            return logged_err!(
                "config.replicas has {} entries, expecting 2f+1 = {}",
                self.replicas.len(),
                population
            );
        }
        if self.clients.is_empty() {
            return logged_err!("config.clients is empty");
        }
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return logged_err!("invalid config.loss_rate '{}'", self.loss_rate);
        }
        if self.client_timeout_ms == 0 {
            return logged_err!(
                "invalid config.client_timeout_ms '{}'",
                self.client_timeout_ms
            );
        }
        if self.liveness_window_ms == 0 {
            return logged_err!(
                "invalid config.liveness_window_ms '{}'",
                self.liveness_window_ms
            );
        }
        if self.hb_send_interval_ms == 0
            || self.hb_send_interval_ms > self.liveness_window_ms
        {
            return logged_err!(
                "invalid config.hb_send_interval_ms '{}'",
                self.hb_send_interval_ms
            );
        }
        if self.hb_check_interval_ms == 0 {
            return logged_err!(
                "invalid config.hb_check_interval_ms '{}'",
                self.hb_check_interval_ms
            );
        }
        Ok(())
    }

    /// Total number of replicas.
    #[inline]
    pub fn population(&self) -> u8 {
        self.replicas.len() as u8
    }

    /// Number of replicas (including self) that must accept a slot before
    /// it may commit.
    #[inline]
    pub fn quorum_cnt(&self) -> u8 {
        self.f + 1
    }

    /// Listen address of a replica.
    pub fn replica_addr(&self, id: ReplicaId) -> Option<SocketAddr> {
        self.replicas.get(id as usize).copied()
    }

    /// Listen address of a client.
    pub fn client_addr(&self, id: ClientId) -> Option<SocketAddr> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.clients.get(idx).copied())
    }

    /// Path of the commit log file of a replica.
    pub fn log_path(&self, id: ReplicaId) -> PathBuf {
        Path::new(&self.log_dir).join(format!("replicaLog_{}.txt", id))
    }

    #[inline]
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    #[inline]
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    #[inline]
    pub fn hb_send_interval(&self) -> Duration {
        Duration::from_millis(self.hb_send_interval_ms)
    }

    #[inline]
    pub fn hb_check_interval(&self) -> Duration {
        Duration::from_millis(self.hb_check_interval_ms)
    }
}
