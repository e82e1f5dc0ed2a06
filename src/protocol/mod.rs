//! Replication protocol: leader-based replicated log.
//!
//! A cluster of `2f + 1` replicas agrees on a total order of client commands.
//! Leadership rotates by view number (`leader(v) = v mod N`); a replica that
//! stops hearing from the leader bumps its view, the new leader collects
//! pledges carrying every replica's accepted-but-uncommitted slots, then
//! re-drives those slots and voids holes with no-op placeholders. A slot
//! commits once `f + 1` replicas have accepted it, strictly in slot order.

mod leadership;
mod messages;
mod replication;
mod request;


use std::collections::{BTreeMap, HashMap};

use crate::client::{ClientId, ClientSeq};
use crate::cluster::ClusterConfig;
use crate::server::{
    CommitLog, HeartbeatEvent, Heartbeater, ReplicaId, Target, Transport,
};
use crate::utils::{Bitmap, ReplogError};

use tokio::sync::watch;

pub use messages::{ClientRequest, Envelope, PledgedEntry, SlotValue};

/// View number type. Only ever increases.
pub type ViewNum = u64;

/// Log slot sequence number type.
pub type SeqNum = u64;

/// Leadership status of a replica within its current view.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LeaderStatus {
    /// Not the leader of current view.
    Follower,

    /// Broadcast I_AM_LEADER but not yet received enough pledges.
    ClaimingLeader,

    /// Received at least `f` pledges for current view.
    ConfirmedLeader,
}

/// Uncommitted slot in the accept log.
#[derive(Debug, Clone)]
pub(crate) struct AcceptEntry {
    /// Value accepted at this slot.
    value: SlotValue,

    /// View whose leader proposed `value`.
    view: ViewNum,

    /// Replicas known to have accepted `value` in `view`.
    acks: Bitmap,
}

/// Instrumentation counters of a replica.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicaStats {
    /// Slots committed, placeholders included.
    pub commits: u64,

    /// No-op placeholders committed.
    pub noops: u64,

    /// Committed client commands skipped as already logged.
    pub duplicates: u64,

    /// Number of times this replica moved to a higher view.
    pub view_changes: u64,

    /// Smallest ack count seen at any commit.
    pub min_commit_acks: Option<u8>,
}

/// Replicated log server replica module.
pub struct LogReplica<T> {
    /// Replica ID in cluster.
    id: ReplicaId,

    /// Total number of replicas in cluster.
    population: u8,

    /// Majority quorum size.
    quorum_cnt: u8,

    /// Message transport module.
    transport: T,

    /// Heartbeater module.
    heartbeater: Heartbeater,

    /// Durable commit log module.
    commit_log: CommitLog,

    /// Current view number.
    view: ViewNum,

    /// Leadership status within current view.
    status: LeaderStatus,

    /// Next sequence number to assign (leader) or above every slot seen.
    next_seq: SeqNum,

    /// Smallest sequence number not yet committed.
    next_commit: SeqNum,

    /// Accepted but not yet committed slots.
    accept_log: BTreeMap<SeqNum, AcceptEntry>,

    /// Committed slot values, indexed by sequence number.
    committed: Vec<SlotValue>,

    /// Pledges received for current view in arrival order.
    pledges: Vec<(ReplicaId, BTreeMap<SeqNum, PledgedEntry>, SeqNum)>,

    /// Highest client sequence number committed per client.
    client_committed: HashMap<ClientId, ClientSeq>,

    /// Probability of skipping a sequence number on client intake.
    skip_chance: f64,

    /// Instrumentation counters.
    stats: ReplicaStats,
}

// LogReplica common helpers
impl<T> LogReplica<T> {
    /// Leader replica of given view.
    #[inline]
    fn leader_of(&self, view: ViewNum) -> ReplicaId {
        (view % self.population as u64) as ReplicaId
    }

    /// Am I the designated leader of my current view?
    #[inline]
    fn leads_current_view(&self) -> bool {
        self.leader_of(self.view) == self.id
    }

    /// Create an ack set containing only myself.
    #[inline]
    fn self_acks(&self) -> Bitmap {
        Bitmap::from(self.population, vec![self.id])
    }
}

// LogReplica public API implementation
impl<T> LogReplica<T>
where
    T: Transport<Envelope>,
{
    /// Creates a new replica with given ID over the given transport. Opens
    /// the commit log file named by the config.
    pub async fn new_and_setup(
        id: ReplicaId,
        config: ClusterConfig,
        transport: T,
    ) -> Result<Self, ReplogError> {
        config.validate()?;
        let population = config.population();
        if id >= population {
            return logged_err!(
                "invalid replica ID {} for population {}",
                id,
                population
            );
        }

        let heartbeater = Heartbeater::new_and_setup(
            id,
            population,
            config.hb_send_interval(),
            config.hb_check_interval(),
            config.liveness_window(),
        )?;
        let commit_log = CommitLog::new_and_setup(
            id,
            &config.log_path(id),
            config.logger_sync,
        )
        .await?;

        let skip_chance = if config.skip_slot { 0.2 } else { 0.0 };

        Ok(LogReplica {
            id,
            population,
            quorum_cnt: config.quorum_cnt(),
            transport,
            heartbeater,
            commit_log,
            view: 0,
            status: LeaderStatus::Follower,
            next_seq: 0,
            next_commit: 0,
            accept_log: BTreeMap::new(),
            committed: vec![],
            pledges: vec![],
            client_committed: HashMap::new(),
            skip_chance,
            stats: ReplicaStats::default(),
        })
    }

    /// Startup actions: the leader of the initial view claims leadership.
    pub(crate) async fn start(&mut self) -> Result<(), ReplogError> {
        pf_info!(
            "replica {} starting in view {} (leader {})",
            self.id,
            self.view,
            self.leader_of(self.view)
        );
        if self.leads_current_view() {
            self.claim_leadership().await?;
        }
        Ok(())
    }

    /// Main event loop. Returns once termination is signalled through
    /// `rx_term` or the transport breaks down.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ReplogError> {
        self.start().await?;

        loop {
            tokio::select! {
                // message from peer or client
                msg = self.transport.recv_msg() => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => {
                            pf_error!("error receiving msg: {}", e);
                            return Err(e);
                        }
                    };
                    if let Err(e) = self.handle_msg_recv(msg).await {
                        pf_error!("error handling msg recv: {}", e);
                    }
                },

                // heartbeat-related event
                hb_event = self.heartbeater.get_event() => {
                    if let Err(e) = self.handle_hb_event(hb_event).await {
                        pf_error!("error handling {:?}: {}", hb_event, e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("replica caught termination signal");
                    break;
                }
            }
        }

        pf_info!(
            "replica {} stopped at view {} next_commit {}",
            self.id,
            self.view,
            self.next_commit
        );
        Ok(())
    }

    /// Dispatches a heartbeat timer event.
    pub(crate) async fn handle_hb_event(
        &mut self,
        event: HeartbeatEvent,
    ) -> Result<(), ReplogError> {
        match event {
            HeartbeatEvent::SendTicked => {
                self.bcast_heartbeats()?;
                if self.status == LeaderStatus::ClaimingLeader {
                    // peers that were not listening yet get another chance
                    self.bcast_i_am_leader()?;
                }
                Ok(())
            }
            HeartbeatEvent::CheckTicked => self.check_leader_alive().await,
        }
    }

    /// Sends a message to a client, best-effort.
    fn reply_client(&mut self, client: ClientId, msg: Envelope) {
        if let Err(e) = self.transport.send_msg(msg, Target::Client(client)) {
            pf_debug!("error replying to client {}: {}", client, e);
        }
    }

    /// Broadcasts a message to every peer speculated alive.
    fn bcast_alive(&mut self, msg: Envelope) -> Result<(), ReplogError> {
        let targets = self.heartbeater.alive_peers();
        self.transport.bcast_msg(msg, &targets)
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Current view number.
    pub fn view(&self) -> ViewNum {
        self.view
    }

    /// Leadership status within current view.
    pub fn status(&self) -> LeaderStatus {
        self.status
    }

    /// Smallest sequence number not yet committed.
    pub fn next_commit(&self) -> SeqNum {
        self.next_commit
    }

    /// Number of accepted but uncommitted slots.
    pub fn accept_log_len(&self) -> usize {
        self.accept_log.len()
    }

    /// Value committed at given slot, if committed.
    pub fn committed_value(&self, seq: SeqNum) -> Option<&SlotValue> {
        usize::try_from(seq).ok().and_then(|s| self.committed.get(s))
    }

    /// Instrumentation counters.
    pub fn stats(&self) -> &ReplicaStats {
        &self.stats
    }
}
