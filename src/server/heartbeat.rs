//! Replica heartbeats and leader failure detection module implementation.

use std::collections::HashMap;

use crate::server::ReplicaId;
use crate::utils::{Bitmap, ReplogError};

use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

/// Multiplexed heartbeat timer events type.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum HeartbeatEvent {
    /// Sending interval tick.
    SendTicked,

    /// Leader liveness checking interval tick.
    CheckTicked,
}

/// The heartbeats management module. Tracks when each peer was last heard
/// from and the speculated liveness of peers.
pub(crate) struct Heartbeater {
    /// My replica ID.
    me: ReplicaId,

    /// Interval for sending heartbeats to peers.
    send_interval: Interval,

    /// Interval for checking whether the leader has gone silent.
    check_interval: Interval,

    /// Silence longer than this marks a peer as dead.
    liveness_window: Duration,

    /// Last time anything was heard from each peer.
    last_heard: HashMap<ReplicaId, Instant>,

    /// Approximate health status tracking of peer replicas.
    peer_alive: Bitmap,
}

impl Heartbeater {
    /// Creates a new heartbeats manager. Every peer counts as freshly heard
    /// at creation time.
    pub(crate) fn new_and_setup(
        me: ReplicaId,
        population: u8,
        send_interval: Duration,
        check_interval: Duration,
        liveness_window: Duration,
    ) -> Result<Heartbeater, ReplogError> {
        if me >= population {
            return logged_err!(
                "invalid replica ID {} for population {}",
                me,
                population
            );
        }
        if send_interval.is_zero() || send_interval > liveness_window {
            return logged_err!(
                "invalid heartbeat send_interval {:?}",
                send_interval
            );
        }
        if check_interval.is_zero() {
            return logged_err!(
                "invalid heartbeat check_interval {:?}",
                check_interval
            );
        }

        let now = Instant::now();

        // first ticks fire one period from now, not immediately
        let mut send_interval =
            time::interval_at(now + send_interval, send_interval);
        send_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut check_interval =
            time::interval_at(now + check_interval, check_interval);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let last_heard = (0..population)
            .filter(|&p| p != me)
            .map(|p| (p, now))
            .collect();

        Ok(Heartbeater {
            me,
            send_interval,
            check_interval,
            liveness_window,
            last_heard,
            peer_alive: Bitmap::new(population, true),
        })
    }

    /// Waits for a heartbeat-related timer event.
    pub(crate) async fn get_event(&mut self) -> HeartbeatEvent {
        tokio::select! {
            _ = self.send_interval.tick() => HeartbeatEvent::SendTicked,
            _ = self.check_interval.tick() => HeartbeatEvent::CheckTicked,
        }
    }

    /// Records that something was heard from a peer just now. A peer
    /// previously speculated dead is re-admitted.
    pub(crate) fn heard(&mut self, peer: ReplicaId) -> Result<(), ReplogError> {
        if peer == self.me {
            return Ok(());
        }
        match self.last_heard.get_mut(&peer) {
            Some(t) => *t = Instant::now(),
            None => return logged_err!("peer {} not found in last_heard", peer),
        }
        if !self.peer_alive.get(peer)? {
            self.peer_alive.set(peer, true)?;
            pf_info!("peer_alive updated: {:?}", self.peer_alive);
        }
        Ok(())
    }

    /// Returns true if the given peer has been silent for longer than the
    /// liveness window. Never true for myself.
    pub(crate) fn timed_out(&self, peer: ReplicaId) -> bool {
        match self.last_heard.get(&peer) {
            Some(t) => t.elapsed() > self.liveness_window,
            None => false,
        }
    }

    /// Speculates that a peer is dead; broadcasts skip it until it is heard
    /// from again.
    pub(crate) fn mark_dead(&mut self, peer: ReplicaId) -> Result<(), ReplogError> {
        if peer != self.me && self.peer_alive.get(peer)? {
            self.peer_alive.set(peer, false)?;
            pf_info!("peer_alive updated: {:?}", self.peer_alive);
        }
        Ok(())
    }

    /// Gets the speculated liveness status of peers.
    pub(crate) fn peer_alive(&self) -> &Bitmap {
        &self.peer_alive
    }

    /// Bitmap of peers other than myself that are speculated alive.
    pub(crate) fn alive_peers(&self) -> Bitmap {
        let mut peers = self.peer_alive().clone();
        // me is always within range
        let _ = peers.set(self.me, false);
        peers
    }

    /// Bitmap of every peer other than myself, dead or alive.
    pub(crate) fn all_peers(&self) -> Bitmap {
        let mut peers = Bitmap::new(self.peer_alive.size(), true);
        let _ = peers.set(self.me, false);
        peers
    }
}

#[cfg(test)]
mod heartbeat_tests {
    use super::*;

    fn new_hb() -> Result<Heartbeater, ReplogError> {
        Heartbeater::new_and_setup(
            0,
            3,
            Duration::from_millis(2000),
            Duration::from_millis(7000),
            Duration::from_millis(3000),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_params() {
        let bad_me = Heartbeater::new_and_setup(
            3,
            3,
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(300),
        );
        assert!(bad_me.is_err());
        let bad_send = Heartbeater::new_and_setup(
            0,
            3,
            Duration::from_millis(500),
            Duration::from_millis(100),
            Duration::from_millis(300),
        );
        assert!(bad_send.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_order() -> Result<(), ReplogError> {
        let mut hb = new_hb()?;
        assert_eq!(hb.get_event().await, HeartbeatEvent::SendTicked); // 2s
        assert_eq!(hb.get_event().await, HeartbeatEvent::SendTicked); // 4s
        assert_eq!(hb.get_event().await, HeartbeatEvent::SendTicked); // 6s
        assert_eq!(hb.get_event().await, HeartbeatEvent::CheckTicked); // 7s
        assert_eq!(hb.get_event().await, HeartbeatEvent::SendTicked); // 8s
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silence_detection() -> Result<(), ReplogError> {
        let mut hb = new_hb()?;
        assert!(!hb.timed_out(1));
        time::advance(Duration::from_millis(2500)).await;
        hb.heard(1)?;
        time::advance(Duration::from_millis(1000)).await;
        assert!(!hb.timed_out(1));
        assert!(hb.timed_out(2));
        assert!(!hb.timed_out(0));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn dead_and_readmit() -> Result<(), ReplogError> {
        let mut hb = new_hb()?;
        assert_eq!(hb.alive_peers(), Bitmap::from(3, vec![1, 2]));
        hb.mark_dead(2)?;
        hb.mark_dead(0)?;
        assert_eq!(hb.peer_alive(), &Bitmap::from(3, vec![0, 1]));
        assert_eq!(hb.alive_peers(), Bitmap::from(3, vec![1]));
        assert_eq!(hb.all_peers(), Bitmap::from(3, vec![1, 2]));
        hb.heard(2)?;
        assert_eq!(hb.alive_peers(), Bitmap::from(3, vec![1, 2]));
        assert!(hb.heard(5).is_err());
        Ok(())
    }
}
