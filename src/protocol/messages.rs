//! Replicated log -- wire messages and inbound dispatch.

use std::collections::BTreeMap;

use super::*;

use serde::{Deserialize, Serialize};

/// A client command to be ordered and logged.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client: ClientId,
    pub client_seq: ClientSeq,
    pub content: String,
}

/// Value occupying a log slot.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum SlotValue {
    Command(ClientRequest),

    /// Placeholder voiding a hole found during a view change.
    Noop,
}

/// Accepted slot as carried in a pledge.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PledgedEntry {
    pub value: SlotValue,

    /// View whose leader proposed `value`.
    pub view: ViewNum,

    /// Ack count known to the pledger. Already committed slots are reported
    /// with a quorum count.
    pub count: u8,
}

/// Message envelope exchanged between replicas and clients.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// Client -> replica.
    ClientRequest(ClientRequest),

    /// Replica -> client: I am not the leader, try another replica.
    NotLeader { client_seq: ClientSeq },

    /// Replica -> client: your command has been committed.
    RequestProcessed { client_seq: ClientSeq },

    /// Replica liveness beacon.
    Heartbeat { replica: ReplicaId },

    /// Leadership claim for a view, broadcast by `view mod N`. Carries the
    /// claimant's commit pointer so that pledgers can report committed
    /// slots it lacks.
    IAmLeader { view: ViewNum, next_commit: SeqNum },

    /// Pledge from `replica` to the claimant of `view`.
    YouAreLeader {
        view: ViewNum,
        replica: ReplicaId,
        next_commit: SeqNum,
        accepted: BTreeMap<SeqNum, PledgedEntry>,
    },

    /// Leader asks replicas to accept `value` at `seq`.
    Command {
        view: ViewNum,
        seq: SeqNum,
        value: SlotValue,
    },

    /// Replica `from` has accepted `value` at `seq`.
    Accept {
        view: ViewNum,
        seq: SeqNum,
        from: ReplicaId,
        value: SlotValue,
    },

    /// Leader of `view` proposes a no-op placeholder at `seq`, which it
    /// has accepted itself.
    IgnoreSlot { view: ViewNum, seq: SeqNum },
}

// LogReplica inbound message dispatch
impl<T> LogReplica<T>
where
    T: Transport<Envelope>,
{
    /// Handles an inbound message. Every message from a peer also counts as
    /// a sign of life from it.
    pub(crate) async fn handle_msg_recv(
        &mut self,
        msg: Envelope,
    ) -> Result<(), ReplogError> {
        pf_trace!("recv msg {:?}", msg);
        match msg {
            Envelope::ClientRequest(req) => self.handle_client_request(req).await,

            Envelope::Heartbeat { replica } => self.heartbeater.heard(replica),

            Envelope::IAmLeader { view, next_commit } => {
                self.heartbeater.heard(self.leader_of(view))?;
                self.handle_msg_i_am_leader(view, next_commit)
            }

            Envelope::YouAreLeader {
                view,
                replica,
                next_commit,
                accepted,
            } => {
                self.heartbeater.heard(replica)?;
                self.handle_msg_you_are_leader(
                    view,
                    replica,
                    next_commit,
                    accepted,
                )
                .await
            }

            Envelope::Command { view, seq, value } => {
                self.heartbeater.heard(self.leader_of(view))?;
                self.handle_msg_command(view, seq, value).await
            }

            Envelope::Accept {
                view,
                seq,
                from,
                value,
            } => {
                self.heartbeater.heard(from)?;
                self.handle_msg_accept(view, seq, from, value).await
            }

            Envelope::IgnoreSlot { view, seq } => {
                self.heartbeater.heard(self.leader_of(view))?;
                self.handle_msg_ignore_slot(view, seq).await
            }

            Envelope::NotLeader { .. } | Envelope::RequestProcessed { .. } => {
                pf_warn!("ignoring client-bound msg {:?}", msg);
                Ok(())
            }
        }
    }
}
