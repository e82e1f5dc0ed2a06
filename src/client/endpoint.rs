//! Client endpoint submitting commands to the replicated log.

use crate::cluster::ClusterConfig;
use crate::protocol::{ClientRequest, Envelope};
use crate::server::{ReplicaId, Target, Transport};
use crate::utils::ReplogError;

use tokio::time::{self, Duration, Instant};

/// Client ID type.
pub type ClientId = u64;

/// Per-client request sequence number type. Starts at 1.
pub type ClientSeq = u64;

/// Client endpoint. Keeps at most one request in flight and retries it
/// against its current leader guess until the cluster reports it processed.
pub struct ClientEndpoint<T> {
    /// My client ID.
    id: ClientId,

    /// Total number of replicas in cluster.
    population: u8,

    /// Replica I currently believe to be the leader.
    leader_guess: ReplicaId,

    /// Sequence number of the last request submitted.
    last_seq: ClientSeq,

    /// How long to wait for a reply before trying the next replica.
    timeout: Duration,

    /// Message transport module.
    transport: T,
}

impl<T> ClientEndpoint<T>
where
    T: Transport<Envelope>,
{
    /// Creates a new client endpoint over the given transport.
    pub fn new_and_setup(
        id: ClientId,
        config: &ClusterConfig,
        transport: T,
    ) -> Result<Self, ReplogError> {
        if config.client_addr(id).is_none() {
            return logged_err!("invalid client ID {}", id);
        }
        Ok(ClientEndpoint {
            id,
            population: config.population(),
            leader_guess: 0,
            last_seq: 0,
            timeout: config.client_timeout(),
            transport,
        })
    }

    /// Moves the leader guess to the next replica.
    fn rotate_leader(&mut self) {
        self.leader_guess = (self.leader_guess + 1) % self.population;
        pf_debug!("leader guess -> {}", self.leader_guess);
    }

    /// Submits a command and waits until it is committed. Returns the
    /// client sequence number assigned to it.
    pub async fn submit(
        &mut self,
        content: impl Into<String>,
    ) -> Result<ClientSeq, ReplogError> {
        self.last_seq += 1;
        let req = ClientRequest {
            client: self.id,
            client_seq: self.last_seq,
            content: content.into(),
        };

        loop {
            pf_trace!(
                "sending req {} to replica {}",
                req.client_seq,
                self.leader_guess
            );
            self.transport.send_msg(
                Envelope::ClientRequest(req.clone()),
                Target::Replica(self.leader_guess),
            )?;

            let deadline = Instant::now() + self.timeout;
            loop {
                match time::timeout_at(deadline, self.transport.recv_msg()).await
                {
                    Err(_) => {
                        pf_debug!(
                            "req {} timed out at replica {}",
                            req.client_seq,
                            self.leader_guess
                        );
                        self.rotate_leader();
                        break;
                    }
                    Ok(Err(e)) => return Err(e),
                    Ok(Ok(Envelope::RequestProcessed { client_seq }))
                        if client_seq == req.client_seq =>
                    {
                        pf_debug!("req {} processed", client_seq);
                        return Ok(client_seq);
                    }
                    Ok(Ok(Envelope::NotLeader { client_seq }))
                        if client_seq == req.client_seq =>
                    {
                        self.rotate_leader();
                        break;
                    }
                    Ok(Ok(msg)) => {
                        pf_trace!("ignoring reply {:?}", msg);
                    }
                }
            }
        }
    }

    /// My client ID.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Replica I currently believe to be the leader.
    pub fn leader_guess(&self) -> ReplicaId {
        self.leader_guess
    }
}

#[cfg(test)]
mod endpoint_tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Scripted cluster: `leader` answers processed, `silent` never answers,
    /// everyone else says not-leader.
    struct ScriptedCluster {
        leader: ReplicaId,
        silent: Option<ReplicaId>,
        inbox: VecDeque<Envelope>,
        tried: Vec<ReplicaId>,
    }

    #[async_trait]
    impl Transport<Envelope> for ScriptedCluster {
        fn send_msg(
            &mut self,
            msg: Envelope,
            target: Target,
        ) -> Result<(), ReplogError> {
            let (Envelope::ClientRequest(req), Target::Replica(r)) =
                (msg, target)
            else {
                return Err(ReplogError::msg("unexpected send"));
            };
            self.tried.push(r);
            if Some(r) == self.silent {
                return Ok(());
            }
            // a stale reply for an older request always arrives first
            self.inbox.push_back(Envelope::RequestProcessed {
                client_seq: req.client_seq + 100,
            });
            self.inbox.push_back(if r == self.leader {
                Envelope::RequestProcessed {
                    client_seq: req.client_seq,
                }
            } else {
                Envelope::NotLeader {
                    client_seq: req.client_seq,
                }
            });
            Ok(())
        }

        async fn recv_msg(&mut self) -> Result<Envelope, ReplogError> {
            match self.inbox.pop_front() {
                Some(msg) => Ok(msg),
                None => futures::future::pending().await,
            }
        }
    }

    fn scripted(leader: ReplicaId, silent: Option<ReplicaId>) -> ScriptedCluster {
        ScriptedCluster {
            leader,
            silent,
            inbox: VecDeque::new(),
            tried: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rotate_on_not_leader() -> Result<(), ReplogError> {
        let config = ClusterConfig::localhost(1, 1, 53000)?;
        let mut client = ClientEndpoint::new_and_setup(0, &config, scripted(2, None))?;
        assert_eq!(client.submit("hello.").await?, 1);
        assert_eq!(client.leader_guess(), 2);
        assert_eq!(client.submit("again.").await?, 2);
        assert_eq!(client.transport.tried, vec![0, 1, 2, 2]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn rotate_on_timeout() -> Result<(), ReplogError> {
        let config = ClusterConfig::localhost(1, 1, 53000)?;
        let mut client =
            ClientEndpoint::new_and_setup(0, &config, scripted(1, Some(0)))?;
        let start = Instant::now();
        assert_eq!(client.submit("hello.").await?, 1);
        assert!(start.elapsed() >= config.client_timeout());
        assert_eq!(client.transport.tried, vec![0, 1]);
        Ok(())
    }

    #[test]
    fn invalid_client_id() -> Result<(), ReplogError> {
        let config = ClusterConfig::localhost(1, 1, 53000)?;
        assert!(ClientEndpoint::new_and_setup(5, &config, scripted(0, None)).is_err());
        Ok(())
    }
}
