//! Replicated log -- client request intake.

use super::*;

use rand::prelude::*;

// LogReplica client requests entrance
impl<T> LogReplica<T>
where
    T: Transport<Envelope>,
{
    /// Handler of client request. Only a confirmed leader assigns slots;
    /// anyone else points the client elsewhere.
    pub(crate) async fn handle_client_request(
        &mut self,
        req: ClientRequest,
    ) -> Result<(), ReplogError> {
        let (client, client_seq) = (req.client, req.client_seq);
        if self.status != LeaderStatus::ConfirmedLeader {
            pf_debug!(
                "not leader, rejecting req {} from client {}",
                client_seq,
                client
            );
            self.reply_client(client, Envelope::NotLeader { client_seq });
            return Ok(());
        }

        // already committed: the client missed my earlier reply
        if self
            .client_committed
            .get(&client)
            .is_some_and(|&done| client_seq <= done)
        {
            self.reply_client(client, Envelope::RequestProcessed { client_seq });
            return Ok(());
        }

        // already in flight: re-drive the existing slot instead of assigning
        // a second one
        let in_flight = self.accept_log.iter().find_map(|(&seq, entry)| {
            match &entry.value {
                SlotValue::Command(r) if *r == req => Some(seq),
                _ => None,
            }
        });
        if let Some(seq) = in_flight {
            pf_debug!("re-driving in-flight slot {} for client {}", seq, client);
            return self.install_and_redrive(seq, SlotValue::Command(req));
        }

        if thread_rng().gen::<f64>() < self.skip_chance {
            pf_info!("skipping slot {} on purpose", self.next_seq);
            self.next_seq += 1;
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        let value = SlotValue::Command(req);
        self.accept_log.insert(
            seq,
            AcceptEntry {
                value: value.clone(),
                view: self.view,
                acks: self.self_acks(),
            },
        );
        pf_debug!("assigned slot {} to req {} of client {}", seq, client_seq, client);

        self.bcast_alive(Envelope::Command {
            view: self.view,
            seq,
            value,
        })?;

        // a single-replica cluster is its own quorum
        self.commit_sweep().await
    }
}
