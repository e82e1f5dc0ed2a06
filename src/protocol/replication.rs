//! Replicated log -- normal-case replication and commit.

use super::*;

impl AcceptEntry {
    /// Has this slot gathered enough acks to commit?
    #[inline]
    fn is_chosen(&self, quorum_cnt: u8) -> bool {
        self.acks.count() >= quorum_cnt
    }
}

// LogReplica replication engine logic
impl<T> LogReplica<T>
where
    T: Transport<Envelope>,
{
    /// Handler of Command message from the leader.
    pub(crate) async fn handle_msg_command(
        &mut self,
        view: ViewNum,
        seq: SeqNum,
        value: SlotValue,
    ) -> Result<(), ReplogError> {
        self.accept_proposal(view, seq, value, false).await
    }

    /// Handler of IgnoreSlot message from the leader. The no-op counts as
    /// accepted by the leader and by me.
    pub(crate) async fn handle_msg_ignore_slot(
        &mut self,
        view: ViewNum,
        seq: SeqNum,
    ) -> Result<(), ReplogError> {
        self.accept_proposal(view, seq, SlotValue::Noop, true).await
    }

    /// Accepts the value proposed by the leader of `view` at `seq` and
    /// announces it to peers.
    async fn accept_proposal(
        &mut self,
        view: ViewNum,
        seq: SeqNum,
        value: SlotValue,
        leader_acked: bool,
    ) -> Result<(), ReplogError> {
        if view < self.view {
            pf_debug!(
                "ignoring stale proposal for slot {} view {} < {}",
                seq,
                view,
                self.view
            );
            return Ok(());
        }
        if view > self.view {
            if self.leader_of(view) == self.id {
                pf_warn!("ignoring proposal of view {} led by myself", view);
                return Ok(());
            }
            // missed the claim of this view; catch up first
            self.adopt_view(view, None)?;
        }

        if seq < self.next_commit {
            // help a peer that may have missed earlier accepts
            return match self.committed_value(seq).cloned() {
                Some(committed) => self.bcast_alive(Envelope::Accept {
                    view,
                    seq,
                    from: self.id,
                    value: committed,
                }),
                None => Ok(()),
            };
        }

        let mut acks = self.self_acks();
        if leader_acked {
            acks.set(self.leader_of(view), true)?;
        }
        let known = self
            .accept_log
            .get(&seq)
            .is_some_and(|e| e.view == view && e.value == value);
        if known {
            if let Some(entry) = self.accept_log.get_mut(&seq) {
                for (r, flag) in acks.iter() {
                    if flag {
                        entry.acks.set(r, true)?;
                    }
                }
            }
        } else {
            // the current leader's proposal supersedes whatever I had
            self.accept_log.insert(
                seq,
                AcceptEntry {
                    value: value.clone(),
                    view,
                    acks,
                },
            );
        }
        self.next_seq = self.next_seq.max(seq + 1);
        pf_debug!("accepted slot {} in view {}", seq, view);

        self.bcast_alive(Envelope::Accept {
            view,
            seq,
            from: self.id,
            value,
        })?;
        self.commit_sweep().await
    }

    /// Handler of Accept message from a peer. Only acks for the same
    /// proposal are counted together; a proposal of a higher view replaces
    /// the one I know of.
    pub(crate) async fn handle_msg_accept(
        &mut self,
        view: ViewNum,
        seq: SeqNum,
        from: ReplicaId,
        value: SlotValue,
    ) -> Result<(), ReplogError> {
        if seq < self.next_commit {
            return Ok(());
        }

        match self.accept_log.get(&seq).map(|e| (e.view, e.value == value)) {
            Some((known, _)) if known > view => {
                pf_debug!(
                    "ignoring Accept for slot {} from {} of older view {}",
                    seq,
                    from,
                    view
                );
                return Ok(());
            }
            Some((known, false)) if known == view => {
                pf_warn!(
                    "ignoring conflicting Accept for slot {} from {} view {}",
                    seq,
                    from,
                    view
                );
                return Ok(());
            }
            Some((known, true)) if known == view => {}
            _ => {
                self.accept_log.insert(
                    seq,
                    AcceptEntry {
                        value,
                        view,
                        acks: Bitmap::new(self.population, false),
                    },
                );
            }
        }
        if let Some(entry) = self.accept_log.get_mut(&seq) {
            entry.acks.set(from, true)?;
            pf_trace!("slot {} acks {:?}", seq, entry.acks);
        }

        self.commit_sweep().await
    }

    /// Commits slots in order starting from `next_commit` for as long as
    /// they are chosen. Stops at the first hole or under-acked slot.
    pub(crate) async fn commit_sweep(&mut self) -> Result<(), ReplogError> {
        loop {
            let seq = self.next_commit;
            let (value, view, acks) = match self.accept_log.get(&seq) {
                Some(entry) if entry.is_chosen(self.quorum_cnt) => {
                    (entry.value.clone(), entry.view, entry.acks.count())
                }
                _ => break,
            };

            // log line goes first; if it fails the slot stays uncommitted
            // and a later sweep retries it
            match &value {
                SlotValue::Command(req) => {
                    let done = self.client_committed.get(&req.client).copied();
                    if done.is_some_and(|done| req.client_seq <= done) {
                        pf_debug!(
                            "slot {} duplicates req {} of client {}",
                            seq,
                            req.client_seq,
                            req.client
                        );
                        self.stats.duplicates += 1;
                    } else {
                        self.commit_log.append(req).await?;
                        self.client_committed.insert(req.client, req.client_seq);
                    }
                }
                SlotValue::Noop => {
                    self.stats.noops += 1;
                }
            }

            self.accept_log.remove(&seq);
            self.committed.push(value.clone());
            self.next_commit += 1;
            self.stats.commits += 1;
            self.stats.min_commit_acks =
                Some(self.stats.min_commit_acks.map_or(acks, |m| m.min(acks)));
            pf_debug!("committed slot {}", seq);

            if self.status == LeaderStatus::ConfirmedLeader {
                // followers only hear my own acceptance from here
                self.bcast_alive(Envelope::Accept {
                    view,
                    seq,
                    from: self.id,
                    value: value.clone(),
                })?;
                if let SlotValue::Command(req) = value {
                    self.reply_client(
                        req.client,
                        Envelope::RequestProcessed {
                            client_seq: req.client_seq,
                        },
                    );
                }
            }
        }

        Ok(())
    }
}
