//! Replicated log -- view changes, pledges, and log reconciliation.

use std::collections::BTreeMap;

use super::*;

// LogReplica leadership related logic
impl<T> LogReplica<T>
where
    T: Transport<Envelope>,
{
    /// Broadcasts a heartbeat to every peer, including those speculated
    /// dead, so that they can come back.
    pub(crate) fn bcast_heartbeats(&mut self) -> Result<(), ReplogError> {
        let targets = self.heartbeater.all_peers();
        self.transport
            .bcast_msg(Envelope::Heartbeat { replica: self.id }, &targets)
    }

    /// Broadcasts my leadership claim for the current view.
    pub(crate) fn bcast_i_am_leader(&mut self) -> Result<(), ReplogError> {
        let targets = self.heartbeater.all_peers();
        self.transport.bcast_msg(
            Envelope::IAmLeader {
                view: self.view,
                next_commit: self.next_commit,
            },
            &targets,
        )
    }

    /// Starts claiming leadership of the current view.
    pub(crate) async fn claim_leadership(&mut self) -> Result<(), ReplogError> {
        debug_assert!(self.leads_current_view());
        self.status = LeaderStatus::ClaimingLeader;
        self.pledges.clear();
        pf_info!("claiming leadership of view {}", self.view);

        self.bcast_i_am_leader()?;
        if self.quorum_cnt <= 1 {
            // no peer pledge needed
            self.confirm_leadership().await?;
        }
        Ok(())
    }

    /// Moves to the next view after the current leader is presumed dead.
    pub(crate) async fn propose_view_change(
        &mut self,
    ) -> Result<(), ReplogError> {
        self.view += 1;
        self.stats.view_changes += 1;
        self.pledges.clear();
        pf_info!(
            "view change -> {} (leader {})",
            self.view,
            self.leader_of(self.view)
        );

        if self.leads_current_view() {
            self.claim_leadership().await
        } else {
            self.status = LeaderStatus::Follower;
            Ok(())
        }
    }

    /// Failure detector check: if the leader of my view is someone else and
    /// it has been silent for too long, mark it dead and move on.
    pub(crate) async fn check_leader_alive(&mut self) -> Result<(), ReplogError> {
        if self.leads_current_view() {
            return Ok(());
        }
        let leader = self.leader_of(self.view);
        if self.heartbeater.timed_out(leader) {
            pf_warn!("leader {} of view {} timed out", leader, self.view);
            self.heartbeater.mark_dead(leader)?;
            self.propose_view_change().await?;
        }
        Ok(())
    }

    /// Builds my pledge snapshot: every uncommitted slot in my accept log
    /// with the view it was proposed in, plus the committed slots from
    /// `since` on reported as chosen.
    fn pledge_snapshot(&self, since: SeqNum) -> BTreeMap<SeqNum, PledgedEntry> {
        let mut accepted = BTreeMap::new();
        for seq in since..self.next_commit {
            if let Some(value) = self.committed_value(seq) {
                accepted.insert(
                    seq,
                    PledgedEntry {
                        value: value.clone(),
                        view: self.view,
                        count: self.quorum_cnt,
                    },
                );
            }
        }
        for (&seq, entry) in self.accept_log.iter() {
            accepted.insert(
                seq,
                PledgedEntry {
                    value: entry.value.clone(),
                    view: entry.view,
                    count: entry.acks.count(),
                },
            );
        }
        accepted
    }

    /// Follows the leader of a view at least as high as mine and pledges to
    /// it. Never self-promotes.
    pub(crate) fn adopt_view(
        &mut self,
        view: ViewNum,
        claimant_next_commit: Option<SeqNum>,
    ) -> Result<(), ReplogError> {
        debug_assert!(view >= self.view);
        if view > self.view {
            self.stats.view_changes += 1;
            pf_info!(
                "adopted view {} -> {} (leader {})",
                self.view,
                view,
                self.leader_of(view)
            );
        }
        self.view = view;
        self.status = LeaderStatus::Follower;
        self.pledges.clear();

        let leader = self.leader_of(view);
        if leader == self.id {
            return Ok(());
        }
        let since = claimant_next_commit.unwrap_or(self.next_commit);
        let accepted = self.pledge_snapshot(since);
        pf_debug!(
            "pledging {} slots to leader {} of view {}",
            accepted.len(),
            leader,
            view
        );
        self.transport.send_msg(
            Envelope::YouAreLeader {
                view,
                replica: self.id,
                next_commit: self.next_commit,
                accepted,
            },
            Target::Replica(leader),
        )
    }

    /// Handler of I_AM_LEADER claim.
    pub(crate) fn handle_msg_i_am_leader(
        &mut self,
        view: ViewNum,
        next_commit: SeqNum,
    ) -> Result<(), ReplogError> {
        if view < self.view {
            pf_debug!("ignoring stale claim view {} < {}", view, self.view);
            return Ok(());
        }
        if self.leader_of(view) == self.id {
            pf_warn!("ignoring claim of view {} led by myself", view);
            return Ok(());
        }
        self.adopt_view(view, Some(next_commit))
    }

    /// Handler of YOU_ARE_LEADER pledge.
    pub(crate) async fn handle_msg_you_are_leader(
        &mut self,
        view: ViewNum,
        replica: ReplicaId,
        next_commit: SeqNum,
        accepted: BTreeMap<SeqNum, PledgedEntry>,
    ) -> Result<(), ReplogError> {
        if view != self.view || self.status != LeaderStatus::ClaimingLeader {
            pf_debug!(
                "ignoring pledge from {} for view {} (at view {} {:?})",
                replica,
                view,
                self.view,
                self.status
            );
            return Ok(());
        }
        if self.pledges.iter().any(|(r, _, _)| *r == replica) {
            return Ok(());
        }

        pf_debug!(
            "pledge from {} for view {} with {} slots",
            replica,
            view,
            accepted.len()
        );
        self.pledges.push((replica, accepted, next_commit));

        // my own implicit pledge completes the quorum
        if self.pledges.len() + 1 >= self.quorum_cnt as usize {
            self.confirm_leadership().await?;
        }
        Ok(())
    }

    /// Becomes the confirmed leader of the current view and reconciles the
    /// log from the collected pledges.
    async fn confirm_leadership(&mut self) -> Result<(), ReplogError> {
        self.status = LeaderStatus::ConfirmedLeader;
        pf_info!(
            "confirmed leader of view {} with {} pledges",
            self.view,
            self.pledges.len()
        );

        // merge snapshots, mine first; a chosen entry beats everything,
        // otherwise the value proposed in the highest view wins and ties
        // keep the first one seen
        let mut merged: BTreeMap<SeqNum, (SlotValue, ViewNum, bool)> =
            BTreeMap::new();
        let own = self.pledge_snapshot(self.next_commit);
        let pledges = std::mem::take(&mut self.pledges);
        let mut lowest_commit = self.next_commit;
        for (snapshot, pledger_commit) in std::iter::once((own, self.next_commit))
            .chain(pledges.into_iter().map(|(_, s, c)| (s, c)))
        {
            lowest_commit = lowest_commit.min(pledger_commit);
            for (seq, pledged) in snapshot {
                let chosen = pledged.count >= self.quorum_cnt;
                let replace = match merged.get(&seq) {
                    None => true,
                    Some((_, view, was_chosen)) => {
                        !*was_chosen && (chosen || pledged.view > *view)
                    }
                };
                if replace {
                    merged.insert(seq, (pledged.value, pledged.view, chosen));
                }
            }
        }

        // pledgers lagging behind me get my committed slots re-driven
        for seq in lowest_commit..self.next_commit {
            if let Some(value) = self.committed_value(seq).cloned() {
                self.bcast_alive(Envelope::Command {
                    view: self.view,
                    seq,
                    value: value.clone(),
                })?;
                self.bcast_alive(Envelope::Accept {
                    view: self.view,
                    seq,
                    from: self.id,
                    value,
                })?;
            }
        }

        if let Some(&max_seq) = merged.keys().next_back() {
            for seq in self.next_commit..=max_seq {
                let value = match merged.remove(&seq) {
                    Some((SlotValue::Command(req), _, _)) => {
                        SlotValue::Command(req)
                    }
                    // hole, or an earlier placeholder
                    _ => SlotValue::Noop,
                };
                self.install_and_redrive(seq, value)?;
            }
            self.next_seq = self.next_seq.max(max_seq + 1);
        }
        self.next_seq = self.next_seq.max(self.next_commit);

        self.commit_sweep().await
    }

    /// Installs a value into my accept log as my own proposal of the
    /// current view and (re-)broadcasts it to peers.
    pub(crate) fn install_and_redrive(
        &mut self,
        seq: SeqNum,
        value: SlotValue,
    ) -> Result<(), ReplogError> {
        let view = self.view;
        let current = self
            .accept_log
            .get(&seq)
            .is_some_and(|e| e.view == view && e.value == value);
        if !current {
            let acks = self.self_acks();
            self.accept_log.insert(
                seq,
                AcceptEntry {
                    value: value.clone(),
                    view,
                    acks,
                },
            );
        }
        pf_debug!("re-driving slot {} in view {}", seq, view);

        let msg = match value {
            SlotValue::Noop => Envelope::IgnoreSlot { view, seq },
            value => Envelope::Command { view, seq, value },
        };
        self.bcast_alive(msg)
    }
}
