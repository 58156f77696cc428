use crate::db::PollStorage;
use crate::error::StorageResult;
use crate::models::{PollId, PollRules, RuleOverrides, Selection, VoteResult, VoteStatus, VoterId};
use crate::voting::PollRuntime;
use dashmap::DashMap;
use log::{debug, error};
use std::collections::HashSet;
use std::sync::Arc;

type InFlight = Arc<DashMap<PollId, HashSet<VoterId>>>;

/// Sole entry point for changing a voter's choice.
///
/// Attempts for the same (poll, voter) pair never overlap: a second attempt
/// while one is still persisting returns `NoOp` immediately instead of
/// queueing. Accepted changes are applied to the runtime before the storage
/// write and compensated if that write fails. The write and its compensation
/// run on their own task, so dropping the caller's future never strands an
/// unsaved selection in memory.
pub struct VoteManager {
    storage: Arc<dyn PollStorage>,
    in_flight: InFlight,
}

// Releases the (poll, voter) slot on every exit path
struct InFlightGuard {
    registry: InFlight,
    poll_id: PollId,
    voter: VoterId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(mut voters) = self.registry.get_mut(&self.poll_id) {
            voters.remove(&self.voter);
        }
        self.registry
            .remove_if(&self.poll_id, |_, voters| voters.is_empty());
    }
}

impl VoteManager {
    pub fn new(storage: Arc<dyn PollStorage>) -> Self {
        Self {
            storage,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub async fn attempt_vote(
        &self,
        runtime: &Arc<PollRuntime>,
        voter: VoterId,
        option_index: usize,
    ) -> VoteResult {
        self.attempt_vote_with(runtime, voter, option_index, &RuleOverrides::default())
            .await
    }

    /// Like [`attempt_vote`](Self::attempt_vote) but judged against the
    /// voter's effective rules.
    pub async fn attempt_vote_with(
        &self,
        runtime: &Arc<PollRuntime>,
        voter: VoterId,
        option_index: usize,
        overrides: &RuleOverrides,
    ) -> VoteResult {
        let poll_id = runtime.id();

        let Some(guard) = self.acquire(poll_id, voter) else {
            debug!("Vote from {} on poll {} dropped: previous click still saving", voter, poll_id);
            return VoteResult::new(
                poll_id,
                VoteStatus::NoOp,
                runtime.selection_snapshot(voter),
                "Still saving your previous click...",
            );
        };

        if runtime.is_closed() {
            return VoteResult::new(
                poll_id,
                VoteStatus::RejectedClosed,
                runtime.selection_snapshot(voter),
                "This poll is closed.",
            );
        }

        if option_index >= runtime.option_count() {
            return VoteResult::new(
                poll_id,
                VoteStatus::RejectedRules,
                runtime.selection_snapshot(voter),
                "Invalid option.",
            );
        }

        let effective = runtime.rules().effective(overrides);
        let before = runtime.selection_snapshot(voter);
        let proposed = propose_selection(&before, option_index, &effective);

        if !effective.allow_resubmissions && !before.is_empty() && before != proposed {
            return VoteResult::new(
                poll_id,
                VoteStatus::RejectedRules,
                before,
                "You already voted. Resubmissions are disabled.",
            );
        }

        if effective.multiple_choice {
            let max = effective.selection_cap();
            if proposed.len() > max {
                return VoteResult::new(
                    poll_id,
                    VoteStatus::RejectedRules,
                    before,
                    format!(
                        "You can select at most {} option{}.",
                        max,
                        if max == 1 { "" } else { "s" }
                    ),
                );
            }
        }

        if before == proposed {
            return VoteResult::new(poll_id, VoteStatus::NoOp, before, "No change.");
        }

        // Optimistic apply so renders see the vote before the write lands
        runtime.apply_selection(voter, proposed.clone());

        let persist = tokio::spawn(persist_selection(
            Arc::clone(&self.storage),
            Arc::clone(runtime),
            guard,
            before.clone(),
            proposed.clone(),
        ));

        match persist.await {
            Ok(Ok(())) => {
                debug!("Recorded selection {:?} for {} on poll {}", proposed, voter, poll_id);
                let message = success_message(&effective, &before);
                VoteResult::new(poll_id, VoteStatus::Accepted, proposed, message)
            }
            Ok(Err(_)) => rollback_result(poll_id, before),
            Err(e) => {
                error!("Vote task for {} on poll {} did not finish: {}", voter, poll_id, e);
                rollback_result(poll_id, runtime.selection_snapshot(voter))
            }
        }
    }

    /// Whether an attempt for this pair is currently persisting.
    pub fn is_in_flight(&self, poll_id: PollId, voter: VoterId) -> bool {
        self.in_flight
            .get(&poll_id)
            .is_some_and(|voters| voters.contains(&voter))
    }

    fn acquire(&self, poll_id: PollId, voter: VoterId) -> Option<InFlightGuard> {
        let inserted = self.in_flight.entry(poll_id).or_default().insert(voter);
        inserted.then(|| InFlightGuard {
            registry: Arc::clone(&self.in_flight),
            poll_id,
            voter,
        })
    }
}

// Writes the selection and undoes the optimistic apply on failure. The
// in-flight slot is held until both have happened.
async fn persist_selection(
    storage: Arc<dyn PollStorage>,
    runtime: Arc<PollRuntime>,
    guard: InFlightGuard,
    before: Selection,
    proposed: Selection,
) -> StorageResult<()> {
    let result = storage
        .save_voter_selection(guard.poll_id, guard.voter, &proposed)
        .await;
    if let Err(e) = &result {
        error!(
            "Failed to persist vote for {} on poll {}: {}",
            guard.voter, guard.poll_id, e
        );
        runtime.apply_selection(guard.voter, before);
    }
    result
}

fn rollback_result(poll_id: PollId, selection: Selection) -> VoteResult {
    VoteResult::new(
        poll_id,
        VoteStatus::Rollback,
        selection,
        "Couldn't save your vote. Please try again.",
    )
}

fn propose_selection(before: &Selection, clicked: usize, rules: &PollRules) -> Selection {
    if !rules.multiple_choice {
        return Selection::from([clicked]);
    }

    let mut next = before.clone();
    if !next.remove(&clicked) {
        next.insert(clicked);
    }
    next
}

fn success_message(rules: &PollRules, before: &Selection) -> &'static str {
    if rules.multiple_choice {
        "Selection updated."
    } else if before.is_empty() {
        "Vote recorded."
    } else {
        "Vote changed."
    }
}
