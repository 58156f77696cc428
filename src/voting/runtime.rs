use crate::models::{Poll, PollId, PollRules, Selection, VoterId};
use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Live state of one poll: the wrapped definition plus every voter's selection.
///
/// Option vote counts on the wrapped poll are a cache derived from the
/// selection map. Both live behind one mutex so a reader never sees a
/// selection without its matching tally.
#[derive(Debug)]
pub struct PollRuntime {
    id: PollId,
    state: Mutex<RuntimeState>,
}

#[derive(Debug)]
struct RuntimeState {
    poll: Poll,
    selections: HashMap<VoterId, Selection>,
}

impl PollRuntime {
    pub fn new(mut poll: Poll) -> Self {
        // no selections yet, so any incoming counts are stale
        for option in poll.options.iter_mut() {
            *option = option.with_votes(0);
        }

        Self {
            id: poll.id,
            state: Mutex::new(RuntimeState {
                poll,
                selections: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> PollId {
        self.id
    }

    /// Copy of the poll with current tallies.
    pub fn poll(&self) -> Poll {
        self.state.lock().poll.clone()
    }

    pub fn readable_id(&self) -> String {
        self.state.lock().poll.readable_id.clone()
    }

    pub fn rules(&self) -> PollRules {
        self.state.lock().poll.rules
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().poll.closed
    }

    pub fn option_count(&self) -> usize {
        self.state.lock().poll.options.len()
    }

    pub fn closes_at(&self) -> DateTime<Utc> {
        self.state.lock().poll.closes_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().poll.closed_at
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.lock().poll.is_due(now)
    }

    /// Closed and last relevant before `cutoff`.
    pub fn expired_before(&self, cutoff: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        state.poll.closed && state.poll.closed_reference() < cutoff
    }

    pub fn has_voted(&self, voter: VoterId) -> bool {
        self.state
            .lock()
            .selections
            .get(&voter)
            .is_some_and(|s| !s.is_empty())
    }

    pub fn selection_snapshot(&self, voter: VoterId) -> Selection {
        self.state
            .lock()
            .selections
            .get(&voter)
            .cloned()
            .unwrap_or_default()
    }

    pub fn voters_snapshot(&self) -> HashSet<VoterId> {
        self.state.lock().selections.keys().copied().collect()
    }

    pub fn tallies(&self) -> Vec<u32> {
        self.state
            .lock()
            .poll
            .options
            .iter()
            .map(|o| o.votes)
            .collect()
    }

    /// Replaces a voter's whole selection and updates tallies by delta.
    ///
    /// Performs no rule validation. An empty set removes the voter. Returns
    /// `false` when the new selection equals the current one.
    pub fn apply_selection(&self, voter: VoterId, selection: Selection) -> bool {
        let mut state = self.state.lock();
        let before = state.selections.get(&voter).cloned().unwrap_or_default();
        if before == selection {
            return false;
        }

        state.apply_tally_delta(&before, &selection);
        if selection.is_empty() {
            state.selections.remove(&voter);
        } else {
            state.selections.insert(voter, selection);
        }
        true
    }

    /// Seeds a persisted selection during startup load.
    pub fn supply_selection_bootstrap(
        &self,
        voter: VoterId,
        indices: impl IntoIterator<Item = usize>,
    ) {
        let option_count = self.option_count();
        let (valid, dropped): (Selection, Selection) =
            indices.into_iter().partition(|&i| i < option_count);

        if !dropped.is_empty() {
            warn!(
                "Dropping out-of-range stored indices {:?} for voter {} on poll {}",
                dropped, voter, self.id
            );
        }
        self.apply_selection(voter, valid);
    }

    /// Marks the poll closed. Only the first call records `closed_at`;
    /// returns whether this call performed the transition.
    pub fn close(&self, closed_at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.poll.closed {
            return false;
        }
        state.poll.closed = true;
        if state.poll.closed_at.is_none() {
            state.poll.closed_at = Some(closed_at);
        }
        true
    }
}

impl RuntimeState {
    fn apply_tally_delta(&mut self, before: &Selection, after: &Selection) {
        let options = &mut self.poll.options;

        for &i in before.difference(after) {
            if let Some(option) = options.get_mut(i) {
                *option = option.with_votes(option.votes.saturating_sub(1));
            }
        }
        for &i in after.difference(before) {
            if let Some(option) = options.get_mut(i) {
                *option = option.with_votes(option.votes + 1);
            }
        }
    }
}
