mod runtime;
mod vote_manager;

pub use runtime::PollRuntime;
pub use vote_manager::VoteManager;

use crate::models::{Poll, PollId};
use serde::Serialize;

// Tally view of a poll, built from the runtime's derived counts
#[derive(Debug, Clone, Serialize)]
pub struct PollResults {
    pub poll_id: PollId,
    pub question: String,
    pub closed: bool,
    pub total_voters: usize,
    pub counts: Vec<VoteCount>,    // sorted by votes, highest first
    pub winners: Vec<usize>,       // option indices sharing the top count, empty if no votes
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteCount {
    pub index: usize,
    pub label: String,
    pub votes: u32,
    pub rank: usize,
}

impl PollResults {
    pub fn from_runtime(runtime: &PollRuntime) -> Self {
        let poll = runtime.poll();
        let total_voters = runtime.voters_snapshot().len();
        Self::from_poll(&poll, total_voters)
    }

    pub fn from_poll(poll: &Poll, total_voters: usize) -> Self {
        let mut counts: Vec<VoteCount> = poll
            .options
            .iter()
            .map(|o| VoteCount {
                index: o.index,
                label: o.label.clone(),
                votes: o.votes,
                rank: 0,
            })
            .collect();
        counts.sort_by(|a, b| b.votes.cmp(&a.votes).then(a.index.cmp(&b.index)));

        // Competition ranking: ties share a rank
        let mut previous: Option<u32> = None;
        for position in 0..counts.len() {
            if previous != Some(counts[position].votes) {
                counts[position].rank = position + 1;
            } else {
                counts[position].rank = counts[position - 1].rank;
            }
            previous = Some(counts[position].votes);
        }

        let top = counts.first().map(|c| c.votes).unwrap_or(0);
        let winners = if top == 0 {
            Vec::new()
        } else {
            counts.iter().filter(|c| c.votes == top).map(|c| c.index).collect()
        };

        Self {
            poll_id: poll.id,
            question: poll.question.clone(),
            closed: poll.closed,
            total_voters,
            counts,
            winners,
        }
    }

    /// Share of voters who picked the option, as a percentage with one decimal.
    pub fn percentage(&self, index: usize) -> f64 {
        if self.total_voters == 0 {
            return 0.0;
        }
        self.counts
            .iter()
            .find(|c| c.index == index)
            .map(|c| (c.votes as f64 * 1000.0 / self.total_voters as f64).round() / 10.0)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PollOption, PollRules, Selection};
    use chrono::Duration;
    use uuid::Uuid;

    fn runtime() -> PollRuntime {
        PollRuntime::new(Poll::new(
            Uuid::new_v4(),
            None,
            "Pick".to_string(),
            vec![
                PollOption::new(0, "red", None),
                PollOption::new(1, "green", None),
                PollOption::new(2, "blue", None),
            ],
            PollRules {
                multiple_choice: true,
                max_selections: 3,
                allow_resubmissions: true,
                can_view_results: true,
            },
            Duration::minutes(5),
        ))
    }

    #[test]
    fn results_rank_and_detect_ties() {
        let rt = runtime();
        rt.apply_selection(Uuid::new_v4(), Selection::from([0, 2]));
        rt.apply_selection(Uuid::new_v4(), Selection::from([2]));
        rt.apply_selection(Uuid::new_v4(), Selection::from([0]));

        let results = PollResults::from_runtime(&rt);
        assert_eq!(results.total_voters, 3);
        assert_eq!(results.winners, vec![0, 2]);
        assert_eq!(results.counts[0].rank, 1);
        assert_eq!(results.counts[1].rank, 1);
        assert_eq!(results.counts[2].rank, 3);
        assert_eq!(results.counts[2].index, 1);
        assert_eq!(results.percentage(0), 66.7);
    }

    #[test]
    fn no_votes_means_no_winner() {
        let results = PollResults::from_runtime(&runtime());
        assert!(results.winners.is_empty());
        assert_eq!(results.percentage(1), 0.0);
    }
}
