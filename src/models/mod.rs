use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type PollId = Uuid;
pub type VoterId = Uuid;

/// The option indices one voter currently has chosen. Empty means "not voted".
pub type Selection = BTreeSet<usize>;

/// Upper bound on options per poll, also the ceiling for `max_selections`.
pub const MAX_OPTIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub readable_id: String,
    pub owner: Uuid,
    pub question: String,
    pub created_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub options: Vec<PollOption>,
    pub rules: PollRules,
    pub closed: bool,
}

/// A single answer. `votes` is a derived read cache and is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub index: usize,
    pub label: String,
    pub tooltip: Option<String>,
    pub votes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRules {
    pub multiple_choice: bool,
    pub max_selections: usize,
    pub allow_resubmissions: bool,
    pub can_view_results: bool,
}

/// Per-viewer permission overrides. Applied on read, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleOverrides {
    pub multiple_choice: bool,
    pub resubmit: bool,
    pub view_results: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteStatus {
    Accepted,
    RejectedClosed,
    RejectedRules,
    NoOp,
    Rollback,
    NotFound,
}

/// Outcome of one vote attempt; `selection` is the voter's server-side truth afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResult {
    pub poll_id: PollId,
    pub status: VoteStatus,
    pub selection: Selection,
    pub message: String,
}

/// Build request handed over by the creation UI.
#[derive(Debug, Clone)]
pub struct PollDraft {
    pub readable_id: Option<String>,
    pub question: String,
    pub options: Vec<OptionDraft>,
    pub duration: Duration,
    pub multiple_choice: bool,
    pub max_selections: usize,
    pub allow_resubmissions: bool,
    pub can_view_results: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OptionDraft {
    pub label: String,
    pub tooltip: Option<String>,
}

impl Poll {
    pub fn new(
        owner: Uuid,
        readable_id: Option<String>,
        question: String,
        options: Vec<PollOption>,
        rules: PollRules,
        duration: Duration,
    ) -> Self {
        let id = Uuid::new_v4();
        let now = truncate_to_millis(Utc::now());
        let closes_at = truncate_to_millis(now + duration);

        Self {
            id,
            readable_id: readable_id.unwrap_or_else(|| id.to_string()),
            owner,
            question,
            created_at: now,
            closes_at,
            closed_at: None,
            options,
            rules,
            closed: false,
        }
    }

    pub fn option_count(&self) -> usize {
        self.options.len()
    }

    /// Open but past its scheduled close.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.closed && now >= self.closes_at
    }

    /// Reference point for the retention window of a closed poll.
    pub fn closed_reference(&self) -> DateTime<Utc> {
        self.closed_at.unwrap_or(self.closes_at)
    }
}

impl PollOption {
    pub fn new(index: usize, label: impl Into<String>, tooltip: Option<String>) -> Self {
        Self {
            index,
            label: label.into(),
            tooltip,
            votes: 0,
        }
    }

    pub fn with_votes(&self, votes: u32) -> Self {
        Self {
            votes,
            ..self.clone()
        }
    }
}

impl PollRules {
    pub fn single_choice() -> Self {
        Self {
            multiple_choice: false,
            max_selections: 1,
            allow_resubmissions: true,
            can_view_results: true,
        }
    }

    pub fn effective(&self, overrides: &RuleOverrides) -> PollRules {
        let multiple_choice = self.multiple_choice || overrides.multiple_choice;
        PollRules {
            multiple_choice,
            max_selections: if multiple_choice {
                self.max_selections.max(1)
            } else {
                1
            },
            allow_resubmissions: self.allow_resubmissions || overrides.resubmit,
            can_view_results: self.can_view_results || overrides.view_results,
        }
    }

    /// How many options a voter may hold at once under these rules.
    pub fn selection_cap(&self) -> usize {
        if self.multiple_choice {
            self.max_selections.max(1)
        } else {
            1
        }
    }
}

impl VoteStatus {
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            VoteStatus::RejectedClosed | VoteStatus::RejectedRules | VoteStatus::NotFound
        )
    }
}

impl VoteResult {
    pub fn new(
        poll_id: PollId,
        status: VoteStatus,
        selection: Selection,
        message: impl Into<String>,
    ) -> Self {
        Self {
            poll_id,
            status,
            selection,
            message: message.into(),
        }
    }
}

// Both backends persist epoch millis, so in-memory timestamps are kept at the same precision.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_rules_apply_overrides() {
        let rules = PollRules {
            multiple_choice: false,
            max_selections: 3,
            allow_resubmissions: false,
            can_view_results: false,
        };

        let plain = rules.effective(&RuleOverrides::default());
        assert!(!plain.multiple_choice);
        assert_eq!(plain.max_selections, 1);
        assert!(!plain.allow_resubmissions);

        let relaxed = rules.effective(&RuleOverrides {
            multiple_choice: true,
            resubmit: true,
            view_results: true,
        });
        assert!(relaxed.multiple_choice);
        assert_eq!(relaxed.max_selections, 3);
        assert!(relaxed.allow_resubmissions);
        assert!(relaxed.can_view_results);
        // stored rules untouched
        assert!(!rules.multiple_choice);
    }

    #[test]
    fn new_poll_defaults_readable_id_to_uuid() {
        let poll = Poll::new(
            Uuid::new_v4(),
            None,
            "Lunch?".to_string(),
            vec![PollOption::new(0, "Pizza", None), PollOption::new(1, "Tacos", None)],
            PollRules::single_choice(),
            Duration::minutes(5),
        );

        assert_eq!(poll.readable_id, poll.id.to_string());
        assert!(!poll.closed);
        assert!(poll.closed_at.is_none());
        assert_eq!(poll.closes_at - poll.created_at, Duration::minutes(5));
        assert_eq!(poll.created_at, truncate_to_millis(poll.created_at));
    }

    #[test]
    fn closed_reference_prefers_actual_close() {
        let mut poll = Poll::new(
            Uuid::new_v4(),
            None,
            "Q".to_string(),
            vec![PollOption::new(0, "a", None), PollOption::new(1, "b", None)],
            PollRules::single_choice(),
            Duration::minutes(1),
        );
        assert_eq!(poll.closed_reference(), poll.closes_at);

        let early = poll.created_at;
        poll.closed_at = Some(early);
        assert_eq!(poll.closed_reference(), early);
    }
}
