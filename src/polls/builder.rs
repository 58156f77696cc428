use crate::error::PollError;
use crate::models::{Poll, PollDraft, PollOption, PollRules, MAX_OPTIONS};
use chrono::Duration;
use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

lazy_static! {
    static ref READABLE_ID: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,32}$").unwrap();
}

pub const MIN_OPTIONS: usize = 2;

/// Turns a creation request into a poll ready for registration.
pub fn build_poll(creator: Uuid, draft: PollDraft) -> Result<Poll, PollError> {
    let question = draft.question.trim();
    if question.is_empty() {
        return Err(PollError::Validation("Question cannot be empty".to_string()));
    }
    if draft.options.len() < MIN_OPTIONS {
        return Err(PollError::Validation(format!(
            "At least {} options are required",
            MIN_OPTIONS
        )));
    }
    if draft.options.len() > MAX_OPTIONS {
        return Err(PollError::Validation(format!(
            "At most {} options are allowed",
            MAX_OPTIONS
        )));
    }

    let readable_id = match draft.readable_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(id) if READABLE_ID.is_match(id) => Some(id.to_string()),
        Some(id) => {
            return Err(PollError::Validation(format!(
                "Poll id {:?} may only use letters, digits, '-' and '_' (max 32)",
                id
            )));
        }
    };

    let mut options = Vec::with_capacity(draft.options.len());
    for (index, option) in draft.options.into_iter().enumerate() {
        let label = option.label.trim();
        if label.is_empty() {
            return Err(PollError::Validation(format!("Option {} has no label", index + 1)));
        }
        let tooltip = option
            .tooltip
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        options.push(PollOption::new(index, label, tooltip));
    }

    let duration = draft.duration.max(Duration::minutes(1));
    let rules = PollRules {
        multiple_choice: draft.multiple_choice,
        max_selections: draft.max_selections.clamp(1, MAX_OPTIONS),
        allow_resubmissions: draft.allow_resubmissions,
        can_view_results: draft.can_view_results,
    };

    Ok(Poll::new(
        creator,
        readable_id,
        question.to_string(),
        options,
        rules,
        duration,
    ))
}

/// Structural checks applied to any poll before it is persisted.
pub fn validate_poll(poll: &Poll) -> Result<(), PollError> {
    if poll.options.len() < MIN_OPTIONS {
        return Err(PollError::Validation(format!(
            "Poll {} has fewer than {} options",
            poll.readable_id, MIN_OPTIONS
        )));
    }
    if let Some((position, option)) = poll
        .options
        .iter()
        .enumerate()
        .find(|(position, option)| option.index != *position)
    {
        return Err(PollError::Validation(format!(
            "Option at position {} has index {}",
            position, option.index
        )));
    }
    if poll.question.trim().is_empty() {
        return Err(PollError::Validation("Question cannot be empty".to_string()));
    }
    Ok(())
}
