use crate::error::PollError;
use crate::models::{PollId, RuleOverrides, Selection, VoteResult, VoteStatus, VoterId};
use crate::polls::PollManager;
use crate::voting::{PollResults, VoteManager};
use log::{info, warn};
use std::sync::Arc;

/// Entry points used by whatever front end renders polls: one struct holding
/// the registry and the vote pipeline.
pub struct PollService {
    manager: Arc<PollManager>,
    votes: VoteManager,
}

impl PollService {
    pub fn new(manager: Arc<PollManager>) -> Self {
        let votes = VoteManager::new(manager.storage());
        Self { manager, votes }
    }

    pub fn manager(&self) -> &Arc<PollManager> {
        &self.manager
    }

    /// Handles one click on an option.
    pub async fn submit_vote(
        &self,
        poll_id: PollId,
        voter: VoterId,
        option_index: usize,
        overrides: &RuleOverrides,
    ) -> VoteResult {
        let Some(runtime) = self.manager.get(poll_id) else {
            warn!("Vote from {} for unknown poll {}", voter, poll_id);
            return VoteResult::new(
                poll_id,
                VoteStatus::NotFound,
                Selection::new(),
                "Poll not found.",
            );
        };

        self.votes
            .attempt_vote_with(&runtime, voter, option_index, overrides)
            .await
    }

    /// The voter's current choice, or `None` for an unknown poll.
    pub fn selection_of(&self, poll_id: PollId, voter: VoterId) -> Option<Selection> {
        self.manager
            .get(poll_id)
            .map(|runtime| runtime.selection_snapshot(voter))
    }

    /// Current tallies, if this viewer may see them.
    pub fn results_for(
        &self,
        poll_id: PollId,
        overrides: &RuleOverrides,
    ) -> Result<Option<PollResults>, PollError> {
        let runtime = self.manager.get(poll_id).ok_or(PollError::NotFound(poll_id))?;
        let visible = runtime.is_closed() || runtime.rules().effective(overrides).can_view_results;
        Ok(visible.then(|| PollResults::from_runtime(&runtime)))
    }

    pub async fn close_poll(&self, poll_id: PollId) -> Result<(), PollError> {
        if self.manager.close(poll_id).await {
            Ok(())
        } else {
            Err(PollError::NotFound(poll_id))
        }
    }

    pub async fn delete_poll(&self, poll_id: PollId) -> Result<(), PollError> {
        if !self.manager.delete_poll(poll_id).await? {
            info!("Deleted poll {} which was not loaded in memory", poll_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::db::FileStorage;
    use crate::models::{Poll, PollOption, PollRules};
    use chrono::Duration;
    use tempfile::{tempdir, TempDir};
    use uuid::Uuid;

    async fn service(rules: PollRules) -> (TempDir, PollService, PollId) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
        let manager = Arc::new(PollManager::new(storage, ManagerConfig::default()));
        let poll = Poll::new(
            Uuid::new_v4(),
            None,
            "Tabs or spaces?".to_string(),
            vec![PollOption::new(0, "tabs", None), PollOption::new(1, "spaces", None)],
            rules,
            Duration::minutes(5),
        );
        let id = manager.register_poll(poll.owner, poll).await.unwrap();
        (dir, PollService::new(manager), id)
    }

    #[tokio::test]
    async fn unknown_poll_is_not_found() {
        let (_dir, service, _) = service(PollRules::single_choice()).await;
        let missing = Uuid::new_v4();

        let result = service
            .submit_vote(missing, Uuid::new_v4(), 0, &RuleOverrides::default())
            .await;
        assert_eq!(result.status, VoteStatus::NotFound);
        assert!(service.selection_of(missing, Uuid::new_v4()).is_none());
        assert!(matches!(service.close_poll(missing).await, Err(PollError::NotFound(_))));
    }

    #[tokio::test]
    async fn hidden_results_until_closed() {
        let mut rules = PollRules::single_choice();
        rules.can_view_results = false;
        let (_dir, service, id) = service(rules).await;
        let voter = Uuid::new_v4();

        let result = service.submit_vote(id, voter, 1, &RuleOverrides::default()).await;
        assert_eq!(result.status, VoteStatus::Accepted);
        assert_eq!(service.selection_of(id, voter), Some(Selection::from([1])));

        assert!(service.results_for(id, &RuleOverrides::default()).unwrap().is_none());
        let admin = RuleOverrides {
            view_results: true,
            ..RuleOverrides::default()
        };
        assert!(service.results_for(id, &admin).unwrap().is_some());

        service.close_poll(id).await.unwrap();
        let results = service
            .results_for(id, &RuleOverrides::default())
            .unwrap()
            .unwrap();
        assert!(results.closed);
        assert_eq!(results.winners, vec![1]);
    }

    #[tokio::test]
    async fn delete_then_vote_is_not_found() {
        let (_dir, service, id) = service(PollRules::single_choice()).await;
        service.delete_poll(id).await.unwrap();

        let result = service
            .submit_vote(id, Uuid::new_v4(), 0, &RuleOverrides::default())
            .await;
        assert_eq!(result.status, VoteStatus::NotFound);
        assert!(matches!(
            service.results_for(id, &RuleOverrides::default()),
            Err(PollError::NotFound(_))
        ));
    }
}
