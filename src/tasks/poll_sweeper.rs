use crate::polls::PollManager;
use log::{debug, info};
use std::sync::Weak;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Spawns the periodic sweep. The task holds only a weak handle and exits
/// once the manager is dropped.
pub fn spawn_sweeper(manager: Weak<PollManager>, period: StdDuration) -> JoinHandle<()> {
    tokio::spawn(run_sweeper(manager, period))
}

pub async fn run_sweeper(manager: Weak<PollManager>, period: StdDuration) {
    info!("Starting poll sweep every {}s", period.as_secs());
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(manager) = manager.upgrade() else {
            debug!("Poll manager dropped, stopping sweep");
            break;
        };

        let report = manager.sweep_once().await;
        if report.closed > 0 || report.reaped > 0 {
            info!(
                "Sweep closed {} poll(s) and reaped {} poll(s)",
                report.closed, report.reaped
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::db::FileStorage;
    use crate::models::{Poll, PollOption, PollRules};
    use chrono::Duration;
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[tokio::test]
    async fn sweeper_stops_when_manager_is_dropped() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
        let manager = Arc::new(PollManager::new(storage, ManagerConfig::default()));

        let handle = spawn_sweeper(Arc::downgrade(&manager), StdDuration::from_millis(10));
        drop(manager);

        tokio::time::timeout(StdDuration::from_secs(2), handle)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn sweeper_closes_overdue_polls() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
        let manager = Arc::new(PollManager::new(storage, ManagerConfig::default()));

        let mut poll = Poll::new(
            Uuid::new_v4(),
            None,
            "Already over?".to_string(),
            vec![PollOption::new(0, "a", None), PollOption::new(1, "b", None)],
            PollRules::single_choice(),
            Duration::minutes(1),
        );
        poll.closes_at = poll.created_at - Duration::seconds(1);
        let id = manager.register_poll(poll.owner, poll).await.unwrap();

        let handle = spawn_sweeper(Arc::downgrade(&manager), StdDuration::from_millis(10));
        for _ in 0..100 {
            if manager.get(id).unwrap().is_closed() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        handle.abort();

        assert!(manager.get(id).unwrap().is_closed());
    }
}
