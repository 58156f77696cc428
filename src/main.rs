use log::{error, info, warn};
use std::sync::Arc;
use trusty_polls::config::AppConfig;
use trusty_polls::db::open_storage;
use trusty_polls::handlers::PollService;
use trusty_polls::polls::{PollEvent, PollManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env();

    let storage = match open_storage(&config.storage).await {
        Ok(storage) => storage,
        Err(e) => {
            error!("Failed to open poll storage: {}", e);
            return Err(e.into());
        }
    };

    let manager = Arc::new(PollManager::new(storage, config.manager.clone()));
    let mut events = manager.subscribe();
    manager.start().await?;

    let service = PollService::new(Arc::clone(&manager));
    info!(
        "Poll service running with {} active poll(s)",
        service.manager().active().len()
    );

    let listener = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PollEvent::Registered { poll_id } => info!("Poll {} is live", poll_id),
                PollEvent::Closed { poll_id, voters } => {
                    info!("Poll {} closed, notifying {} voter(s)", poll_id, voters.len())
                }
                PollEvent::Deleted { poll_id } => info!("Poll {} deleted", poll_id),
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    manager.shutdown();
    listener.abort();
    Ok(())
}
