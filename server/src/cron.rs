use std::time::Duration;

use tracing::{error, info};

use crate::state::AppState;

/// How often expired pending requests and abandoned keys are swept
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_cron(app_state: AppState) -> color_eyre::Result<()> {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        purge_expired(&app_state).await;
    }
}

async fn purge_expired(state: &AppState) {
    match state.store.purge_expired().await {
        Ok(0) => {}
        Ok(count) => info!(count, "Purged expired OAuth state"),
        Err(err) => error!("Failed to purge expired OAuth state: {:?}", err),
    }
}
