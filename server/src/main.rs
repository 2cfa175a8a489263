use tokio::net::TcpListener;
use tracing::info;

use trainers_auth::{
    routes,
    setup::{setup_sentry, setup_tracing},
    state::AppState,
};

fn main() -> color_eyre::Result<()> {
    // Initialize Sentry for error tracking
    let _sentry_guard = setup_sentry();

    // Create and run the tokio runtime
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?
        .block_on(async { run_application().await })
}

async fn run_application() -> color_eyre::Result<()> {
    setup_tracing("trainers_auth")?;

    let app_state = AppState::from_env().await?;

    info!("Spawning application tasks");
    let futures = spawn_application_tasks(app_state).await?;

    // Wait for all tasks to complete
    futures::future::try_join_all(futures)
        .await?
        .into_iter()
        .collect::<color_eyre::Result<Vec<()>>>()?;

    Ok(())
}

async fn run_server(app_state: AppState) -> color_eyre::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], app_state.config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, routes::routes(app_state)).await?;
    Ok(())
}

/// Spawn all application background tasks
async fn spawn_application_tasks(
    app_state: AppState,
) -> color_eyre::Result<Vec<tokio::task::JoinHandle<color_eyre::Result<()>>>> {
    let mut futures = vec![];

    if is_feature_enabled("SERVER") {
        info!("Server Enabled");
        futures.push(tokio::spawn(run_server(app_state.clone())));
    } else {
        info!("Server Disabled");
    }

    if is_feature_enabled("CRON") {
        info!("Cron Enabled");
        futures.push(tokio::spawn(trainers_auth::run_cron(app_state.clone())));
    } else {
        info!("Cron Disabled");
    }

    info!("All application tasks spawned successfully");
    Ok(futures)
}

/// Check if a feature is enabled based on environment variables
fn is_feature_enabled(feature: &str) -> bool {
    std::env::var(format!("{}_DISABLED", feature)).unwrap_or_else(|_| "false".to_string()) != "true"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn feature_enabled_when_env_var_not_set() {
        env::remove_var("UNSET_FEATURE_DISABLED");

        assert!(is_feature_enabled("UNSET_FEATURE"));
    }

    #[test]
    fn feature_enabled_when_env_var_is_false() {
        env::set_var("FALSE_FEATURE_DISABLED", "false");

        assert!(is_feature_enabled("FALSE_FEATURE"));

        env::remove_var("FALSE_FEATURE_DISABLED");
    }

    #[test]
    fn feature_disabled_when_env_var_is_true() {
        env::set_var("TRUE_FEATURE_DISABLED", "true");

        assert!(!is_feature_enabled("TRUE_FEATURE"));

        env::remove_var("TRUE_FEATURE_DISABLED");
    }

    #[test]
    fn feature_enabled_with_other_values() {
        env::set_var("OTHER_FEATURE_DISABLED", "yes");

        assert!(is_feature_enabled("OTHER_FEATURE"));

        env::remove_var("OTHER_FEATURE_DISABLED");
    }
}
