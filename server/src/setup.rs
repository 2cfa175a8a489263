use color_eyre::eyre::WrapErr;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};
use tracing_tree::HierarchicalLayer;

/// Install `color_eyre` and a hierarchical `tracing` subscriber filtered by `RUST_LOG`
pub fn setup_tracing(crate_name: &str) -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("info,{crate_name}=info,tower_http=debug")))
        .wrap_err("Invalid RUST_LOG filter")?;

    let tree = HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(tree)
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    Ok(())
}

/// Report errors to Sentry when `SENTRY_DSN` is set. Keep the guard alive for
/// the life of the process.
pub fn setup_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 0.1,
            ..Default::default()
        },
    )))
}
