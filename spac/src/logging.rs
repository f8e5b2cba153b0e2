use crate::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const METRICS_PREFIX: &str = "spac";

#[derive(thiserror::Error, Debug)]
pub enum MetricsInitError {
    #[error("could not build statsd exporter: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Installs the global tracing subscriber. `RUST_LOG` controls the filter, `info` when unset.
///
/// With a Sentry DSN configured, errors and warnings are also reported to Sentry. The
/// returned guard flushes pending events when dropped and must be kept alive.
pub fn init(config: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = config
        .and_then(|c| c.sentry_dsn.as_deref())
        .map(|dsn| {
            sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            ))
        });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(sentry_layer)
        .try_init();

    guard
}

/// Sends metrics to statsd. Without a metrics section every metric is discarded.
pub fn init_metrics(config: Option<&MetricsConfig>) -> Result<(), MetricsInitError> {
    let Some(config) = config else {
        tracing::debug!("metrics not configured");
        return Ok(());
    };

    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(METRICS_PREFIX))?;
    metrics::set_global_recorder(recorder).map_err(|_| MetricsInitError::AlreadyInstalled)?;

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "sending metrics to statsd"
    );
    Ok(())
}
