mod admin_service;
pub mod config;
pub mod errors;
mod forward;
mod headers;
mod metrics_defs;
pub mod pac;
mod pattern;
pub mod policy;
mod proxy_service;
mod reachability;
mod rules_engine;
mod selector;
pub mod upstreams;
mod utils;

use admin_service::{AdminPages, AdminService};
use config::{Config, SpacConfig};
use errors::ProxyError;
use forward::Forwarder;
use pac::PacCompiler;
use policy::{PolicyStore, RoutingPolicy};
use proxy_service::ProxyService;
use reachability::HostsProber;
use selector::{LocalEndpoint, ProxySelector};
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;
use upstreams::{Capabilities, HandlerRegistry};

/// Serves the proxy and admin listeners until one of them fails.
///
/// Upstream handlers, e.g. tunnel connection managers, must be registered in `registry`
/// before calling this; names in the routing rules resolve against it.
pub async fn run(config: Config, registry: Arc<HandlerRegistry>) -> Result<(), ProxyError> {
    config.validate()?;

    let capabilities = Capabilities::from_config(&config);
    let policy = Arc::new(PolicyStore::new(RoutingPolicy::load(
        &config.spac,
        &capabilities,
    )?));
    let pac_file = config.spac.gfwlist.as_ref().map(|gfwlist| {
        let compiler = PacCompiler::new(gfwlist, config.listener.port);
        let output = compiler.output().to_path_buf();
        compiler.spawn_refresh(gfwlist.refresh_interval_secs.map(Duration::from_secs));
        output
    });
    let admin = Arc::new(AdminPages::new(policy.clone(), pac_file));

    let mut selector = ProxySelector::new(
        policy.clone(),
        registry,
        capabilities.clone(),
        LocalEndpoint::detect(&config.listener.host, config.listener.port),
        admin.clone(),
    );
    if config.hosts.enabled {
        selector = selector.with_prober(
            Arc::new(HostsProber::from_config(&config.hosts)),
            Duration::from_millis(config.hosts.probe_timeout_ms),
        );
    }

    spawn_reload_on_hangup(policy, config.spac.clone(), capabilities);

    let proxy_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        ProxyService::new(selector, Forwarder::new(&config.forward)?),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::new(admin),
    );

    tokio::try_join!(proxy_task, admin_task)?;
    Ok(())
}

/// Rebuilds the routing policy, re-reading the rule list file, on SIGHUP.
#[cfg(unix)]
fn spawn_reload_on_hangup(policy: Arc<PolicyStore>, spac: SpacConfig, capabilities: Capabilities) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!(error = %e, "could not install SIGHUP handler, policy reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, reloading routing policy");
            // Failures are logged by the store and the active policy stays in place
            let _ = policy.reload(&spac, &capabilities);
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_policy: Arc<PolicyStore>, _spac: SpacConfig, _capabilities: Capabilities) {}
