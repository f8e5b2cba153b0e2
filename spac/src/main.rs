mod config;
mod logging;

use clap::{Args, Parser};
use config::{Config, ConfigError};
use logging::MetricsInitError;
use proxy::config::ValidationError;
use proxy::errors::ProxyError;
use proxy::pac::{PacCompiler, PacError};
use proxy::policy::{PolicyError, RoutingPolicy};
use proxy::upstreams::{Capabilities, HandlerRegistry};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "spac", about = "Rule based HTTP forwarding proxy")]
enum CliCommand {
    /// Run the proxy and its administration listener
    Proxy(ConfigArgs),
    /// Generate the PAC file from the configured rule list once and exit
    Pac(ConfigArgs),
    /// Validate the configuration and load the routing policy without serving
    Check(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short, default_value = "spac.yaml")]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metrics(#[from] MetricsInitError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Pac(#[from] PacError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("no gfwlist section in the spac configuration")]
    NoRuleList,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliCommand::parse();
    let args = match &cli {
        CliCommand::Proxy(args) | CliCommand::Pac(args) | CliCommand::Check(args) => args,
    };

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let _sentry = logging::init(config.common.logging.as_ref());

    let result = match cli {
        CliCommand::Proxy(_) => run_proxy(config).await,
        CliCommand::Pac(_) => generate_pac(&config).await,
        CliCommand::Check(_) => check(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "spac failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_proxy(config: Config) -> Result<(), CliError> {
    logging::init_metrics(config.common.metrics.as_ref())?;
    tracing::info!(
        host = %config.proxy.listener.host,
        port = config.proxy.listener.port,
        "starting proxy"
    );
    // No tunnel handlers are built into the binary
    let registry = Arc::new(HandlerRegistry::new());
    proxy::run(config.proxy, registry).await?;
    Ok(())
}

async fn generate_pac(config: &Config) -> Result<(), CliError> {
    let gfwlist = config.proxy.spac.gfwlist.as_ref().ok_or(CliError::NoRuleList)?;
    let compiler = PacCompiler::new(gfwlist, config.proxy.listener.port);
    compiler.compile().await?;
    println!("{}", compiler.output().display());
    Ok(())
}

fn check(config: &Config) -> Result<(), CliError> {
    config.proxy.validate()?;
    let capabilities = Capabilities::from_config(&config.proxy);
    let policy = RoutingPolicy::load(&config.proxy.spac, &capabilities)?;
    println!(
        "ok: {} rules, default target {}",
        policy.rules().len(),
        policy.default_target()
    );
    Ok(())
}
