use anyhow::Context;
use certsync::authority::LegoAuthority;
use certsync::certificate::Certificate;
use certsync::cli::Command;
use certsync::config::{self, Configuration};
use certsync::service::LifecycleService;
use certsync::{CRATE_NAME, store};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ENV_FILTER_NAME: &str = "CERTSYNC_LOG";

#[derive(Debug, Parser)]
#[command(version, about, long_about = "")]
struct CommandLineArguments {
    /// Path to a TOML configuration file. Command line arguments override its settings.
    #[arg(long, env = "CERTSYNC_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
    /// Shorthand option to enable debug logging (logging can be fine-tuned via `CERTSYNC_LOG` environment variable)
    #[clap(long, short, action)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CommandLineArguments::parse();
    let filter = EnvFilter::try_from_env(ENV_FILTER_NAME).unwrap_or_else(|_| {
        EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "certsync=debug,info" } else { "info" }))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = config::load(cli.config.as_deref())?;
    cli.command.common().apply_to(&mut config);
    match cli.command {
        Command::Run(cmd) => {
            config.validate()?;
            run(&config, cmd.output).await
        }
        Command::Renew(_) => {
            config.validate()?;
            let service = build_service(&config).await?;
            let certificate = service.renew_now().await?;
            info!(
                "Renewed certificate for {} (revision {})",
                certificate.domains().join(", "),
                certificate.revision.unwrap_or_default()
            );
            Ok(())
        }
        Command::Config(_) => {
            print!("{}", config::render(&config)?);
            Ok(())
        }
    }
}

async fn build_service(config: &Configuration) -> anyhow::Result<LifecycleService> {
    let store = store::open(&config.store_endpoints, config.store_timeout).context("Opening the store failed")?;
    let authority = Arc::new(LegoAuthority::new(
        config.lego_binary.clone(),
        config.acme_server.clone(),
        config.key_type,
        config.solver.clone(),
    ));
    let options = config.lifecycle_options().await?;
    Ok(LifecycleService::new(store, authority, options))
}

async fn run(config: &Configuration, output: Option<PathBuf>) -> anyhow::Result<()> {
    let service = build_service(config).await?;
    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                ctrl_c.cancel();
            }
            Err(e) => error!("Cannot listen for Ctrl-C, {CRATE_NAME} must be stopped otherwise: {e}"),
        }
    });

    let (deliveries, mut received) = mpsc::channel::<Certificate>(1);
    let pem = config.pem;
    let consumer = tokio::spawn(async move {
        while let Some(certificate) = received.recv().await {
            let domains = certificate.domains().join(", ");
            let Some(directory) = &output else {
                info!("Certificate for {domains} is current");
                continue;
            };
            match certificate.export(directory, pem).await {
                Ok(()) => info!("Wrote certificate for {domains} to {}", directory.display()),
                Err(e) => error!("Writing certificate for {domains} failed: {e:#}"),
            }
        }
    });

    let result = service.run(deliveries, stop).await;
    consumer.await.context("Certificate consumer failed")?;
    Ok(result?)
}
