use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::metadata::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gaffer::buildid::TotClient;
use gaffer::cluster::KubeOrchestrator;
use gaffer::config::Config;
use gaffer::controller::Controller;
use gaffer::forge::GithubForge;

pub mod opts;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = opts::Opts::parse();

    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true))
        .with(log_filter)
        .init();

    let config = Arc::new(Config::from_path(&opts.config)?);

    let client = kube::Client::try_default().await?;
    let orchestrator = Arc::new(KubeOrchestrator::new(client, &opts.namespace));
    let forge = Arc::new(GithubForge::new(
        opts.github_endpoint.clone(),
        opts.github_token.clone(),
    ));
    let build_ids = Arc::new(TotClient::new(opts.tot_url.clone()));

    let (reports_tx, mut reports_rx) = mpsc::channel::<gaffer::resources::CiJob>(opts.report_buffer);
    tokio::spawn(async move {
        while let Some(job) = reports_rx.recv().await {
            info!(
                job = job.metadata.name.as_str(),
                state = %job.status.state,
                url = job.status.url.as_str(),
                "Job state changed"
            );
        }
    });

    let controller = Controller::new(orchestrator, forge, build_ids, config, reports_tx);

    info!(period = opts.sync_period_seconds, "Starting controller");
    let mut ticker = tokio::time::interval(Duration::from_secs(opts.sync_period_seconds));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = controller.sync().await {
                    error!(%err, "Sync tick failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}
