use std::{env, path::PathBuf, process::ExitCode};

use anyhow::Result;
use csvclean::{
    config::{JobConfig, ProcessEnv},
    BatchJob,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,csvclean=info"));
    fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "job failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // ─── 2) load config ──────────────────────────────────────────────
    // first CLI argument wins over CSVCLEAN_CONFIG
    let config_path: Option<PathBuf> = env::args()
        .nth(1)
        .or_else(|| env::var("CSVCLEAN_CONFIG").ok())
        .map(PathBuf::from);
    let config = JobConfig::load(config_path.as_deref(), &ProcessEnv)?;
    info!(
        app = %config.app_name,
        input = %config.input.location,
        output = %config.output.location,
        "config loaded"
    );

    // ─── 3) run the job ──────────────────────────────────────────────
    let summary = BatchJob::new(config).run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
