use std::fs;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{error, info};

use hub_harvest::{
    init_tracing, ApiBackend, AppConfig, Cache, ProgressReporter, RequestBudget, ResultRow,
    RunOptions, RunSession, SearchProfile,
};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match execute().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "run failed");
            eprintln!("hub-harvest: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn execute() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    info!(config = ?config.public_profile(), "configuration loaded");

    let profile = SearchProfile::load(&config.profile_path).context("loading search profile")?;
    profile.validate().context("validating search profile")?;
    let options = RunOptions::from_config(&config, &profile).context("resolving run options")?;

    let cache = Arc::new(
        Cache::open(&config.cache_path, config.cache_commit_every)
            .with_context(|| format!("opening cache at {}", config.cache_path.display()))?,
    );
    let budget = Arc::new(RequestBudget::new(
        config.max_search_requests,
        config.max_travel_requests,
    ));
    let progress = ProgressReporter::with_sink(
        &config.output_dir,
        config.progress_log_every,
        config.progress_batch_size,
    )
    .context("preparing output directory")?;
    let backend = ApiBackend::from_config(&config, &profile, Arc::clone(&cache), Arc::clone(&budget))?;
    let session = RunSession::new(budget, cache, progress);

    let result = hub_harvest::run(&profile, &backend, &session, &options).await?;

    let rows: Vec<&ResultRow> = result.accepted.iter().chain(&result.rejected).collect();
    write_json(&config.output_dir.join("results.json"), &rows)?;
    write_json(&config.output_dir.join("summary.json"), &result.summary)?;
    if let Some(report) = &result.summary.coverage_report {
        write_json(&config.output_dir.join("coverage.json"), report)?;
    }
    info!(
        output_dir = %config.output_dir.display(),
        accepted = result.summary.accepted,
        rejected = result.summary.rejected,
        "outputs written"
    );
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let contents = serde_json::to_vec_pretty(value)?;
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
