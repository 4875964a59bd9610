//! shotdrift CLI - Main Entry Point
//!
//! Loads the runner configuration, runs the visual regression pipeline and
//! maps the run summary to a process exit code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use shotdrift_core::{
    BuildMetadata, PlaywrightRenderer, RenderRequest, Renderer, RunMode, RunnerConfig, ShotError, ShotResult,
    ShotRunner,
};
use tracing::{debug, info};

mod output;

/// Exit code for configuration, discovery and other fatal errors
const EXIT_FATAL: u8 = 2;

/// shotdrift - visual regression runner
#[derive(Parser)]
#[command(name = "shotdrift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, default_value = "shotdrift.toml", env = "SHOTDRIFT_CONFIG")]
    config: PathBuf,

    /// Write missing baselines instead of reporting them
    #[arg(long)]
    generate_only: bool,

    /// Do not fail the run on missing baselines
    #[arg(long)]
    tolerate_missing: bool,

    /// Captures in flight
    #[arg(long)]
    shot_concurrency: Option<usize>,

    /// Comparisons in flight
    #[arg(long)]
    compare_concurrency: Option<usize>,

    /// Output format
    #[arg(long, default_value = "table")]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Repository reported to the platform
    #[arg(long, env = "SHOTDRIFT_REPOSITORY")]
    repository: Option<String>,

    /// Commit reported to the platform
    #[arg(long, env = "SHOTDRIFT_COMMIT")]
    commit: Option<String>,

    /// Branch reported to the platform
    #[arg(long, env = "SHOTDRIFT_BRANCH")]
    branch: Option<String>,

    /// Build id on the platform; defaults to the run id
    #[arg(long, env = "SHOTDRIFT_BUILD_ID")]
    build_id: Option<String>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut RunnerConfig) {
        if self.generate_only {
            config.compare.mode = RunMode::GenerateOnly;
        }
        if self.tolerate_missing {
            config.compare.tolerate_missing_baselines = true;
        }
        if let Some(n) = self.shot_concurrency {
            config.concurrency.shot_concurrency = n;
        }
        if let Some(n) = self.compare_concurrency {
            config.concurrency.compare_concurrency = n;
        }
    }
}

/// Stand-in when every source is pre-rendered and no browser is needed
struct NoBrowser;

#[async_trait::async_trait]
impl Renderer for NoBrowser {
    async fn render(&self, request: &RenderRequest) -> ShotResult<Vec<u8>> {
        Err(ShotError::Playwright(format!("no browser available to render {}", request.url)))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    match run(&cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<u8> {
    let mut config = RunnerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    let needs_browser = config.catalog.storybook.is_some() || config.catalog.pages.is_some();
    let renderer: Arc<dyn Renderer> = if needs_browser {
        Arc::new(PlaywrightRenderer::new(&config.browser)?)
    } else {
        debug!("Only pre-rendered shots configured, not starting a browser");
        Arc::new(NoBrowser)
    };

    let runner = ShotRunner::new(config, renderer);
    let summary = runner.run().await?;

    output::print_summary(&summary, cli.format);
    runner.write_results(&summary)?;

    let build = BuildMetadata {
        repository: cli.repository.clone(),
        commit: cli.commit.clone(),
        branch: cli.branch.clone(),
        build_id: cli.build_id.clone().unwrap_or_else(|| summary.run_id.to_string()),
    };
    if let Some(report) = runner.upload(&summary, &build).await {
        output::print_upload(&report);
    }

    let code = summary.exit_code();
    info!("Exiting with code {}", code);
    Ok(code as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "shotdrift",
            "--config",
            "ci.yaml",
            "--generate-only",
            "--tolerate-missing",
            "--shot-concurrency",
            "2",
            "--format",
            "json",
        ]);
        let mut config = RunnerConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(cli.config, PathBuf::from("ci.yaml"));
        assert_eq!(config.compare.mode, RunMode::GenerateOnly);
        assert!(config.compare.tolerate_missing_baselines);
        assert_eq!(config.concurrency.shot_concurrency, 2);
        assert_eq!(config.concurrency.compare_concurrency, 10);
    }

    #[test]
    fn test_defaults_leave_config_alone() {
        let cli = Cli::parse_from(["shotdrift"]);
        let mut config = RunnerConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.compare.mode, RunMode::Compare);
        assert!(!config.compare.tolerate_missing_baselines);
    }
}
