use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kwd_sync::{Engine, EngineConfig, LifecyclePolicy, TrendInput};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "kwd-cli")]
#[command(about = "Keyword demand engine command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Grow, certify and score categories, then write a report directory.
    Grow {
        /// Category ids; every configured category when omitted.
        categories: Vec<String>,
        /// Downgrade certified snapshots to HYDRATED instead of refusing to grow them.
        #[arg(long)]
        downgrade: bool,
    },
    /// Re-run certification on the latest snapshot of a category.
    Certify { category: String },
    /// Print the calibrated metrics object for a category.
    Metrics {
        category: String,
        /// Historical trend in percent; defaults to the category benchmark.
        #[arg(long, allow_hyphen_values = true)]
        trend: Option<f64>,
        #[arg(long)]
        label: Option<String>,
    },
    /// Summarize the most recent batch runs as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Serve the read-only HTTP API until interrupted.
    Serve,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn engine_from_env(config: EngineConfig) -> Result<Arc<Engine>> {
    Ok(Arc::new(
        Engine::from_config(config).context("loading keyword demand engine")?,
    ))
}

async fn grow(categories: Vec<String>, downgrade: bool) -> Result<()> {
    let engine = engine_from_env(EngineConfig::from_env())?;
    let ids = if categories.is_empty() {
        engine.catalog().ids()
    } else {
        categories
    };
    let policy = if downgrade {
        LifecyclePolicy::DowngradeAndGrow
    } else {
        LifecyclePolicy::RefuseCertified
    };

    let stops = engine.stops().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping all category runs after the current batch");
            stops.stop_all();
        }
    });
    let outcome = engine.run_and_report(&ids, policy).await;
    interrupt.abort();
    let outcome = outcome?;

    for category in &outcome.report.categories {
        let demand = category
            .metrics
            .as_ref()
            .map(|m| m.display.demand_index.display.clone())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<10} lifecycle={:<15} demand={}{}",
            category.category_id,
            category.status.as_str(),
            category.lifecycle.map(|l| l.as_str()).unwrap_or("-"),
            demand,
            category
                .error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
    println!(
        "batch complete: run_id={} reports={}",
        outcome.report.run_id,
        outcome.report.reports_dir.as_deref().unwrap_or("-")
    );
    Ok(())
}

async fn schedule() -> Result<()> {
    let mut config = EngineConfig::from_env();
    config.scheduler_enabled = true;
    let engine = engine_from_env(config)?;
    let Some(mut scheduler) = kwd_sync::maybe_build_scheduler(Arc::clone(&engine)).await? else {
        return Ok(());
    };
    scheduler.start().await.context("starting scheduler")?;
    info!(cron = %engine.config().grow_cron, "scheduler running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    engine.stops().stop_all();
    scheduler.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Grow {
        categories: Vec::new(),
        downgrade: false,
    }) {
        Commands::Grow {
            categories,
            downgrade,
        } => grow(categories, downgrade).await?,
        Commands::Certify { category } => {
            let engine = engine_from_env(EngineConfig::from_env())?;
            match engine.certify_category(&category).await? {
                Some((report, snapshot)) => {
                    println!(
                        "{} snapshot={} lifecycle={}",
                        category,
                        snapshot.snapshot_id,
                        snapshot.lifecycle.as_str()
                    );
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                None => println!("{category}: no snapshot stored yet"),
            }
        }
        Commands::Metrics {
            category,
            trend,
            label,
        } => {
            let engine = engine_from_env(EngineConfig::from_env())?;
            let trend = match (trend, label) {
                (None, None) => None,
                (percent, label) => {
                    let fallback = engine
                        .catalog()
                        .category(&category)
                        .map(kwd_sync::default_trend)
                        .unwrap_or_default();
                    Some(TrendInput {
                        percent: percent.unwrap_or(fallback.percent),
                        label,
                    })
                }
            };
            match engine.metrics_for(&category, trend).await? {
                Some(metrics) => println!("{}", serde_json::to_string_pretty(&metrics)?),
                None => println!("{category}: no snapshot stored yet"),
            }
        }
        Commands::Report { runs, root } => {
            let root = root.or_else(|| Some(EngineConfig::from_env().workspace_root));
            print!("{}", kwd_sync::reports::report_markdown(runs, root)?);
        }
        Commands::Serve => kwd_web::serve_from_env().await?,
        Commands::Schedule => schedule().await?,
    }

    Ok(())
}
