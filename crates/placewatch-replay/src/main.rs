//! placewatch-replay - scenario replay harness
//!
//! Drives the engine against a scripted surface from a JSON scenario file and
//! streams monitor events as JSON lines on stdout.
//!
//! Usage:
//!   placewatch-replay scenario.json
//!   placewatch-replay scenario.json --retry-ceiling 5 --settle-ms 0

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use placewatch_core::{
    MissingDetail, MonitorOptions, PlaceMonitor, ScriptedSurface, SurfaceTiming,
};

#[derive(Parser, Debug)]
#[command(name = "placewatch-replay")]
#[command(about = "Replay a place-watch scenario against a scripted surface")]
#[command(version)]
struct Args {
    /// Path to the scenario JSON file
    scenario: PathBuf,

    /// Delay between a navigation and the cycle start, in ms
    #[arg(long, default_value_t = 100)]
    settle_ms: u64,

    /// Max reconcile attempts per navigation
    #[arg(long, default_value_t = 3)]
    retry_ceiling: u32,

    /// Delay between failed attempts, in ms
    #[arg(long, default_value_t = 200)]
    backoff_ms: u64,
}

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    name: Option<String>,
    steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Step {
    /// Move the surface to a new location URL.
    Navigate { location: String },
    /// Set or clear the completeness banner text.
    SetBanner {
        #[serde(default)]
        text: Option<String>,
    },
    /// Replace the suggestion chips. Entries are the visible labels,
    /// e.g. "Add hours".
    SetSuggestions { suggestions: Vec<String> },
    /// Replace the set of lists the place is saved to.
    SetSavedLists { saved: Vec<String> },
    /// Replace the lists offered by the membership dialog.
    SetDialogEntries { lists: Vec<String> },
    /// Let the engine run for a while.
    Wait { ms: u64 },
}

async fn apply_step(surface: &ScriptedSurface, step: Step) {
    match step {
        Step::Navigate { location } => surface.set_location(location).await,
        Step::SetBanner { text } => surface.set_banner(text).await,
        Step::SetSuggestions { suggestions } => {
            // Chips render an icon glyph line above the visible label.
            let chips = suggestions.into_iter().map(|s| format!("edit\n{s}")).collect();
            surface.set_suggestions(chips).await;
        }
        Step::SetSavedLists { saved } => surface.set_saved(saved).await,
        Step::SetDialogEntries { lists } => surface.set_lists(lists).await,
        Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
    }
}

/// Poll until no operation token is live, bounded by a hard deadline.
async fn wait_for_quiescence(monitor: &PlaceMonitor) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if monitor.tokens().live_count().await == 0 {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Run a scenario to quiescence and return the lists the place ended up
/// saved to, sorted.
async fn run_scenario(scenario: Scenario, options: MonitorOptions) -> Result<Vec<String>> {
    if let Some(name) = &scenario.name {
        info!(scenario = %name, steps = scenario.steps.len(), "replaying scenario");
    }

    // A navigation mints its token on the watcher task; give the last step
    // time to land before reading zero live tokens as done.
    let grace = Duration::from_millis(options.settle_before_cycle_ms + 100);

    let surface = Arc::new(ScriptedSurface::new());
    // Scenarios that never call set_dialog_entries still get the standard
    // bookkeeping lists.
    surface
        .set_lists(MissingDetail::ALL.iter().map(|d| d.label().to_string()).collect())
        .await;

    let monitor = PlaceMonitor::new(surface.clone(), options);
    let mut events = monitor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "failed to encode event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    monitor.start().await?;

    for (index, step) in scenario.steps.into_iter().enumerate() {
        debug!(index, ?step, "applying step");
        apply_step(&surface, step).await;
    }

    tokio::time::sleep(grace).await;
    if !wait_for_quiescence(&monitor).await {
        warn!("reconcile cycles still live at deadline");
    }
    monitor.stop().await;

    let mut saved: Vec<String> = surface.saved().await.into_iter().collect();
    saved.sort();
    Ok(saved)
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("PLACEWATCH_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let text = std::fs::read_to_string(&args.scenario)
        .with_context(|| format!("reading scenario {}", args.scenario.display()))?;
    let scenario: Scenario = serde_json::from_str(&text).context("parsing scenario file")?;

    let options = MonitorOptions {
        timing: SurfaceTiming::immediate(),
        settle_before_cycle_ms: args.settle_ms,
        retry_ceiling: args.retry_ceiling,
        retry_backoff_ms: args.backoff_ms,
        ..MonitorOptions::default()
    };

    let saved = run_scenario(scenario, options).await?;
    println!(
        "{}",
        serde_json::to_string(&serde_json::json!({ "type": "final_state", "saved": saved }))?
    );
    Ok(())
}
