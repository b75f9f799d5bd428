//! Offline project status: `autoforge status`.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use serde_json::json;

use autoforge::config::Config;
use autoforge::config::LoggingSection;
use autoforge::logging;
use autoforge::orchestrator::compute_phase;
use autoforge::orchestrator::lock::{self, LockState};
use autoforge::store::{SqliteFeatureStore, WorkItemStore};

use super::project_for;

pub async fn cmd_status(project_dir: &Path, verbose: bool, as_json: bool) -> Result<()> {
    let _guard = logging::init(&LoggingSection::default(), verbose, None)?;
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let project = project_for(&config);

    let store = SqliteFeatureStore::new(config.toml.store.database.clone());
    let counts = store
        .counts(&project)
        .await
        .context("Failed to read feature counts")?;
    // Without a live worker the last validation result is unknown.
    let next_phase = compute_phase(counts, false);
    let lock_state = lock::inspect(&project.dir);

    if as_json {
        let (agent, pid) = match &lock_state {
            LockState::Absent => ("not_running", None),
            LockState::Held(info) => ("running", info.as_ref().map(|i| i.pid)),
            LockState::Orphaned(info) => ("orphaned_lock", info.as_ref().map(|i| i.pid)),
        };
        let value = json!({
            "project": project.name,
            "agent": agent,
            "pid": pid,
            "total": counts.total,
            "passing": counts.passing,
            "next_phase": next_phase,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!();
    println!("{} {}", style("Project:").bold(), style(&project.name).cyan());
    println!("  {}", config.project_dir.display());
    println!();

    match &lock_state {
        LockState::Absent => println!("{} {}", style("Agent:").bold(), style("not running").dim()),
        LockState::Held(info) => {
            let detail = info
                .as_ref()
                .map(|i| format!(" (pid {}, since {})", i.pid, i.started_at.format("%Y-%m-%d %H:%M:%S")))
                .unwrap_or_default();
            println!("{} {}{}", style("Agent:").bold(), style("running").green(), detail);
        }
        LockState::Orphaned(info) => {
            let pid = info
                .as_ref()
                .map(|i| format!(" (pid {})", i.pid))
                .unwrap_or_default();
            println!(
                "{} {}{}",
                style("Agent:").bold(),
                style("orphaned run-lock").red(),
                pid
            );
            println!("  Run 'autoforge reconcile --clear' once no agent is running.");
        }
    }

    let percentage = if counts.total == 0 {
        0.0
    } else {
        counts.passing as f64 / counts.total as f64 * 100.0
    };
    println!(
        "{} {}/{} passing ({:.1}%)",
        style("Features:").bold(),
        counts.passing,
        counts.total,
        percentage
    );
    println!("{} {}", style("Next phase:").bold(), next_phase);
    println!();

    Ok(())
}
