//! Orphaned run-lock report: `autoforge reconcile`.

use std::path::Path;

use anyhow::Result;
use console::style;

use autoforge::config::{Config, LoggingSection};
use autoforge::logging;
use autoforge::orchestrator::reconcile_locks;

use super::project_for;

pub fn cmd_reconcile(project_dir: &Path, verbose: bool, clear: bool) -> Result<()> {
    let _guard = logging::init(&LoggingSection::default(), verbose, None)?;
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let project = project_for(&config);

    let orphaned = reconcile_locks(std::slice::from_ref(&project), clear);
    if orphaned.is_empty() {
        println!("No orphaned run-locks.");
        return Ok(());
    }

    for lock in &orphaned {
        let pid = lock
            .pid
            .map(|p| format!("pid {}", p))
            .unwrap_or_else(|| "unknown pid".to_string());
        let action = if lock.cleared {
            style("cleared").green()
        } else {
            style("left in place").yellow()
        };
        println!(
            "{} {} ({}) at {}: {}",
            style("Orphaned lock").red().bold(),
            lock.project,
            pid,
            lock.path.display(),
            action
        );
    }
    if !clear {
        println!();
        println!("Re-run with --clear to delete them.");
    }
    Ok(())
}
