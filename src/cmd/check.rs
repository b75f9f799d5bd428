//! Backend preflight: `autoforge check`.

use std::path::Path;

use anyhow::Result;
use console::style;

use autoforge::client::Backend;
use autoforge::config::Config;
use autoforge::logging;

use super::{build_manager, project_for};

pub async fn cmd_check(
    project_dir: &Path,
    verbose: bool,
    backend: Option<Backend>,
    model: Option<String>,
) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?.with_overrides(backend, model);
    let _guard = logging::init(&config.toml.logging, verbose, None)?;

    let warnings = config.toml.validate();
    for warning in &warnings {
        println!("{} {}", style("warning:").yellow().bold(), warning);
    }

    let project = project_for(&config);
    let (manager, _hub) = build_manager(&config);
    let result = manager
        .check_backend(&project, false, config.toml.agent.model.clone())
        .await;
    manager.shutdown().await;

    match result {
        Ok(()) => {
            println!(
                "{} backend '{}' is ready",
                style("✓").green().bold(),
                config.toml.agent.backend
            );
            Ok(())
        }
        Err(e) => {
            println!("{} {}", style("✗").red().bold(), e);
            Err(e.into())
        }
    }
}
