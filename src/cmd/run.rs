//! Autonomous run: `autoforge run`.

use std::path::Path;

use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

use autoforge::client::Backend;
use autoforge::config::Config;
use autoforge::hub::HubEvent;
use autoforge::logging;
use autoforge::orchestrator::AgentStatus;
use autoforge::server::{self, AppState};

use super::{build_manager, project_for};

pub struct RunArgs {
    pub yolo: bool,
    pub model: Option<String>,
    pub backend: Option<Backend>,
    pub listen: Option<String>,
}

pub async fn cmd_run(project_dir: &Path, verbose: bool, args: RunArgs) -> Result<()> {
    let config =
        Config::new(project_dir.to_path_buf(), verbose)?.with_overrides(args.backend, args.model);
    config.ensure_directories()?;
    let log_dir = config.toml.logging.file.then_some(config.log_dir.as_path());
    let _guard = logging::init(&config.toml.logging, verbose, log_dir)?;

    for warning in config.toml.validate() {
        tracing::warn!("{}", warning);
    }

    let project = project_for(&config);
    let (manager, hub) = build_manager(&config);
    let observer_buffer = config.toml.hub.observer_buffer.max(1);

    let server_shutdown = CancellationToken::new();
    if let Some(addr) = args.listen {
        let state = AppState {
            manager: manager.clone(),
            hub: hub.clone(),
            observer_buffer,
        };
        let token = server_shutdown.clone();
        tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = server::bind_and_serve(&addr, state, shutdown).await {
                tracing::error!("Observer server failed: {:#}", e);
            }
        });
    }

    // Subscribe before starting so the first Status event is seen.
    let mut subscription = hub.subscribe(&project.name, observer_buffer);

    println!(
        "{} {} ({}, backend {}{})",
        style("Starting agent for").bold(),
        style(&project.name).cyan().bold(),
        config.project_dir.display(),
        config.toml.agent.backend,
        if args.yolo { ", yolo" } else { "" }
    );
    manager.start(&project, args.yolo, config.toml.agent.model.clone())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("{}", style("Stopping agent...").yellow());
            manager.shutdown().await;
        }
        status = manager.follow(&project.name, &mut subscription, print_event) => {
            tracing::debug!(project = %project.name, %status, "Agent finished");
        }
    }

    hub.unregister(&project.name, subscription.id);
    manager.shutdown().await;
    server_shutdown.cancel();

    let report = manager.status_report(&project.name);
    if report.status == AgentStatus::Crashed {
        anyhow::bail!(
            "{}",
            report
                .last_reason
                .unwrap_or_else(|| "Agent crashed".to_string())
        );
    }
    Ok(())
}

fn print_event(event: &HubEvent) {
    match event {
        HubEvent::Log { line, .. } => println!("{}", line),
        HubEvent::Progress {
            phase,
            passing,
            total,
            percentage,
        } => println!(
            "{} {} {}/{} passing ({:.1}%)",
            style("▶").cyan(),
            style(phase).bold(),
            passing,
            total,
            percentage
        ),
        HubEvent::FeatureUpdate {
            total,
            passing,
            previous_total,
            previous_passing,
        } => println!(
            "  features: {}/{} → {}/{}",
            previous_passing, previous_total, passing, total
        ),
        HubEvent::SessionStarted { sequence, phase } => println!(
            "{}",
            style(format!("── session {} ({}) ──", sequence, phase)).dim()
        ),
        HubEvent::SessionCompleted { sequence, .. } => {
            println!("{}", style(format!("── session {} done ──", sequence)).dim())
        }
        HubEvent::Warning { message } => println!("{} {}", style("warning:").yellow().bold(), message),
        HubEvent::Status { status, message } => {
            let label = match status {
                AgentStatus::Running => style(status.to_string()).green(),
                AgentStatus::Paused => style(status.to_string()).yellow(),
                AgentStatus::Stopped => style(status.to_string()).dim(),
                AgentStatus::Crashed => style(status.to_string()).red(),
            };
            println!("[{}] {}", label.bold(), message);
        }
    }
}
