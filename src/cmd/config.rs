//! Configuration view, validation and scaffolding: `autoforge config`.

use std::path::Path;

use anyhow::{Context, Result};

use autoforge::config::{AutoforgeToml, CONFIG_FILE, Config, STATE_DIR};
use autoforge::prompts::TemplatePrompts;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let state_dir = project_dir.join(STATE_DIR);
    let config_path = state_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Run 'autoforge config init' to create one.");
            }
            println!();

            // Effective values include AUTOFORGE_* overrides.
            let config = Config::new(project_dir.to_path_buf(), false)?;
            let rendered = toml::to_string_pretty(&config.toml)
                .context("Failed to render configuration")?;
            println!("{}", rendered);
            println!("claude_cmd (effective) = \"{}\"", config.toml.claude_cmd());
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = AutoforgeToml::load(&config_path)?;
            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            std::fs::create_dir_all(&state_dir)
                .with_context(|| format!("Failed to create {}", state_dir.display()))?;

            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
            } else {
                AutoforgeToml::default().save(&config_path)?;
                println!("Created {}", config_path.display());
            }

            let written = TemplatePrompts::export_defaults(project_dir)?;
            if written.is_empty() {
                println!("Prompt templates already present.");
            } else {
                println!(
                    "Exported prompt templates to {}: {}",
                    state_dir.join("prompts").display(),
                    written.join(", ")
                );
            }
        }
    }

    Ok(())
}
