//! CLI command implementations.
//!
//! | Module      | Commands handled |
//! |-------------|------------------|
//! | `run`       | `Run`            |
//! | `status`    | `Status`         |
//! | `reconcile` | `Reconcile`      |
//! | `check`     | `Check`          |
//! | `config`    | `Config`         |

pub mod check;
pub mod config;
pub mod reconcile;
pub mod run;
pub mod status;

pub use check::cmd_check;
pub use config::cmd_config;
pub use reconcile::cmd_reconcile;
pub use run::{RunArgs, cmd_run};
pub use status::cmd_status;

use std::sync::Arc;

use autoforge::client::BackendFactory;
use autoforge::config::Config;
use autoforge::hub::BroadcastHub;
use autoforge::orchestrator::{AgentManager, ManagerDeps};
use autoforge::process::ProcessSupervisor;
use autoforge::prompts::TemplatePrompts;
use autoforge::store::{Project, SqliteFeatureStore};

/// Wire the production collaborators for `config`.
pub fn build_manager(config: &Config) -> (AgentManager, BroadcastHub) {
    let supervisor = ProcessSupervisor::new(config.kill_timeout());
    let hub = BroadcastHub::new();
    let manager = AgentManager::new(ManagerDeps {
        hub: hub.clone(),
        store: Arc::new(SqliteFeatureStore::new(config.toml.store.database.clone())),
        prompts: Arc::new(TemplatePrompts::new(
            config.toml.store.validation_category.clone(),
        )),
        clients: Arc::new(BackendFactory::new(config, supervisor.clone())),
        supervisor,
        limits: config.limits(),
        validation_category: config.toml.store.validation_category.clone(),
    });
    (manager, hub)
}

pub fn project_for(config: &Config) -> Project {
    Project::new(config.project_name(), &config.project_dir)
}
