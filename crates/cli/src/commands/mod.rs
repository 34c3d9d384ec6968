pub mod caps;
pub mod config_cmd;
pub mod route;
pub mod serve;
pub mod tool;
pub mod usage;

use std::path::PathBuf;
use std::sync::Arc;
use tollgate_config::AppConfig;
use tollgate_router::AdmissionController;
use tollgate_telemetry::{FileLedgerStore, LedgerStore};

/// File locations given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Paths {
    pub config: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
}

impl Paths {
    pub fn load_config(&self) -> Result<AppConfig, Box<dyn std::error::Error>> {
        let config = match &self.config {
            Some(path) => AppConfig::load_from(path)?,
            None => AppConfig::load()?,
        };
        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
    }

    fn workspace_path(&self) -> PathBuf {
        self.workspace.clone().unwrap_or_else(AppConfig::workspace_path)
    }
}

/// Config, controller and (when persistence is on) a ledger store already
/// restored into the controller's tracker.
pub struct Runtime {
    pub config: AppConfig,
    pub controller: AdmissionController,
    pub store: Option<Arc<dyn LedgerStore>>,
}

pub fn runtime(paths: &Paths) -> Result<Runtime, Box<dyn std::error::Error>> {
    let config = paths.load_config()?;
    let workspace = config.load_workspace(&paths.workspace_path())?;
    let controller = AdmissionController::from_config(&config, workspace);

    let store: Option<Arc<dyn LedgerStore>> = if config.budgets.persist {
        let store = FileLedgerStore::new(config.budgets.ledger_path());
        tollgate_telemetry::restore(controller.cost_tracker(), &store)?;
        Some(Arc::new(store))
    } else {
        None
    };

    Ok(Runtime {
        config,
        controller,
        store,
    })
}
