//! `tollgate config`: Configuration management commands.

use super::Paths;
use tollgate_config::AppConfig;

pub async fn validate(paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    let config = match paths.load_config() {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e);
        }
    };
    println!("   ✅ Config parsed and validated");

    let workspace = paths.workspace.clone().unwrap_or_else(AppConfig::workspace_path);
    match config.load_workspace(&workspace) {
        Ok(Some(_)) => println!("   ✅ Workspace overlay valid: {}", workspace.display()),
        Ok(None) => println!("   No workspace overlay at {}", workspace.display()),
        Err(e) => {
            println!("   ❌ Workspace error: {e}");
            return Err(e.into());
        }
    }

    println!();
    println!("   Strategy:  {}", config.routing.strategy);
    println!(
        "   Tiers:     {}",
        config
            .routing
            .tiers
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(" < ")
    );
    println!(
        "   Fallback:  {}",
        config.routing.fallback_model.as_deref().unwrap_or("(none)")
    );
    println!("   Reset:     {:02}:00 UTC", config.budgets.reset_hour_utc);
    println!("   Window:    {}s", config.rate_limiting.window_secs);
    Ok(())
}

pub async fn show(paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let config = paths
        .load_config()
        .map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn init(paths: &Paths, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let path = paths.config_path();
    if path.exists() && !force {
        println!("⚠️  Config already exists at: {}", path.display());
        println!("   Edit it manually or re-run with --force.");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, AppConfig::default_toml())?;
    println!("✅ Created config at: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths {
            config: Some(dir.path().join("nested").join("config.toml")),
            workspace: None,
        };
        init(&paths, false).await.unwrap();
        let config = paths.load_config().unwrap();
        assert_eq!(config.routing.tiers.len(), 4);
    }

    #[tokio::test]
    async fn init_keeps_existing_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# mine\n").unwrap();
        let paths = Paths {
            config: Some(path.clone()),
            workspace: None,
        };
        init(&paths, false).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine\n");
        init(&paths, true).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("[routing]"));
    }
}
