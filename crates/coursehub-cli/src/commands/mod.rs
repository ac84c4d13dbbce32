pub mod logging;
pub mod session;

use anyhow::{Context, Result};
use coursehub_core::config::HubConfig;
use coursehub_infrastructure::{ConfigService, MoodleRosterGateway};
use std::path::{Path, PathBuf};

/// Resolves, loads and validates the configuration file.
pub fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, HubConfig)> {
    let service = ConfigService::resolve(explicit)?;
    let config = service
        .get_config()
        .with_context(|| format!("Failed to load {}", service.path().display()))?;
    Ok((service.path().to_path_buf(), config))
}

pub fn check_config(path: &Path, config: &HubConfig) -> Result<()> {
    MoodleRosterGateway::from_settings(&config.roster)?;

    println!("Configuration OK: {}", path.display());
    println!("  image:            {}", config.orchestrator.image);
    println!("  service prefix:   {}", config.orchestrator.service_prefix);
    println!("  home root:        {}", config.accounts.home_root.display());
    println!("  share root:       {}", config.workspace.share_root.display());
    println!("  exchange root:    {}", config.workspace.exchange_root.display());
    println!(
        "  roster:           {}",
        config.roster.base_url.as_deref().unwrap_or("(disabled)")
    );
    println!(
        "  launch timeout:   {}",
        config
            .orchestrator
            .launch_timeout_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "none".to_string())
    );
    Ok(())
}
