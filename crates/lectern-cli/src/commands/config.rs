use std::path::{Path, PathBuf};

use lectern_core::util::normalize_text_option;

use crate::cli::ConfigCommands;
use crate::commands::common::resolve_db_path;
use crate::config::{
    default_config_path, normalize_api_url, normalize_policy, CliConfig, ENV_TOKEN,
};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, cli_db_path: Option<PathBuf>) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init {
            api_url,
            owner_id,
            policy,
            database,
        } => {
            let path = default_config_path()?;
            let config = CliConfig::load_from_path(&path)?;
            let updated = apply_config_init(config, api_url, owner_id, policy, database)?;
            updated.save_to_path(&path)?;
            println!("Saved config to {}", path.display());
            Ok(())
        }
        ConfigCommands::Show => {
            let config = CliConfig::effective()?;
            let db_path = resolve_db_path(cli_db_path, &config)?;
            let token_set = normalize_text_option(std::env::var(ENV_TOKEN).ok()).is_some();
            for line in format_config_lines(&config, &default_config_path()?, &db_path, token_set)
            {
                println!("{line}");
            }
            Ok(())
        }
    }
}

/// Merge `config init` flags into an existing config; omitted flags keep
/// their current values.
pub fn apply_config_init(
    mut config: CliConfig,
    api_url: Option<String>,
    owner_id: Option<String>,
    policy: Option<String>,
    database: Option<PathBuf>,
) -> Result<CliConfig, CliError> {
    if let Some(api_url) = normalize_text_option(api_url) {
        config.api_base_url = Some(normalize_api_url(api_url)?);
    }
    if let Some(owner_id) = normalize_text_option(owner_id) {
        config.owner_id = Some(owner_id);
    }
    if let Some(policy) = normalize_text_option(policy) {
        config.conflict_policy = Some(normalize_policy(policy)?);
    }
    if let Some(database) = database {
        config.db_path = Some(database);
    }
    Ok(config)
}

pub fn format_config_lines(
    config: &CliConfig,
    config_path: &Path,
    db_path: &Path,
    token_set: bool,
) -> Vec<String> {
    vec![
        format!("config file:     {}", config_path.display()),
        format!("database:        {}", db_path.display()),
        format!(
            "api url:         {}",
            config.api_base_url.as_deref().unwrap_or("(not set)")
        ),
        format!("owner id:        {}", config.owner_id()),
        format!("conflict policy: {}", config.policy_name()),
        format!(
            "token:           {}",
            if token_set { "set" } else { "not set" }
        ),
    ]
}
