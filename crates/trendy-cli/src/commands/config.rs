use std::path::{Path, PathBuf};

use trendy_core::util::{is_http_url, normalize_text_option};
use trendy_core::TrendyConfig;

use crate::cli::ConfigCommands;
use crate::error::CliError;

pub fn run_config(
    command: ConfigCommands,
    config_path: &Path,
    config: &TrendyConfig,
) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
            let token_state = if config.api_token.is_some() { "set" } else { "not set" };
            eprintln!("API token: {token_state}");
            Ok(())
        }
        ConfigCommands::Path => {
            println!("{}", config_path.display());
            Ok(())
        }
        ConfigCommands::Init {
            api_url,
            store_path,
            force,
        } => run_config_init(config_path, api_url, store_path, force),
    }
}

pub fn run_config_init(
    config_path: &Path,
    api_url: Option<String>,
    store_path: Option<PathBuf>,
    force: bool,
) -> Result<(), CliError> {
    if config_path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        )));
    }

    let config = TrendyConfig {
        api_base_url: normalize_api_url(api_url)?,
        db_path: store_path,
        ..TrendyConfig::default()
    };
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(config_path, serde_json::to_string_pretty(&config)?)?;
    println!("{}", config_path.display());
    Ok(())
}

pub fn normalize_api_url(raw: Option<String>) -> Result<Option<String>, CliError> {
    let Some(url) = normalize_text_option(raw) else {
        return Ok(None);
    };
    if !is_http_url(&url) {
        return Err(CliError::Config(
            "API URL must include http:// or https://".to_string(),
        ));
    }
    Ok(Some(url.trim_end_matches('/').to_string()))
}
