//! Config command handlers

use std::path::PathBuf;

use anyhow::{Context, Result};

use dashsync_core::Config;

use crate::output::{Output, OutputFormat};

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "server_url": config.server_url,
                    "token_set": config.token.is_some(),
                    "data_dir": config.data_dir,
                    "log_file": config.log_file,
                    "log_level": config.log_level,
                    "sync": config.sync,
                })
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.server_url.as_deref().unwrap_or(""));
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            let sync = &config.sync;
            println!("Configuration:");
            println!(
                "  server_url: {}",
                config.server_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  token:      {}",
                if config.token.is_some() { "(set)" } else { "(not set)" }
            );
            println!("  data_dir:   {}", config.data_dir.display());
            println!(
                "  log_file:   {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!(
                "  log_level:  {}",
                config.log_level.as_deref().unwrap_or("(not set)")
            );
            println!();
            println!("[sync]");
            println!("  connect_timeout_ms:           {}", sync.connect_timeout_ms);
            println!("  subscription_timeout_ms:      {}", sync.subscription_timeout_ms);
            println!("  heartbeat_interval_ms:        {}", sync.heartbeat_interval_ms);
            println!("  heartbeat_timeout_multiplier: {}", sync.heartbeat_timeout_multiplier);
            println!("  reconnect_base_ms:            {}", sync.reconnect_base_ms);
            println!("  max_reconnect_attempts:       {}", sync.max_reconnect_attempts);
            println!("  conflict_window_ms:           {}", sync.conflict_window_ms);
            println!("  queue_capacity:               {}", sync.queue_capacity);
            println!("  persist_queue:                {}", sync.persist_queue);
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    config.set_value(&key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    let shown = if key == "token" && !value.is_empty() {
        "(hidden)"
    } else {
        value.as_str()
    };
    output.success(&format!("Set {} = {}", key, shown));

    Ok(())
}
