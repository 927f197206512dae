//! Configuration view and validation commands: `bizimatch config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use bizimatch::config::{BizimatchConfig, BizimatchToml};

pub fn cmd_config(config: &BizimatchConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = &config.config_path;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No bizimatch.toml at {} (using defaults)", config_path.display());
            }
            println!("Effective values (with env/CLI overrides):");
            println!();

            let mut effective = config.toml.clone();
            if effective.ai.api_key.is_some() {
                effective.ai.api_key = Some("********".to_string());
            }
            let rendered =
                toml::to_string_pretty(&effective).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("bizimatch.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            BizimatchToml::default().save(config_path)?;

            println!("Created bizimatch.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] max_retries, rollback_stage, skip_stages");
            println!("  - [testing] command, timeout_secs");
            println!("  - [ai] model, max_tokens (key comes from ANTHROPIC_API_KEY)");
            println!();
        }
    }

    Ok(())
}
