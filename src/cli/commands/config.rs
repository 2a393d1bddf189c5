//! Config command - show configuration or its path

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::KilnResult;

/// Execute the config command
pub async fn execute(args: ConfigArgs, config: &Config, manager: &ConfigManager) -> KilnResult<()> {
    match args.action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            let toml = toml::to_string_pretty(config)?;
            print!("{}", toml);
        }
        ConfigAction::Path => {
            println!("{}", manager.config_path().display());
        }
    }
    Ok(())
}
