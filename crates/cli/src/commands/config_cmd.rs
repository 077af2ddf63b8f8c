//! `stepwise config`: Configuration management commands.

use stepwise_config::AppConfig;

use super::CliResult;

pub async fn validate() -> CliResult {
    println!("Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   Config parsed successfully");

            let warnings = check(&config);
            if warnings.is_empty() {
                println!("   All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   warning: {w}");
                }
            }

            println!();
            println!("   Provider:    {}", config.default_provider);
            println!("   Model:       {}", config.default_model);
            println!("   Max steps:   {}", config.agent.max_steps);
            println!("   Memory:      {}", config.memory_dir().display());
            println!("   Servers:     {}", config.capability_servers.len());
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Problems that do not stop the agent from starting.
fn check(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.capability_servers.is_empty() {
        warnings.push("No capability servers configured; `run` will use the built-in set".to_string());
    }
    for server in &config.capability_servers {
        if server.command.trim().is_empty() {
            warnings.push(format!("Capability server '{}' has an empty command", server.name));
        }
    }
    if config.rpc.max_retries == 0 {
        warnings.push("rpc.max_retries is 0; transient failures will not be retried".to_string());
    }
    if config.agent.recall_top_k == 0 {
        warnings.push("agent.recall_top_k is 0; no memories will reach the planner".to_string());
    }

    warnings
}

pub async fn show() -> CliResult {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&redacted(config))?;
    println!("{toml_str}");
    Ok(())
}

fn redacted(mut config: AppConfig) -> AppConfig {
    const MASK: &str = "***";
    if config.api_key.is_some() {
        config.api_key = Some(MASK.into());
    }
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some(MASK.into());
        }
    }
    config
}

pub async fn path() -> CliResult {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}

pub async fn init() -> CliResult {
    let dir = AppConfig::config_dir();
    let config_path = dir.join("config.toml");
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        return Ok(());
    }
    std::fs::create_dir_all(&dir)?;
    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("Wrote default config to {}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_config::CapabilityServerConfig;

    #[test]
    fn config_path_is_valid() {
        let path = AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains("config.toml"));
    }

    #[test]
    fn default_config_warns_about_missing_servers() {
        let warnings = check(&AppConfig::default());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("built-in"));
    }

    #[test]
    fn show_masks_api_keys() {
        let mut config = AppConfig::default();
        config.api_key = Some("sk-secret".into());
        let rendered = toml::to_string_pretty(&redacted(config)).unwrap();
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn empty_server_command_is_flagged() {
        let mut config = AppConfig::default();
        config.capability_servers.push(CapabilityServerConfig {
            name: "math".into(),
            command: " ".into(),
            args: vec![],
            env: Default::default(),
            cwd: None,
        });
        let warnings = check(&config);
        assert!(warnings.iter().any(|w| w.contains("'math'")));
    }
}
