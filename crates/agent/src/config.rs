use anyhow::{Context, Result};
use careline_protocol::CallConfig;
use std::path::Path;

/// Load the `[ice]` and `[timers]` sections the agent dials with. A missing
/// file means defaults.
pub fn load_config(path: &Path) -> Result<CallConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(CallConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: CallConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!(
        stun = config.ice.stun_urls.len(),
        turn = config.ice.turn_urls.len(),
        "Loaded config from {}",
        path.display()
    );
    Ok(config)
}

/// Log every validation issue; `Err` when one of them is fatal.
pub fn check(config: &CallConfig) -> Result<()> {
    let Err(issues) = config.validate() else {
        return Ok(());
    };
    let errors = issues.iter().filter(|i| i.starts_with("ERROR:")).count();
    for issue in &issues {
        if issue.starts_with("ERROR:") {
            tracing::error!("{}", issue);
        } else {
            tracing::warn!("{}", issue);
        }
    }
    if errors > 0 {
        anyhow::bail!("Configuration has {errors} error(s)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_section_parses() {
        let config: CallConfig = toml::from_str(
            r#"
            [ice]
            turn_urls = ["turn:turn.example.com:3478"]
            turn_username = "agent"
            turn_credential = "secret"

            [timers]
            connect_watchdog_ms = 12000
            "#,
        )
        .unwrap();
        assert!(config.ice.has_relay());
        assert_eq!(config.timers.connect_watchdog_ms, 12000);
        assert_eq!(config.timers.dial_timeout_secs, 300);
        assert!(check(&config).is_ok());
    }

    #[test]
    fn bad_stun_scheme_is_fatal() {
        let mut config = CallConfig::default();
        config.ice.stun_urls = vec!["http://stun.example.com".to_string()];
        assert!(check(&config).is_err());
    }
}
