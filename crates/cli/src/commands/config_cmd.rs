//! `cadence config`: Configuration inspection commands.

use cadence_config::{AppConfig, CompactionStrategy};

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    let warnings = advisories(&config);
    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    println!("   Model:       {}", config.model.name);
    println!("   Iterations:  {}", config.agent.max_iterations);
    println!(
        "   Workers:     {} core / {} max",
        config.tools.core_workers, config.tools.max_workers
    );
    println!(
        "   Compaction:  {:?} at {:.0}% of {} tokens",
        config.compaction.strategy,
        config.compaction.threshold * 100.0,
        config.compaction.context_window
    );

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}

/// Settings that are valid but probably not what the operator meant.
fn advisories(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.permissions.allow.iter().any(|t| t == "*") && config.permissions.deny.is_empty() {
        warnings.push("Every tool is allow-listed and nothing is denied".to_string());
    }

    if config.compaction.strategy == CompactionStrategy::Off {
        warnings.push("Compaction is off; long sessions will overflow the context window".to_string());
    }

    if config.compaction.min_messages > config.compaction.keep_head + config.compaction.keep_tail {
        warnings.push(format!(
            "compaction.min_messages ({}) exceeds keep_head + keep_tail; summaries will rarely run",
            config.compaction.min_messages
        ));
    }

    if config.stream.max_retries == 0 {
        warnings.push("stream.max_retries is 0; one dropped connection fails the turn".to_string());
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_advisories() {
        assert!(advisories(&AppConfig::default()).is_empty());
    }

    #[test]
    fn disabled_compaction_is_flagged() {
        let mut config = AppConfig::default();
        config.compaction.strategy = CompactionStrategy::Off;
        let warnings = advisories(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Compaction is off"));
    }

    #[test]
    fn wildcard_allow_without_deny_is_flagged() {
        let mut config = AppConfig::default();
        config.permissions.allow = vec!["*".into()];
        assert!(advisories(&config).iter().any(|w| w.contains("allow-listed")));
    }
}
