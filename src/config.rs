use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    /// Central registry database (tenants, migration runs, alerts).
    #[serde(default = "default_registry_path")]
    pub registry_db_path: PathBuf,
    /// Directory holding one SQLite file per tenant database.
    #[serde(default = "default_tenant_dir")]
    pub tenant_db_dir: PathBuf,
    #[serde(default = "default_provision_attempts")]
    pub provision_max_attempts: u32,
    #[serde(default = "default_provision_backoff")]
    pub provision_backoff_secs: u64,
    /// Hard cap on one migration run against one tenant database.
    #[serde(default = "default_migration_timeout")]
    pub migration_timeout_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// A pending tenant whose last failure is older than this is considered
    /// stuck by the `check` command.
    #[serde(default = "default_stuck_after")]
    pub stuck_after_mins: u64,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
}

fn default_from_name() -> String {
    "Palletbase".into()
}

// Default functions
fn default_registry_path() -> PathBuf {
    PathBuf::from("data/registry.db")
}
fn default_tenant_dir() -> PathBuf {
    PathBuf::from("data/tenants")
}
fn default_provision_attempts() -> u32 {
    3
}
fn default_provision_backoff() -> u64 {
    30
}
fn default_migration_timeout() -> u64 {
    300
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_stuck_after() -> u64 {
    30
}

/// Load config from TOML file with env var overrides.
pub fn load(path: &str) -> anyhow::Result<PlatformConfig> {
    let content = if std::path::Path::new(path).exists() {
        std::fs::read_to_string(path)?
    } else {
        tracing::warn!("Config file not found at {}, using defaults", path);
        String::new()
    };

    let mut config: PlatformConfig = toml::from_str(&content)?;

    // Env var overrides
    if let Ok(v) = std::env::var("PALLETBASE_REGISTRY_DB") {
        config.registry_db_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("PALLETBASE_TENANT_DIR") {
        config.tenant_db_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("PALLETBASE_PROVISION_ATTEMPTS") {
        config.provision_max_attempts = v.parse()?;
    }
    if let Ok(v) = std::env::var("PALLETBASE_MIGRATION_TIMEOUT") {
        config.migration_timeout_secs = v.parse()?;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_on_empty_toml() {
        let cfg: PlatformConfig = toml::from_str("").expect("empty toml should parse");
        assert_eq!(cfg.registry_db_path, PathBuf::from("data/registry.db"));
        assert_eq!(cfg.tenant_db_dir, PathBuf::from("data/tenants"));
        assert_eq!(cfg.provision_max_attempts, 3);
        assert_eq!(cfg.provision_backoff_secs, 30);
        assert_eq!(cfg.migration_timeout_secs, 300);
        assert_eq!(cfg.cache_ttl_secs, 300);
        assert!(cfg.smtp.is_none());
    }

    #[test]
    fn partial_toml_overrides_only_set_fields() {
        let toml_str = r#"
registry_db_path = "/srv/palletbase/registry.db"
provision_max_attempts = 5
"#;
        let cfg: PlatformConfig = toml::from_str(toml_str).expect("valid toml");
        assert_eq!(
            cfg.registry_db_path,
            PathBuf::from("/srv/palletbase/registry.db")
        );
        assert_eq!(cfg.provision_max_attempts, 5);
        // defaults preserved for unset fields
        assert_eq!(cfg.tenant_db_dir, PathBuf::from("data/tenants"));
        assert_eq!(cfg.provision_backoff_secs, 30);
    }

    #[test]
    fn smtp_section_parses() {
        let toml_str = r#"
[smtp]
host = "smtp.example.com"
port = 587
username = "mailer"
password = "secret"
from_email = "noreply@example.com"
"#;
        let cfg: PlatformConfig = toml::from_str(toml_str).expect("valid toml");
        let smtp = cfg.smtp.expect("smtp section");
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.from_name, "Palletbase");
    }
}
