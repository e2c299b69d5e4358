use crate::application::LifecyclePolicy;
use crate::domain::value_objects::{ApplicationCatalog, ApplicationTemplate};
use crate::infrastructure::RateLimitConfig;
use anyhow::Context;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Gateway
    pub listen_addr: String,
    pub admin_key: Option<String>,
    pub rate_limit_per_min: u64,
    pub rate_limit_burst: u64,
    pub debug: bool,

    // Registry persistence
    pub state_path: Option<String>,
    pub flush_interval_secs: u64,

    // Lifecycle
    pub apps_path: Option<String>,
    pub instance_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub ready_delay_ms: u64,
    pub max_delete_attempts: u32,

    // DigitalOcean
    pub do_api_token: String,
    pub do_api_url: String,
    pub ssh_key_ids: Vec<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            admin_key: None,
            rate_limit_per_min: 30,
            rate_limit_burst: 10,
            debug: false,
            state_path: Some("data/sessions.json".to_string()),
            flush_interval_secs: 60,
            apps_path: None,
            instance_ttl_secs: 3600,
            sweep_interval_secs: 60,
            ready_delay_ms: 15_000,
            max_delete_attempts: 3,
            do_api_token: String::new(),
            do_api_url: "https://api.digitalocean.com/v2".to_string(),
            ssh_key_ids: Vec::new(),
        }
    }
}

impl Config {
    pub fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            ttl: chrono::Duration::seconds(self.instance_ttl_secs as i64),
            max_delete_attempts: self.max_delete_attempts.max(1),
            ready_delay_hint: Duration::from_millis(self.ready_delay_ms),
        }
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit_per_min,
            window: Duration::from_secs(60),
            burst_size: self.rate_limit_burst,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    /// Application catalog from `apps_path`, or the built-in one.
    pub fn load_catalog(&self) -> anyhow::Result<ApplicationCatalog> {
        let Some(path) = &self.apps_path else {
            return Ok(default_catalog());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read application catalog {}", path))?;
        let catalog: ApplicationCatalog = serde_json::from_str(&raw)
            .with_context(|| format!("invalid application catalog {}", path))?;
        anyhow::ensure!(!catalog.is_empty(), "application catalog {} is empty", path);
        Ok(catalog)
    }
}

/// Templates served when no catalog file is configured.
pub fn default_catalog() -> ApplicationCatalog {
    [
        (
            "app1".to_string(),
            ApplicationTemplate {
                template_id: 181789519,
                region: "ams3".to_string(),
                size: "s-1vcpu-512mb-10gb".to_string(),
                port: 5004,
            },
        ),
        (
            "app2".to_string(),
            ApplicationTemplate {
                template_id: 987654321,
                region: "ams3".to_string(),
                size: "s-1vcpu-512mb-10gb".to_string(),
                port: 5005,
            },
        ),
    ]
    .into_iter()
    .collect()
}

pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(|key| std::env::var(key).ok())
}

/// Build the config from an arbitrary variable lookup.
pub fn load_config_from<F>(var: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();
    let parse_or = |key: &str, default: u64| -> u64 {
        var(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
    };

    let listen_addr = var("BROKER_LISTEN_ADDR").unwrap_or(defaults.listen_addr);

    let admin_key = var("ADMIN_KEY").filter(|k| !k.is_empty());

    let rate_limit_per_min = parse_or("BROKER_RATE_LIMIT_PER_MIN", defaults.rate_limit_per_min);
    let rate_limit_burst = parse_or("BROKER_RATE_LIMIT_BURST", defaults.rate_limit_burst);

    let debug = var("DEBUG").is_some();

    // Empty path keeps the registry in memory only
    let state_path = match var("BROKER_STATE_PATH") {
        Some(path) if path.is_empty() => None,
        Some(path) => Some(path),
        None => defaults.state_path,
    };
    let flush_interval_secs = parse_or("BROKER_FLUSH_INTERVAL_SECS", defaults.flush_interval_secs);

    let apps_path = var("BROKER_APPS_PATH").filter(|p| !p.is_empty());
    let instance_ttl_secs = parse_or("BROKER_INSTANCE_TTL_SECS", defaults.instance_ttl_secs);
    let sweep_interval_secs = parse_or("BROKER_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs);
    let ready_delay_ms = parse_or("BROKER_READY_DELAY_MS", defaults.ready_delay_ms);
    let max_delete_attempts = var("BROKER_MAX_DELETE_ATTEMPTS")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(defaults.max_delete_attempts);

    let do_api_token = var("DO_API_TOKEN").unwrap_or_default();
    let do_api_url = var("DO_API_URL")
        .filter(|u| !u.is_empty())
        .unwrap_or(defaults.do_api_url);
    let ssh_key_ids = var("SSH_KEY_IDS")
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse() {
                    Ok(id) => Some(id),
                    Err(_) => {
                        tracing::warn!("ignoring invalid SSH key id {:?}", s);
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Config {
        listen_addr,
        admin_key,
        rate_limit_per_min,
        rate_limit_burst,
        debug,
        state_path,
        flush_interval_secs,
        apps_path,
        instance_ttl_secs,
        sweep_interval_secs,
        ready_delay_ms,
        max_delete_attempts,
        do_api_token,
        do_api_url,
        ssh_key_ids,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load_with(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_config_from(|key| vars.get(key).cloned()).unwrap()
    }

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
        assert_eq!(cfg.state_path.as_deref(), Some("data/sessions.json"));
        assert_eq!(cfg.instance_ttl_secs, 3600);
        assert!(cfg.admin_key.is_none());
    }

    #[test]
    fn test_load_config_defaults() {
        let cfg = load_with(&[]);
        assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
        assert_eq!(cfg.sweep_interval_secs, 60);
        assert_eq!(cfg.flush_interval_secs, 60);
        assert_eq!(cfg.ready_delay_ms, 15_000);
        assert_eq!(cfg.max_delete_attempts, 3);
        assert_eq!(cfg.rate_limit_per_min, 30);
        assert_eq!(cfg.rate_limit_burst, 10);
        assert_eq!(cfg.do_api_url, "https://api.digitalocean.com/v2");
        assert!(cfg.do_api_token.is_empty());
        assert!(cfg.ssh_key_ids.is_empty());
        assert!(!cfg.debug);
    }

    #[test]
    fn test_load_config_overrides() {
        let cfg = load_with(&[
            ("BROKER_LISTEN_ADDR", "127.0.0.1:9000"),
            ("BROKER_STATE_PATH", "/var/lib/broker/state.json"),
            ("BROKER_INSTANCE_TTL_SECS", "600"),
            ("BROKER_SWEEP_INTERVAL_SECS", "15"),
            ("BROKER_MAX_DELETE_ATTEMPTS", "5"),
            ("DO_API_TOKEN", "secret"),
            ("ADMIN_KEY", "letmein"),
            ("DEBUG", "1"),
        ]);
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.state_path.as_deref(), Some("/var/lib/broker/state.json"));
        assert_eq!(cfg.instance_ttl_secs, 600);
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(15));
        assert_eq!(cfg.max_delete_attempts, 5);
        assert_eq!(cfg.do_api_token, "secret");
        assert_eq!(cfg.admin_key.as_deref(), Some("letmein"));
        assert!(cfg.debug);
    }

    #[test]
    fn test_parse_error_uses_default() {
        let cfg = load_with(&[
            ("BROKER_INSTANCE_TTL_SECS", "an hour"),
            ("BROKER_RATE_LIMIT_BURST", "-1"),
        ]);
        assert_eq!(cfg.instance_ttl_secs, 3600);
        assert_eq!(cfg.rate_limit_burst, 10);
    }

    #[test]
    fn test_empty_state_path_means_in_memory() {
        let cfg = load_with(&[("BROKER_STATE_PATH", "")]);
        assert!(cfg.state_path.is_none());
    }

    #[test]
    fn test_empty_admin_key_disables_admin() {
        let cfg = load_with(&[("ADMIN_KEY", "")]);
        assert!(cfg.admin_key.is_none());
    }

    #[test]
    fn test_ssh_key_ids_parsing() {
        let cfg = load_with(&[("SSH_KEY_IDS", "123, 456,,oops,789")]);
        assert_eq!(cfg.ssh_key_ids, vec![123, 456, 789]);
    }

    #[test]
    fn test_policy_from_config() {
        let cfg = load_with(&[
            ("BROKER_INSTANCE_TTL_SECS", "120"),
            ("BROKER_READY_DELAY_MS", "500"),
            ("BROKER_MAX_DELETE_ATTEMPTS", "0"),
        ]);
        let policy = cfg.policy();
        assert_eq!(policy.ttl, chrono::Duration::minutes(2));
        assert_eq!(policy.ready_delay_hint, Duration::from_millis(500));
        assert_eq!(policy.max_delete_attempts, 1);
    }

    #[test]
    fn test_rate_limit_from_config() {
        let cfg = load_with(&[("BROKER_RATE_LIMIT_PER_MIN", "60")]);
        let limit = cfg.rate_limit();
        assert_eq!(limit.max_requests, 60);
        assert_eq!(limit.window, Duration::from_secs(60));
        assert_eq!(limit.burst_size, 10);
    }

    #[test]
    fn test_default_catalog() {
        let catalog = load_with(&[]).load_catalog().unwrap();
        assert_eq!(catalog.names(), vec!["app1", "app2"]);
        assert_eq!(catalog.get("app1").unwrap().port, 5004);
        assert_eq!(catalog.get("app2").unwrap().template_id, 987654321);
    }

    #[test]
    fn test_catalog_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        std::fs::write(
            &path,
            r#"{"wiki": {"template_id": 42, "region": "fra1", "size": "s-2vcpu-2gb"}}"#,
        )
        .unwrap();

        let cfg = load_with(&[("BROKER_APPS_PATH", path.to_str().unwrap())]);
        let catalog = cfg.load_catalog().unwrap();

        let wiki = catalog.get("wiki").unwrap();
        assert_eq!(wiki.template_id, 42);
        assert_eq!(wiki.region, "fra1");
        assert_eq!(wiki.port, 80);
        assert!(!catalog.contains("app1"));
    }

    #[test]
    fn test_catalog_file_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = load_with(&[(
            "BROKER_APPS_PATH",
            dir.path().join("nope.json").to_str().unwrap(),
        )]);
        assert!(missing.load_catalog().is_err());

        let empty_path = dir.path().join("empty.json");
        std::fs::write(&empty_path, "{}").unwrap();
        let empty = load_with(&[("BROKER_APPS_PATH", empty_path.to_str().unwrap())]);
        let err = empty.load_catalog().unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }
}
