use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Restrict the watch to one namespace. `None` watches the whole cluster.
    pub namespace: Option<String>,
    /// Pod label the anti-affinity rule keys on.
    pub kind_label: String,
    /// Delay before recreating a Job that was deleted after an invalid update.
    pub conflict_requeue: Duration,
    /// Delay before retrying a failed reconciliation.
    pub error_requeue: Duration,
    /// Maximum concurrent reconciliations, 0 for unbounded.
    pub concurrency: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            kind_label: "daemonjob".to_string(),
            conflict_requeue: Duration::from_secs(5),
            error_requeue: Duration::from_secs(30),
            concurrency: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            controller: ControllerConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ControllerConfig::default();

        let config = Config {
            server: ServerConfig {
                addr: lookup("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            },
            controller: ControllerConfig {
                namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
                kind_label: lookup("DAEMONJOB_KIND_LABEL").unwrap_or(defaults.kind_label),
                conflict_requeue: parse_secs(&lookup, "DAEMONJOB_CONFLICT_REQUEUE_SECS")?
                    .unwrap_or(defaults.conflict_requeue),
                error_requeue: parse_secs(&lookup, "DAEMONJOB_ERROR_REQUEUE_SECS")?
                    .unwrap_or(defaults.error_requeue),
                concurrency: match lookup("DAEMONJOB_CONCURRENCY") {
                    Some(raw) => raw.parse().map_err(|_| {
                        crate::Error::Config(format!("DAEMONJOB_CONCURRENCY is not a number: {}", raw))
                    })?,
                    None => defaults.concurrency,
                },
            },
        };

        if config.controller.kind_label.is_empty() {
            return Err(crate::Error::Config(
                "DAEMONJOB_KIND_LABEL must not be empty".to_string(),
            ));
        }

        Ok(config)
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> crate::Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| crate::Error::Config(format!("{} is not a number of seconds: {}", key, raw)))
        })
        .transpose()
}
