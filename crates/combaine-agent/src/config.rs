// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_LEASE_TTL_SECS: u64 = 30;
const DEFAULT_MEMBERS_POLL_SECS: u64 = 5;
const DEFAULT_CONFIG_POLL_SECS: u64 = 10;
const DEFAULT_HOST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SEND_ATTEMPTS: u32 = 3;
const DEFAULT_SEND_BACKOFF_BASE_MS: u64 = 100;
const DEFAULT_STATUS_PORT: u16 = 9105;

#[derive(Debug)]
pub struct Config {
    /// directory scanned for per-group YAML files
    pub config_dir: String,
    pub worker_id: String,
    /// base url of the lease service; a single-process backend is used when unset
    pub coordination_url: Option<String>,
    pub lease_ttl: Duration,
    /// how often to re-list cluster members
    pub members_poll: Duration,
    /// how often to re-scan the configuration repository
    pub config_poll: Duration,
    /// budget for one host poll, fetch and parse included
    pub host_timeout: Duration,
    pub send_attempts: u32,
    pub send_backoff_base: Duration,
    /// port for the local status endpoints, 0 disables them
    pub status_port: u16,
}

impl Config {
    pub fn new() -> Result<Config, Box<dyn std::error::Error>> {
        let config_dir = env::var("COMBAINE_CONFIG_DIR")
            .map_err(|_| anyhow::anyhow!("COMBAINE_CONFIG_DIR environment variable is not set"))?;

        let worker_id = env::var("COMBAINE_WORKER_ID").unwrap_or_else(|_| default_worker_id());
        let coordination_url = env::var("COMBAINE_COORDINATION_URL").ok();

        let lease_ttl_secs: u64 = parse_env("COMBAINE_LEASE_TTL_SECS", DEFAULT_LEASE_TTL_SECS)?;
        // Heartbeats run at a third of the ttl; anything shorter than 3s
        // renews faster than a remote lease service can usefully answer.
        if lease_ttl_secs < 3 {
            return Err(anyhow::anyhow!(
                "COMBAINE_LEASE_TTL_SECS must be at least 3, got {lease_ttl_secs}"
            )
            .into());
        }

        let send_attempts: u32 = parse_env("COMBAINE_SEND_ATTEMPTS", DEFAULT_SEND_ATTEMPTS)?;
        if send_attempts < 1 {
            return Err(anyhow::anyhow!("COMBAINE_SEND_ATTEMPTS must be at least 1").into());
        }

        Ok(Config {
            config_dir,
            worker_id,
            coordination_url,
            lease_ttl: Duration::from_secs(lease_ttl_secs),
            members_poll: Duration::from_secs(parse_env(
                "COMBAINE_MEMBERS_POLL_SECS",
                DEFAULT_MEMBERS_POLL_SECS,
            )?),
            config_poll: Duration::from_secs(parse_env(
                "COMBAINE_CONFIG_POLL_SECS",
                DEFAULT_CONFIG_POLL_SECS,
            )?),
            host_timeout: Duration::from_secs(parse_env(
                "COMBAINE_HOST_TIMEOUT_SECS",
                DEFAULT_HOST_TIMEOUT_SECS,
            )?),
            send_attempts,
            send_backoff_base: Duration::from_millis(parse_env(
                "COMBAINE_SEND_BACKOFF_BASE_MS",
                DEFAULT_SEND_BACKOFF_BASE_MS,
            )?),
            status_port: parse_env("COMBAINE_STATUS_PORT", DEFAULT_STATUS_PORT)?,
        })
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> Result<T, Box<dyn std::error::Error>> {
    match env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => Ok(value),
            Err(_) => Err(anyhow::anyhow!("{name} must be a number, got {raw}").into()),
        },
        Err(_) => Ok(default),
    }
}

fn default_worker_id() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| format!("combaine-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use std::env;
    use std::time::Duration;

    use crate::config;

    #[test]
    #[serial]
    fn test_error_if_no_config_dir() {
        env::remove_var("COMBAINE_CONFIG_DIR");
        let config = config::Config::new();
        assert!(config.is_err());
        assert_eq!(
            config.unwrap_err().to_string(),
            "COMBAINE_CONFIG_DIR environment variable is not set"
        );
    }

    #[test]
    #[serial]
    fn test_defaults() {
        env::set_var("COMBAINE_CONFIG_DIR", "/etc/combaine/groups");
        let config_res = config::Config::new();
        assert!(config_res.is_ok());
        let config = config_res.unwrap();
        assert_eq!(config.config_dir, "/etc/combaine/groups");
        assert_eq!(config.coordination_url, None);
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.members_poll, Duration::from_secs(5));
        assert_eq!(config.config_poll, Duration::from_secs(10));
        assert_eq!(config.host_timeout, Duration::from_secs(10));
        assert_eq!(config.send_attempts, 3);
        assert_eq!(config.send_backoff_base, Duration::from_millis(100));
        assert_eq!(config.status_port, 9105);
        env::remove_var("COMBAINE_CONFIG_DIR");
    }

    #[test]
    #[serial]
    fn test_worker_id_override() {
        env::set_var("COMBAINE_CONFIG_DIR", "/etc/combaine/groups");
        env::set_var("COMBAINE_WORKER_ID", "worker-7");
        let config_res = config::Config::new();
        assert!(config_res.is_ok());
        assert_eq!(config_res.unwrap().worker_id, "worker-7");
        env::remove_var("COMBAINE_CONFIG_DIR");
        env::remove_var("COMBAINE_WORKER_ID");
    }

    #[test]
    #[serial]
    fn test_custom_intervals_and_port() {
        env::set_var("COMBAINE_CONFIG_DIR", "/etc/combaine/groups");
        env::set_var("COMBAINE_COORDINATION_URL", "http://leases.local:4001");
        env::set_var("COMBAINE_LEASE_TTL_SECS", "12");
        env::set_var("COMBAINE_MEMBERS_POLL_SECS", "2");
        env::set_var("COMBAINE_CONFIG_POLL_SECS", "30");
        env::set_var("COMBAINE_HOST_TIMEOUT_SECS", "5");
        env::set_var("COMBAINE_SEND_ATTEMPTS", "5");
        env::set_var("COMBAINE_SEND_BACKOFF_BASE_MS", "250");
        env::set_var("COMBAINE_STATUS_PORT", "0");
        let config_res = config::Config::new();
        assert!(config_res.is_ok());
        let config = config_res.unwrap();
        assert_eq!(
            config.coordination_url.as_deref(),
            Some("http://leases.local:4001")
        );
        assert_eq!(config.lease_ttl, Duration::from_secs(12));
        assert_eq!(config.members_poll, Duration::from_secs(2));
        assert_eq!(config.config_poll, Duration::from_secs(30));
        assert_eq!(config.host_timeout, Duration::from_secs(5));
        assert_eq!(config.send_attempts, 5);
        assert_eq!(config.send_backoff_base, Duration::from_millis(250));
        assert_eq!(config.status_port, 0);
        env::remove_var("COMBAINE_CONFIG_DIR");
        env::remove_var("COMBAINE_COORDINATION_URL");
        env::remove_var("COMBAINE_LEASE_TTL_SECS");
        env::remove_var("COMBAINE_MEMBERS_POLL_SECS");
        env::remove_var("COMBAINE_CONFIG_POLL_SECS");
        env::remove_var("COMBAINE_HOST_TIMEOUT_SECS");
        env::remove_var("COMBAINE_SEND_ATTEMPTS");
        env::remove_var("COMBAINE_SEND_BACKOFF_BASE_MS");
        env::remove_var("COMBAINE_STATUS_PORT");
    }

    #[test]
    #[serial]
    fn test_error_if_lease_ttl_not_a_number() {
        env::set_var("COMBAINE_CONFIG_DIR", "/etc/combaine/groups");
        env::set_var("COMBAINE_LEASE_TTL_SECS", "soon");
        let config = config::Config::new();
        assert!(config.is_err());
        assert_eq!(
            config.unwrap_err().to_string(),
            "COMBAINE_LEASE_TTL_SECS must be a number, got soon"
        );
        env::remove_var("COMBAINE_CONFIG_DIR");
        env::remove_var("COMBAINE_LEASE_TTL_SECS");
    }

    #[test]
    #[serial]
    fn test_error_if_lease_ttl_too_short() {
        env::set_var("COMBAINE_CONFIG_DIR", "/etc/combaine/groups");
        env::set_var("COMBAINE_LEASE_TTL_SECS", "1");
        let config = config::Config::new();
        assert!(config.is_err());
        assert_eq!(
            config.unwrap_err().to_string(),
            "COMBAINE_LEASE_TTL_SECS must be at least 3, got 1"
        );
        env::remove_var("COMBAINE_CONFIG_DIR");
        env::remove_var("COMBAINE_LEASE_TTL_SECS");
    }

    #[test]
    #[serial]
    fn test_error_if_send_attempts_zero() {
        env::set_var("COMBAINE_CONFIG_DIR", "/etc/combaine/groups");
        env::set_var("COMBAINE_SEND_ATTEMPTS", "0");
        let config = config::Config::new();
        assert!(config.is_err());
        assert_eq!(
            config.unwrap_err().to_string(),
            "COMBAINE_SEND_ATTEMPTS must be at least 1"
        );
        env::remove_var("COMBAINE_CONFIG_DIR");
        env::remove_var("COMBAINE_SEND_ATTEMPTS");
    }
}
