use std::{
    collections::HashSet,
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

use crate::ledger::WalletPolicyConfig;
use crate::notifications::NotificationDispatcherConfig;

#[derive(Clone, Debug)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub webhook_auth_token: Option<String>,
    pub timeout_ms: u64,
    pub dispatcher: NotificationDispatcherConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            webhook_auth_token: None,
            timeout_ms: 5_000,
            dispatcher: NotificationDispatcherConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    pub auth_signing_key: String,
    pub auth_issuer: String,
    pub auth_audience: String,
    pub auth_max_token_age_seconds: u64,
    pub auth_revoked_jtis: HashSet<String>,
    pub internal_token: Option<String>,
    pub wallet_policy: WalletPolicyConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid ESCROW_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid ESCROW_AUTH_MAX_TOKEN_AGE_SECONDS: {0}")]
    InvalidAuthMaxTokenAgeSeconds(String),
    #[error("invalid wallet policy config: {0}")]
    InvalidWalletPolicyConfig(String),
    #[error("invalid notification config: {0}")]
    InvalidNotificationConfig(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = env::var("ESCROW_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4200".to_string())
            .parse()?;
        let service_name =
            env::var("ESCROW_SERVICE_NAME").unwrap_or_else(|_| "marketplace-escrow".to_string());
        let db_url = env::var("DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let auth_signing_key = env::var("ESCROW_AUTH_SIGNING_KEY")
            .unwrap_or_else(|_| "dev-escrow-key".to_string());
        let auth_issuer = env::var("ESCROW_AUTH_ISSUER")
            .unwrap_or_else(|_| "https://marketplace.local".to_string());
        let auth_audience = env::var("ESCROW_AUTH_AUDIENCE")
            .unwrap_or_else(|_| "marketplace-escrow".to_string());
        let auth_max_token_age_seconds = env::var("ESCROW_AUTH_MAX_TOKEN_AGE_SECONDS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidAuthMaxTokenAgeSeconds(error.to_string()))?
            .max(1);
        let auth_revoked_jtis = env::var("ESCROW_AUTH_REVOKED_JTIS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(ToString::to_string)
                    .collect::<HashSet<_>>()
            })
            .unwrap_or_default();
        let internal_token = env::var("ESCROW_INTERNAL_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let lookup = |key: &str| env::var(key).ok();
        let wallet_policy = parse_wallet_policy_from_env(lookup)?;
        let notifications = parse_notification_config_from_env(lookup)?;

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            auth_signing_key,
            auth_issuer,
            auth_audience,
            auth_max_token_age_seconds,
            auth_revoked_jtis,
            internal_token,
            wallet_policy,
            notifications,
        })
    }
}

fn parse_wallet_policy_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<WalletPolicyConfig, ConfigError> {
    let defaults = WalletPolicyConfig::default();
    let max_amount = parse_with_lookup(&lookup, "ESCROW_MAX_AMOUNT", defaults.max_amount, |raw| {
        raw.trim()
            .parse::<u64>()
            .map_err(|error| {
                ConfigError::InvalidWalletPolicyConfig(format!("ESCROW_MAX_AMOUNT: {error}"))
            })
            .map(|value| value.clamp(1, i64::MAX as u64))
    })?;
    Ok(WalletPolicyConfig { max_amount })
}

fn parse_notification_config_from_env(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<NotificationConfig, ConfigError> {
    let defaults = NotificationConfig::default();

    let enabled = parse_with_lookup(&lookup, "ESCROW_NOTIFY_ENABLED", defaults.enabled, |raw| {
        parse_bool(raw.as_str()).map_err(|value| {
            ConfigError::InvalidNotificationConfig(format!("ESCROW_NOTIFY_ENABLED: {value}"))
        })
    })?;
    let webhook_url = lookup("ESCROW_NOTIFY_URL")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    if let Some(url) = webhook_url.as_deref()
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(ConfigError::InvalidNotificationConfig(format!(
            "ESCROW_NOTIFY_URL must be an http(s) url: {url}"
        )));
    }
    let webhook_auth_token = lookup("ESCROW_NOTIFY_AUTH_TOKEN")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    let timeout_ms = parse_u64_env_lookup(
        &lookup,
        "ESCROW_NOTIFY_TIMEOUT_MS",
        defaults.timeout_ms,
        250,
        120_000,
    )?;
    let interval_seconds = parse_u64_env_lookup(
        &lookup,
        "ESCROW_NOTIFY_INTERVAL_SECONDS",
        defaults.dispatcher.interval_seconds,
        1,
        3_600,
    )?;
    let batch_size = parse_u64_env_lookup(
        &lookup,
        "ESCROW_NOTIFY_BATCH_SIZE",
        defaults.dispatcher.batch_size as u64,
        1,
        1_000,
    )?;
    let max_attempts = parse_u64_env_lookup(
        &lookup,
        "ESCROW_NOTIFY_MAX_ATTEMPTS",
        defaults.dispatcher.max_attempts as u64,
        1,
        100,
    )?;
    let retry_backoff_seconds = parse_u64_env_lookup(
        &lookup,
        "ESCROW_NOTIFY_RETRY_BACKOFF_SECONDS",
        defaults.dispatcher.retry_backoff_seconds,
        1,
        3_600,
    )?;

    Ok(NotificationConfig {
        enabled,
        webhook_url,
        webhook_auth_token,
        timeout_ms,
        dispatcher: NotificationDispatcherConfig {
            interval_seconds,
            batch_size: batch_size as i64,
            max_attempts: max_attempts as i32,
            retry_backoff_seconds,
        },
    })
}

fn parse_u64_env_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    parse_with_lookup(lookup, key, default, |raw| {
        raw.trim()
            .parse::<u64>()
            .map_err(|error| ConfigError::InvalidNotificationConfig(format!("{key}: {error}")))
            .map(|value| value.clamp(min, max))
    })
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{ConfigError, parse_notification_config_from_env, parse_wallet_policy_from_env};

    #[test]
    fn wallet_policy_parser_applies_env_overrides() {
        let values = HashMap::from([("ESCROW_MAX_AMOUNT", "25000")]);
        let policy = parse_wallet_policy_from_env(|key| values.get(key).map(ToString::to_string))
            .expect("policy parse");
        assert_eq!(policy.max_amount, 25_000);

        let clamped = HashMap::from([("ESCROW_MAX_AMOUNT", "0")]);
        let policy = parse_wallet_policy_from_env(|key| clamped.get(key).map(ToString::to_string))
            .expect("policy parse");
        assert_eq!(policy.max_amount, 1);
    }

    #[test]
    fn wallet_policy_parser_rejects_invalid_env_values() {
        let values = HashMap::from([("ESCROW_MAX_AMOUNT", "lots")]);
        let error = parse_wallet_policy_from_env(|key| values.get(key).map(ToString::to_string))
            .expect_err("invalid value should fail");
        match error {
            ConfigError::InvalidWalletPolicyConfig(message) => {
                assert!(message.contains("ESCROW_MAX_AMOUNT"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn notification_parser_applies_overrides_and_bounds() {
        let values = HashMap::from([
            ("ESCROW_NOTIFY_URL", " https://chat.internal/notify "),
            ("ESCROW_NOTIFY_AUTH_TOKEN", "notify-token"),
            ("ESCROW_NOTIFY_TIMEOUT_MS", "10"),
            ("ESCROW_NOTIFY_INTERVAL_SECONDS", "30"),
            ("ESCROW_NOTIFY_BATCH_SIZE", "5000"),
            ("ESCROW_NOTIFY_MAX_ATTEMPTS", "4"),
            ("ESCROW_NOTIFY_RETRY_BACKOFF_SECONDS", "15"),
            ("ESCROW_NOTIFY_ENABLED", "yes"),
        ]);
        let config =
            parse_notification_config_from_env(|key| values.get(key).map(ToString::to_string))
                .expect("notification config parse");
        assert!(config.enabled);
        assert_eq!(
            config.webhook_url.as_deref(),
            Some("https://chat.internal/notify")
        );
        assert_eq!(config.webhook_auth_token.as_deref(), Some("notify-token"));
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.dispatcher.interval_seconds, 30);
        assert_eq!(config.dispatcher.batch_size, 1_000);
        assert_eq!(config.dispatcher.max_attempts, 4);
        assert_eq!(config.dispatcher.retry_backoff_seconds, 15);
    }

    #[test]
    fn notification_parser_defaults_to_log_sink() {
        let values: HashMap<&str, &str> = HashMap::new();
        let config =
            parse_notification_config_from_env(|key| values.get(key).map(ToString::to_string))
                .expect("notification config parse");
        assert!(config.enabled);
        assert!(config.webhook_url.is_none());
        assert_eq!(config.dispatcher.max_attempts, 8);
    }

    #[test]
    fn notification_parser_rejects_bad_values() {
        let bad_bool = HashMap::from([("ESCROW_NOTIFY_ENABLED", "maybe")]);
        let bad_url = HashMap::from([("ESCROW_NOTIFY_URL", "ftp://chat.internal")]);
        let bad_number = HashMap::from([("ESCROW_NOTIFY_BATCH_SIZE", "-1")]);

        for values in [bad_bool, bad_url, bad_number] {
            let error =
                parse_notification_config_from_env(|key| values.get(key).map(ToString::to_string))
                    .expect_err("invalid value should fail");
            match error {
                ConfigError::InvalidNotificationConfig(_) => {}
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }
}
