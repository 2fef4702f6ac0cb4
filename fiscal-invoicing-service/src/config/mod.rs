//! Configuration module for fiscal-invoicing-service.

use reqwest::Url;
use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::billing::client::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF};
use crate::services::orchestrator::DEFAULT_SUBMISSION_LEASE;

pub const PROVIDER_CALLBACK_PATH: &str = "/webhooks/provider";
/// Query parameter carrying the shared callback token.
pub const CALLBACK_TOKEN_PARAM: &str = "token";

#[derive(Debug, Clone)]
pub struct FiscalInvoicingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// `None` runs with in-memory stores.
    pub database: Option<DatabaseConfig>,
    pub provider: ProviderConfig,
    pub shopify: ShopifyConfig,
    pub public_base_url: Option<String>,
    pub submission_lease: Duration,
    /// Zero disables the authorization poller.
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub action_base: String,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
    /// Required on authorization callbacks when set.
    pub callback_token: Option<Secret<String>>,
}

#[derive(Debug, Clone)]
pub struct ShopifyConfig {
    pub api_secret: Secret<String>,
    pub api_version: String,
    /// Admin API base override, for tests and proxies.
    pub admin_base_url: Option<String>,
}

/// `None` when unset or blank. A value that does not parse is an error
/// rather than a silent fallback to the default.
fn parse_setting<T>(key: &str, raw: Option<String>) -> Result<Option<T>, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(value) = raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    value.parse().map(Some).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{key}: invalid value {value:?}: {e}"))
    })
}

fn parsed<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    parse_setting(key, env::var(key).ok())
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl FiscalInvoicingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let api_secret = non_empty("SHOPIFY_API_SECRET").ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("SHOPIFY_API_SECRET is required"))
        })?;

        let database = match non_empty("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                max_connections: parsed("DATABASE_MAX_CONNECTIONS")?.unwrap_or(10),
                min_connections: parsed("DATABASE_MIN_CONNECTIONS")?.unwrap_or(2),
            }),
            None => None,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "fiscal-invoicing-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: non_empty("OTLP_ENDPOINT"),
            database,
            provider: ProviderConfig {
                endpoint: env::var("PROVIDER_ENDPOINT").unwrap_or_else(|_| {
                    "https://testing.facturante.com/api/Comprobantes.svc".to_string()
                }),
                action_base: env::var("PROVIDER_ACTION_BASE").unwrap_or_else(|_| {
                    "http://www.facturante.com.API/IComprobantes".to_string()
                }),
                max_attempts: parsed("PROVIDER_MAX_ATTEMPTS")?.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                retry_backoff: parsed("PROVIDER_RETRY_BACKOFF_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_RETRY_BACKOFF),
                timeout: Duration::from_secs(parsed("PROVIDER_TIMEOUT_SECS")?.unwrap_or(30)),
                callback_token: non_empty("PROVIDER_CALLBACK_TOKEN").map(Secret::new),
            },
            shopify: ShopifyConfig {
                api_secret: Secret::new(api_secret),
                api_version: env::var("SHOPIFY_API_VERSION")
                    .unwrap_or_else(|_| "2024-10".to_string()),
                admin_base_url: non_empty("SHOPIFY_ADMIN_BASE_URL"),
            },
            public_base_url: non_empty("PUBLIC_BASE_URL"),
            submission_lease: parsed("SUBMISSION_LEASE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SUBMISSION_LEASE),
            poll_interval: Duration::from_secs(parsed("POLL_INTERVAL_SECS")?.unwrap_or(0)),
        })
    }

    /// Where the provider should post authorization results, if this service
    /// is publicly reachable. Carries the callback token when one is set.
    pub fn callback_url(&self) -> Option<String> {
        let base = self.public_base_url.as_deref()?;
        let url = format!("{}{}", base.trim_end_matches('/'), PROVIDER_CALLBACK_PATH);
        let Some(token) = &self.provider.callback_token else {
            return Some(url);
        };
        match Url::parse(&url) {
            Ok(mut url) => {
                url.query_pairs_mut()
                    .append_pair(CALLBACK_TOKEN_PARAM, token.expose_secret());
                Some(url.to_string())
            }
            Err(e) => {
                tracing::warn!(error = %e, "PUBLIC_BASE_URL is not a valid URL");
                None
            }
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::fixed(self.provider.max_attempts.max(1), self.provider.retry_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(public_base_url: Option<&str>) -> FiscalInvoicingConfig {
        FiscalInvoicingConfig {
            common: core_config::Config {
                port: 0,
                host: "127.0.0.1".into(),
            },
            service_name: "fiscal-invoicing-service".into(),
            service_version: "test".into(),
            log_level: "info".into(),
            otlp_endpoint: None,
            database: None,
            provider: ProviderConfig {
                endpoint: "http://provider.test".into(),
                action_base: "http://provider.test/IComprobantes".into(),
                max_attempts: 0,
                retry_backoff: Duration::from_millis(5),
                timeout: Duration::from_secs(1),
                callback_token: None,
            },
            shopify: ShopifyConfig {
                api_secret: Secret::new("secret".into()),
                api_version: "2024-10".into(),
                admin_base_url: None,
            },
            public_base_url: public_base_url.map(str::to_string),
            submission_lease: DEFAULT_SUBMISSION_LEASE,
            poll_interval: Duration::ZERO,
        }
    }

    #[test]
    fn callback_url_joins_base_and_path() {
        assert_eq!(
            config(Some("https://app.example.com/")).callback_url().as_deref(),
            Some("https://app.example.com/webhooks/provider")
        );
        assert_eq!(config(None).callback_url(), None);
    }

    #[test]
    fn callback_url_carries_token() {
        let mut config = config(Some("https://app.example.com"));
        config.provider.callback_token = Some(Secret::new("s3cr3t&x".into()));
        assert_eq!(
            config.callback_url().as_deref(),
            Some("https://app.example.com/webhooks/provider?token=s3cr3t%26x")
        );
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        assert_eq!(
            parse_setting::<u64>("POLL_INTERVAL_SECS", Some(" 30 ".into())).unwrap(),
            Some(30)
        );
        assert_eq!(parse_setting::<u64>("POLL_INTERVAL_SECS", Some("  ".into())).unwrap(), None);
        assert_eq!(parse_setting::<u64>("POLL_INTERVAL_SECS", None).unwrap(), None);

        let err = parse_setting::<u64>("POLL_INTERVAL_SECS", Some("abc".into())).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("POLL_INTERVAL_SECS"));
    }

    #[test]
    fn retry_config_always_allows_one_attempt() {
        let retry = config(None).retry_config();
        assert_eq!(retry.max_attempts(), 1);
        assert_eq!(retry.initial_backoff, Duration::from_millis(5));
    }
}
