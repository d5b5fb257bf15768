//! Process configuration
//!
//! Options are read from the environment into an explicit [`Settings`]
//! structure. Every recognized key has a default registered on the
//! `config` builder, so a bare environment yields a usable local setup.

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// How API callers are identified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// `X-Rh-Identity` header injected by the platform gateway
    RhIdentity,
    /// `Authorization: Bearer` token checked against a token-review endpoint
    BearerToken,
}

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub consumer_group_id: String,
    pub auto_commit: bool,
    pub upload_topic: String,
    pub recommendation_topic: String,
    pub sources_event_topic: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ca_location: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KruizeSettings {
    pub url: String,
    pub max_bulk_chunk_size: usize,
    /// Minimum age (hours) of the stored recommendation before asking again
    pub recommendation_fetch_delay_hours: i64,
    pub profile_retry_delay: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub ssl_mode: PgSslMode,
    pub max_connections: u32,
}

impl DatabaseSettings {
    /// Connection options; credentials are passed as-is, never through a URL
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.name)
            .ssl_mode(self.ssl_mode)
    }
}

#[derive(Debug, Clone)]
pub struct RbacSettings {
    pub enabled: bool,
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl RbacSettings {
    /// Access endpoint queried for the caller's cost-management permissions
    pub fn access_url(&self) -> String {
        format!(
            "{}://{}:{}/api/rbac/v1/access/?application=cost-management&limit=100",
            self.protocol, self.host, self.port
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub port: u16,
    pub prometheus_port: u16,
    pub record_limit_csv: i64,
    pub auth_mode: AuthMode,
    pub token_review_url: Option<String>,
    pub token_review_auth_token: Option<String>,
    pub default_org_id: String,
}

#[derive(Debug, Clone)]
pub struct SourcesSettings {
    pub base_url: String,
    pub prefix: String,
    pub onprem: bool,
}

#[derive(Debug, Clone)]
pub struct FeatureSettings {
    pub disable_namespace_recommendation: bool,
    pub unleash_url: Option<String>,
    pub unleash_token: Option<String>,
    pub unleash_refresh: Duration,
}

#[derive(Debug, Clone)]
pub struct HousekeeperSettings {
    pub data_retention_days: i64,
    pub interval: Duration,
}

/// Full process configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub service_name: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub kafka: KafkaSettings,
    pub kruize: KruizeSettings,
    pub database: DatabaseSettings,
    pub rbac: RbacSettings,
    pub api: ApiSettings,
    pub sources: SourcesSettings,
    pub features: FeatureSettings,
    pub housekeeper: HousekeeperSettings,
}

const DEFAULTS: &[(&str, &str)] = &[
    ("service_name", "rosocp"),
    ("log_level", "info"),
    ("log_format", "json"),
    ("kafka_bootstrap_servers", "localhost:29092"),
    ("kafka_consumer_group_id", "ros-ocp"),
    ("kafka_auto_commit", "false"),
    ("upload_topic", "hccm.ros.events"),
    ("recommendation_topic", "rosocp.kruize.recommendations"),
    ("sources_event_topic", "platform.sources.event-stream"),
    ("kafka_security_protocol", ""),
    ("kafka_sasl_mechanism", ""),
    ("kafka_sasl_username", ""),
    ("kafka_sasl_password", ""),
    ("kafka_ca_location", ""),
    ("kruize_url", "http://localhost:8080"),
    ("kruize_max_bulk_chunk_size", "100"),
    ("kruize_profile_retry_delay_secs", "10"),
    ("recommendation_fetch_delay", "24"),
    ("http_timeout_secs", "60"),
    ("db_host", "localhost"),
    ("db_port", "15432"),
    ("db_name", "postgres"),
    ("db_user", "postgres"),
    ("db_password", "postgres"),
    ("db_ssl_mode", "disable"),
    ("db_max_connections", "10"),
    ("rbac_enabled", "false"),
    ("rbac_protocol", "http"),
    ("rbac_host", "localhost"),
    ("rbac_port", "9080"),
    ("api_port", "8000"),
    ("prometheus_port", "5005"),
    ("record_limit_csv", "1000"),
    ("id_provider", "rhsso"),
    ("token_review_url", ""),
    ("token_review_auth_token", ""),
    ("default_org_id", "0"),
    ("sources_api_base_url", "http://localhost:8002"),
    ("sources_api_prefix", "/api/sources/v3.1"),
    ("onprem", "false"),
    ("disable_namespace_recommendation", "false"),
    ("unleash_url", ""),
    ("unleash_token", ""),
    ("unleash_refresh_secs", "15"),
    ("data_retention_period", "15"),
    ("housekeeper_interval_secs", "86400"),
];

impl Settings {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::from_environment(config::Environment::default())
    }

    /// Load configuration from an explicit key/value map (upper-case keys)
    pub fn from_env_map<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_environment(config::Environment::default().source(Some(map)))
    }

    fn from_environment(env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        for (key, value) in DEFAULTS {
            builder = builder.set_default(*key, *value)?;
        }
        let cfg = builder
            .add_source(env)
            .build()
            .context("Failed to build configuration")?;
        let reader = Reader { cfg: &cfg };

        let log_format = match reader.string("log_format")?.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" | "plain" => LogFormat::Text,
            other => bail!("LOG_FORMAT must be json or text, got {other:?}"),
        };

        let auth_mode = match reader.string("id_provider")?.to_lowercase().as_str() {
            "rhsso" => AuthMode::RhIdentity,
            "oauth2" | "bearer" => AuthMode::BearerToken,
            other => bail!("ID_PROVIDER must be rhsso or oauth2, got {other:?}"),
        };

        let settings = Settings {
            service_name: reader.string("service_name")?,
            log_level: reader.string("log_level")?,
            log_format,
            kafka: KafkaSettings {
                bootstrap_servers: reader.string("kafka_bootstrap_servers")?,
                consumer_group_id: reader.string("kafka_consumer_group_id")?,
                auto_commit: reader.flag("kafka_auto_commit")?,
                upload_topic: reader.string("upload_topic")?,
                recommendation_topic: reader.string("recommendation_topic")?,
                sources_event_topic: reader.string("sources_event_topic")?,
                security_protocol: reader.optional("kafka_security_protocol")?,
                sasl_mechanism: reader.optional("kafka_sasl_mechanism")?,
                sasl_username: reader.optional("kafka_sasl_username")?,
                sasl_password: reader.optional("kafka_sasl_password")?,
                ca_location: reader.optional("kafka_ca_location")?,
            },
            kruize: KruizeSettings {
                url: reader.string("kruize_url")?,
                max_bulk_chunk_size: reader.positive("kruize_max_bulk_chunk_size")? as usize,
                recommendation_fetch_delay_hours: reader.int("recommendation_fetch_delay")?,
                profile_retry_delay: Duration::from_secs(
                    reader.int("kruize_profile_retry_delay_secs")? as u64,
                ),
                request_timeout: Duration::from_secs(reader.positive("http_timeout_secs")? as u64),
            },
            database: DatabaseSettings {
                host: reader.string("db_host")?,
                port: reader.port("db_port")?,
                name: reader.string("db_name")?,
                user: reader.string("db_user")?,
                password: reader.string("db_password")?,
                ssl_mode: reader
                    .string("db_ssl_mode")?
                    .parse::<PgSslMode>()
                    .context("DB_SSL_MODE must be one of disable, allow, prefer, require, verify-ca, verify-full")?,
                max_connections: reader.positive("db_max_connections")? as u32,
            },
            rbac: RbacSettings {
                enabled: reader.flag("rbac_enabled")?,
                protocol: reader.string("rbac_protocol")?,
                host: reader.string("rbac_host")?,
                port: reader.port("rbac_port")?,
            },
            api: ApiSettings {
                port: reader.port("api_port")?,
                prometheus_port: reader.port("prometheus_port")?,
                record_limit_csv: reader.positive("record_limit_csv")?,
                auth_mode,
                token_review_url: reader.optional("token_review_url")?,
                token_review_auth_token: reader.optional("token_review_auth_token")?,
                default_org_id: reader.string("default_org_id")?,
            },
            sources: SourcesSettings {
                base_url: reader.string("sources_api_base_url")?,
                prefix: reader.string("sources_api_prefix")?,
                onprem: reader.flag("onprem")?,
            },
            features: FeatureSettings {
                disable_namespace_recommendation: reader.flag("disable_namespace_recommendation")?,
                unleash_url: reader.optional("unleash_url")?,
                unleash_token: reader.optional("unleash_token")?,
                unleash_refresh: Duration::from_secs(reader.positive("unleash_refresh_secs")? as u64),
            },
            housekeeper: HousekeeperSettings {
                data_retention_days: reader.positive("data_retention_period")?,
                interval: Duration::from_secs(reader.positive("housekeeper_interval_secs")? as u64),
            },
        };

        if settings.api.auth_mode == AuthMode::BearerToken && settings.api.token_review_url.is_none()
        {
            bail!("TOKEN_REVIEW_URL is required when ID_PROVIDER=oauth2");
        }

        Ok(settings)
    }
}

/// Typed accessors over the built config, naming the offending key on error
struct Reader<'a> {
    cfg: &'a config::Config,
}

impl Reader<'_> {
    fn string(&self, key: &str) -> Result<String> {
        self.cfg
            .get_string(key)
            .with_context(|| format!("Invalid value for {}", key.to_uppercase()))
    }

    fn optional(&self, key: &str) -> Result<Option<String>> {
        let value = self.string(key)?;
        Ok(if value.trim().is_empty() { None } else { Some(value) })
    }

    fn int(&self, key: &str) -> Result<i64> {
        self.cfg
            .get_int(key)
            .with_context(|| format!("{} must be an integer", key.to_uppercase()))
    }

    fn positive(&self, key: &str) -> Result<i64> {
        let value = self.int(key)?;
        if value <= 0 {
            bail!("{} must be greater than zero, got {}", key.to_uppercase(), value);
        }
        Ok(value)
    }

    fn port(&self, key: &str) -> Result<u16> {
        let value = self.int(key)?;
        u16::try_from(value)
            .with_context(|| format!("{} is not a valid port: {}", key.to_uppercase(), value))
    }

    fn flag(&self, key: &str) -> Result<bool> {
        self.cfg
            .get_bool(key)
            .with_context(|| format!("{} must be a boolean", key.to_uppercase()))
    }
}
