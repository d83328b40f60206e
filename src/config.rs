use crate::credential::Credential;
use crate::error::CredentialError;
use crate::notification::{MAX_PAYLOAD_SIZE, Notification, Priority};
use crate::provider::{ProviderOptions, Server};
use crate::transport::Endpoint;
use clap::{Args, Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Debug, Parser)]
#[command(version, about = "Send a push notification through the gateway", long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub gateway: GatewayConfig,

    #[command(flatten)]
    pub credential: CredentialConfig,

    #[command(flatten)]
    pub telemetry: TelemetryConfig,

    #[command(flatten)]
    pub notification: NotificationArgs,
}

impl Config {
    #[must_use]
    pub fn load() -> Self {
        Self::parse()
    }
}

#[derive(Clone, Debug, Args)]
pub struct GatewayConfig {
    /// Gateway environment to send to
    #[arg(long, env = "APNS_ENVIRONMENT", value_enum, default_value_t = Server::Development)]
    pub environment: Server,

    /// Replace the environment's gateway address (host:port), e.g. for a local test gateway
    #[arg(long, env = "APNS_ENDPOINT_OVERRIDE")]
    pub endpoint_override: Option<Endpoint>,

    /// Timeout for a single connection attempt in milliseconds
    #[arg(long, env = "APNS_CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Total attempts for a transient connection failure
    #[arg(long, env = "APNS_CONNECT_ATTEMPTS", default_value_t = 3)]
    pub connect_attempts: usize,

    /// Initial backoff between connection attempts in milliseconds
    #[arg(long, env = "APNS_MIN_BACKOFF_MS", default_value_t = 100)]
    pub min_backoff_ms: u64,

    /// Maximum backoff between connection attempts in milliseconds
    #[arg(long, env = "APNS_MAX_BACKOFF_MS", default_value_t = 5_000)]
    pub max_backoff_ms: u64,
}

impl GatewayConfig {
    #[must_use]
    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            endpoint_override: self.endpoint_override.clone(),
            connect_attempts: self.connect_attempts.max(1),
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct CredentialConfig {
    /// PEM bundle with the client certificate chain and its private key
    #[arg(long, env = "APNS_CERT_PATH", conflicts_with = "key_path", required_unless_present = "key_path")]
    pub cert_path: Option<PathBuf>,

    /// PKCS#8 PEM signing key for token authentication
    #[arg(long, env = "APNS_KEY_PATH", requires_all = ["key_id", "team_id"])]
    pub key_path: Option<PathBuf>,

    /// Identifier of the signing key
    #[arg(long, env = "APNS_KEY_ID")]
    pub key_id: Option<String>,

    /// Developer team identifier, the issuer of provider tokens
    #[arg(long, env = "APNS_TEAM_ID")]
    pub team_id: Option<String>,
}

impl CredentialConfig {
    /// Reads the configured credential from disk.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or holds no usable identity.
    pub fn load(&self) -> Result<Credential, CredentialError> {
        if let Some(path) = &self.cert_path {
            let pem = std::fs::read(path)?;
            return Credential::certificate_from_pem(&pem);
        }

        match (&self.key_path, &self.key_id, &self.team_id) {
            (Some(path), Some(key_id), Some(team_id)) => {
                let pem = std::fs::read(path)?;
                Credential::token(team_id.clone(), key_id.clone(), &pem)
            }
            _ => Err(CredentialError::MissingKey),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, Args)]
pub struct TelemetryConfig {
    /// Log output format
    #[arg(long, env = "APNS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// OTLP collector endpoint; traces and metrics are only exported when set
    #[arg(long, env = "APNS_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

#[derive(Clone, Debug, Args)]
pub struct NotificationArgs {
    /// Hex device token of the recipient
    #[arg(long, env = "APNS_DEVICE_TOKEN")]
    pub device_token: String,

    /// Application bundle topic
    #[arg(long, env = "APNS_TOPIC")]
    pub topic: Option<String>,

    /// JSON payload, or @path to read it from a file
    #[arg(long, env = "APNS_PAYLOAD")]
    pub payload: String,

    /// Delivery priority: immediate (10) or power-considerate (5)
    #[arg(long, env = "APNS_PRIORITY")]
    pub priority: Option<Priority>,

    /// Expiration as seconds since the Unix epoch
    #[arg(long, env = "APNS_EXPIRATION")]
    pub expiration: Option<i64>,

    /// Notification identifier echoed back by the gateway
    #[arg(long, env = "APNS_ID")]
    pub id: Option<Uuid>,
}

impl NotificationArgs {
    /// Builds the notification described on the command line.
    ///
    /// # Errors
    /// Returns an error if the payload file cannot be read, the expiration is
    /// out of range, or the notification fails validation.
    pub fn to_notification(&self) -> anyhow::Result<Notification> {
        let payload = match self.payload.strip_prefix('@') {
            Some(path) => std::fs::read(path)?,
            None => self.payload.clone().into_bytes(),
        };

        let mut builder = Notification::builder(self.device_token.clone(), payload);
        if let Some(topic) = &self.topic {
            builder = builder.topic(topic.clone());
        }
        if let Some(priority) = self.priority {
            builder = builder.priority(priority);
        }
        if let Some(expiration) = self.expiration {
            builder = builder.expiration(OffsetDateTime::from_unix_timestamp(expiration)?);
        }
        if let Some(id) = self.id {
            builder = builder.id(id);
        }
        Ok(builder.build()?)
    }
}
