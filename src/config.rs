use crate::parser::{Currency, FieldLabels};
use std::{env, path::PathBuf, time::Duration};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub channel_secret: Option<String>,
    pub allow_unsigned: bool,
    pub access_token: String,
    pub api_base: String,
    pub data_api_base: String,
    pub notifications_enabled: bool,
    pub host_api_url: Option<String>,
    pub host_api_key: Option<String>,
    pub redis_url: Option<String>,
    pub pending_ttl: Duration,
    pub workflow_retention: Duration,
    pub media_timeout: Duration,
    pub reply_timeout: Duration,
    pub connect_timeout: Duration,
    pub scratch_dir: PathBuf,
    pub default_currency: Currency,
    pub reject_unknown_lines: bool,
    pub field_labels: FieldLabels,
    pub broadcast_listings: bool,
    pub body_limit: usize,
    pub metrics_key: Option<String>,
    pub admin_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT").unwrap_or(8000),
            channel_secret: env_string("CHAT_CHANNEL_SECRET"),
            allow_unsigned: env_bool("WEBHOOK_ALLOW_UNSIGNED").unwrap_or(false),
            access_token: env_string("CHAT_ACCESS_TOKEN").unwrap_or_default(),
            api_base: env_string("CHAT_API_BASE")
                .unwrap_or_else(|| "https://api.line.me".to_string()),
            data_api_base: env_string("CHAT_DATA_API_BASE")
                .unwrap_or_else(|| "https://api-data.line.me".to_string()),
            notifications_enabled: env_bool("CHAT_NOTIFICATIONS_ENABLED").unwrap_or(true),
            host_api_url: env_string("HOST_API_URL"),
            host_api_key: env_string("HOST_API_KEY"),
            redis_url: env_string("REDIS_URL"),
            pending_ttl: Duration::from_secs(
                env_parse::<u64>("PENDING_UPLOAD_TTL_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(3600),
            ),
            workflow_retention: Duration::from_secs(
                env_parse("WORKFLOW_RETENTION_SECS").unwrap_or(24 * 3600),
            ),
            media_timeout: Duration::from_secs(env_parse("MEDIA_TIMEOUT_SECS").unwrap_or(30)),
            reply_timeout: Duration::from_secs(env_parse("REPLY_TIMEOUT_SECS").unwrap_or(10)),
            connect_timeout: Duration::from_secs(
                env_parse("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5),
            ),
            scratch_dir: env_string("MEDIA_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("groupbuy-media")),
            default_currency: env_string("DEFAULT_CURRENCY")
                .and_then(|code| Currency::from_code(&code))
                .unwrap_or(Currency::Twd),
            reject_unknown_lines: env_bool("PARSER_REJECT_UNKNOWN_LINES").unwrap_or(false),
            field_labels: field_labels(),
            broadcast_listings: env_bool("BROADCAST_NEW_LISTINGS").unwrap_or(true),
            body_limit: env_parse::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(256 * 1024),
            metrics_key: env_string("METRICS_KEY"),
            admin_key: env_string("ADMIN_KEY"),
        }
    }
}

fn field_labels() -> FieldLabels {
    let defaults = FieldLabels::default();
    FieldLabels {
        name: env_string("FIELD_LABEL_NAME").unwrap_or(defaults.name),
        price: env_string("FIELD_LABEL_PRICE").unwrap_or(defaults.price),
        quantity: env_string("FIELD_LABEL_QUANTITY").unwrap_or(defaults.quantity),
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|value| parse_bool(&value))
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
