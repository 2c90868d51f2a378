use std::env;

use anyhow::{Context, Result};
use url::Url;

use crate::db::DEFAULT_MAX_POOL_SIZE;

pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "doc", "xlsx", "xls", "pptx", "ppt", "txt", "csv", "md",
];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub database_max_pool_size: u32,
    pub server_host: String,
    pub server_port: u16,
    pub environment: String,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
    pub refresh_cookie_secure: bool,
    pub refresh_cookie_domain: Option<String>,
    pub cors_allowed_origin: Option<String>,
    pub service_role_key: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_region: String,
    pub s3_bucket: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub default_model: String,
    pub free_model: String,
    pub max_upload_bytes: usize,
    pub allowed_extensions: Vec<String>,
    pub login_rate_limit: u32,
    pub login_rate_limit_window_secs: u64,
    pub api_rate_limit: u32,
    pub api_rate_limit_window_secs: u64,
    pub worker_enabled: bool,
    pub worker_poll_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_pool_size = env::var("DATABASE_MAX_POOL_SIZE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = parse_var("SERVER_PORT", 8000u16)?;
        let environment = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "docchat".to_string());
        let jwt_audience =
            env::var("JWT_AUDIENCE").unwrap_or_else(|_| "docchat-clients".to_string());
        let jwt_expiry_minutes = parse_var("JWT_EXPIRY_MINUTES", 60i64)?;
        let refresh_token_expiry_days = parse_var("REFRESH_TOKEN_EXPIRY_DAYS", 30i64)?;
        let refresh_cookie_secure = flag_var("REFRESH_COOKIE_SECURE", false);
        let refresh_cookie_domain = env::var("REFRESH_COOKIE_DOMAIN").ok();
        let cors_allowed_origin = env::var("CORS_ALLOWED_ORIGIN").ok();
        let service_role_key = non_empty_var("SERVICE_ROLE_KEY");
        let s3_endpoint = non_empty_var("S3_ENDPOINT");
        let s3_access_key = non_empty_var("S3_ACCESS_KEY");
        let s3_secret_key = non_empty_var("S3_SECRET_KEY");
        let s3_region = env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let s3_bucket = env::var("S3_BUCKET_NAME").context("S3_BUCKET_NAME must be set")?;
        let openai_api_key = non_empty_var("OPENAI_API_KEY");
        let openai_base_url = env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let default_model = env::var("DEFAULT_MODEL").unwrap_or_else(|_| "gpt-4-turbo".into());
        let free_model = env::var("FREE_MODEL").unwrap_or_else(|_| "gpt-3.5-turbo".into());
        let max_upload_mb = parse_var("MAX_UPLOAD_SIZE_MB", 50usize)?;
        let allowed_extensions = env::var("ALLOWED_EXTENSIONS")
            .map(|raw| parse_extensions(&raw))
            .unwrap_or_else(|_| {
                DEFAULT_ALLOWED_EXTENSIONS
                    .iter()
                    .map(|ext| ext.to_string())
                    .collect()
            });
        let login_rate_limit = parse_var("LOGIN_RATE_LIMIT", 5u32)?;
        let login_rate_limit_window_secs = parse_var("LOGIN_RATE_LIMIT_WINDOW", 300u64)?;
        let api_rate_limit = parse_var("API_RATE_LIMIT", 100u32)?;
        let api_rate_limit_window_secs = parse_var("API_RATE_LIMIT_WINDOW", 60u64)?;
        let worker_enabled = flag_var("WORKER_ENABLED", true);
        let worker_poll_interval_secs = parse_var("WORKER_POLL_INTERVAL_SECS", 2u64)?;

        Ok(Self {
            database_url,
            database_max_pool_size,
            server_host,
            server_port,
            environment,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            jwt_expiry_minutes,
            refresh_token_expiry_days,
            refresh_cookie_secure,
            refresh_cookie_domain,
            cors_allowed_origin,
            service_role_key,
            s3_endpoint,
            s3_access_key,
            s3_secret_key,
            s3_region,
            s3_bucket,
            openai_api_key,
            openai_base_url,
            default_model,
            free_model,
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            allowed_extensions,
            login_rate_limit,
            login_rate_limit_window_secs,
            api_rate_limit,
            api_rate_limit_window_secs,
            worker_enabled,
            worker_poll_interval_secs,
        })
    }

    pub fn redacted_database_url(&self) -> String {
        redact_database_url(&self.database_url)
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn extension_allowed(&self, extension: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        self.allowed_extensions.iter().any(|allowed| *allowed == extension)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn flag_var(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect()
}

fn redact_database_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            let _ = parsed.set_password(Some("*****"));
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}
