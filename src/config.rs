//! Runtime configuration, loaded from environment variables (optionally via
//! a `.env` file for local development).

use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub log_filter: String,

    pub cache_dir: PathBuf,
    pub local_initialise: bool,

    pub memory_size_max: u64,
    pub memory_count_max: u64,

    pub local_size_max: u64,
    pub local_count_max: u64,

    pub remote_credentials: String,
    pub initialise_store: bool,

    pub remote_cache_container: String,
    pub remote_cache_size_max: u64,
    pub remote_cache_count_max: u64,

    pub remote_store_container: String,

    pub url_lifetime_secs: u64,
    pub url_lifetime_slack_secs: u64,
    pub url_key: String,
    pub url_method: String,

    pub hysteresis: f64,
    pub eager_writeback: bool,

    pub max_upload_bytes: u64,

    pub default_thumbnail_w: u32,
    pub default_thumbnail_h: u32,
    pub default_format: String,
    pub equalise: bool,
    pub liquid_resize: bool,
    pub sharpen: bool,
    pub liquid_cutin_ratio: f64,

    pub canonical_format_used: bool,
    pub canonical_format: String,

    pub error_threshold: u64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("invalid value for {key}: {v}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let url_method = env_or("IMAGEVAULT_URL_METHOD", "GET");
        if url_method != "GET" {
            anyhow::bail!("IMAGEVAULT_URL_METHOD: only \"GET\" is supported, got {url_method}");
        }

        Ok(Config {
            bind_addr: env_or("IMAGEVAULT_BIND_ADDR", "0.0.0.0:8080"),
            port: parse_env("IMAGEVAULT_PORT", 8080u16).context("IMAGEVAULT_PORT")?,
            log_filter: env_or("IMAGEVAULT_LOG_FILTER", "info"),

            cache_dir: PathBuf::from(env_or("IMAGEVAULT_CACHE_DIR", "./data/cache")),
            local_initialise: parse_env("IMAGEVAULT_LOCAL_INITIALISE", false)
                .context("IMAGEVAULT_LOCAL_INITIALISE")?,

            memory_size_max: parse_env("IMAGEVAULT_MEMORY_SIZE_MAX", 64 * 1024 * 1024)
                .context("IMAGEVAULT_MEMORY_SIZE_MAX")?,
            memory_count_max: parse_env("IMAGEVAULT_MEMORY_COUNT_MAX", 2_000)
                .context("IMAGEVAULT_MEMORY_COUNT_MAX")?,

            local_size_max: parse_env("IMAGEVAULT_LOCAL_SIZE_MAX", 1024 * 1024 * 1024)
                .context("IMAGEVAULT_LOCAL_SIZE_MAX")?,
            local_count_max: parse_env("IMAGEVAULT_LOCAL_COUNT_MAX", 50_000)
                .context("IMAGEVAULT_LOCAL_COUNT_MAX")?,

            remote_credentials: env_or("IMAGEVAULT_REMOTE_CREDENTIALS", ""),
            initialise_store: parse_env("IMAGEVAULT_INITIALISE_STORE", false)
                .context("IMAGEVAULT_INITIALISE_STORE")?,

            remote_cache_container: env_or("IMAGEVAULT_REMOTE_CACHE_CONTAINER", "image-cache"),
            remote_cache_size_max: parse_env("IMAGEVAULT_REMOTE_CACHE_SIZE_MAX", 0)
                .context("IMAGEVAULT_REMOTE_CACHE_SIZE_MAX")?,
            remote_cache_count_max: parse_env("IMAGEVAULT_REMOTE_CACHE_COUNT_MAX", 0)
                .context("IMAGEVAULT_REMOTE_CACHE_COUNT_MAX")?,

            remote_store_container: env_or("IMAGEVAULT_REMOTE_STORE_CONTAINER", "image-store"),

            url_lifetime_secs: parse_env("IMAGEVAULT_URL_LIFETIME_SECS", 300)
                .context("IMAGEVAULT_URL_LIFETIME_SECS")?,
            url_lifetime_slack_secs: parse_env("IMAGEVAULT_URL_LIFETIME_SLACK_SECS", 60)
                .context("IMAGEVAULT_URL_LIFETIME_SLACK_SECS")?,
            url_key: env_or("IMAGEVAULT_URL_KEY", "lifetime"),
            url_method,

            hysteresis: parse_env("IMAGEVAULT_HYSTERESIS", 0.8)
                .context("IMAGEVAULT_HYSTERESIS")?,
            eager_writeback: parse_env("IMAGEVAULT_EAGER_WRITEBACK", false)
                .context("IMAGEVAULT_EAGER_WRITEBACK")?,

            max_upload_bytes: parse_env("IMAGEVAULT_MAX_UPLOAD_BYTES", 20 * 1024 * 1024)
                .context("IMAGEVAULT_MAX_UPLOAD_BYTES")?,

            default_thumbnail_w: parse_env("IMAGEVAULT_DEFAULT_THUMBNAIL_W", 200)
                .context("IMAGEVAULT_DEFAULT_THUMBNAIL_W")?,
            default_thumbnail_h: parse_env("IMAGEVAULT_DEFAULT_THUMBNAIL_H", 200)
                .context("IMAGEVAULT_DEFAULT_THUMBNAIL_H")?,
            default_format: env_or("IMAGEVAULT_DEFAULT_FORMAT", "jpg"),
            equalise: parse_env("IMAGEVAULT_EQUALISE", false).context("IMAGEVAULT_EQUALISE")?,
            liquid_resize: parse_env("IMAGEVAULT_LIQUID_RESIZE", false)
                .context("IMAGEVAULT_LIQUID_RESIZE")?,
            sharpen: parse_env("IMAGEVAULT_SHARPEN", false).context("IMAGEVAULT_SHARPEN")?,
            liquid_cutin_ratio: parse_env("IMAGEVAULT_LIQUID_CUTIN_RATIO", 2.0)
                .context("IMAGEVAULT_LIQUID_CUTIN_RATIO")?,

            canonical_format_used: parse_env("IMAGEVAULT_CANONICAL_FORMAT_USED", false)
                .context("IMAGEVAULT_CANONICAL_FORMAT_USED")?,
            canonical_format: env_or("IMAGEVAULT_CANONICAL_FORMAT", "jpg"),

            error_threshold: parse_env("IMAGEVAULT_ERROR_THRESHOLD", 1_000)
                .context("IMAGEVAULT_ERROR_THRESHOLD")?,
        })
    }
}
