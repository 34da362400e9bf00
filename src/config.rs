use std::{env, path::PathBuf, time::Duration};

use crate::gate::XLSX_MAX_ROWS;

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub row_limit: u64,
    pub preview_limit: usize,
    pub preview_timeout: Duration,
    pub generate_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub poll_interval: Duration,
    pub release_delay: Duration,
    pub download_dir: PathBuf,
    pub server: Option<String>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            row_limit: XLSX_MAX_ROWS,
            preview_limit: 100,
            preview_timeout: Duration::from_secs(60),
            generate_timeout: Duration::from_secs(30 * 60),
            cleanup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1000),
            release_delay: Duration::from_millis(1500),
            download_dir: PathBuf::from("./downloads"),
            server: None,
            database: None,
            username: None,
            password: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let base_url = text_var("TRADE_EXPORT_BASE_URL").unwrap_or(defaults.base_url);

        let row_limit = parsed_var::<u64>("TRADE_EXPORT_ROW_LIMIT")
            .unwrap_or(defaults.row_limit)
            .max(1);

        let preview_limit = parsed_var::<usize>("TRADE_EXPORT_PREVIEW_LIMIT")
            .unwrap_or(defaults.preview_limit)
            .max(1);

        let preview_timeout = parsed_var::<u64>("TRADE_EXPORT_PREVIEW_TIMEOUT_SECONDS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.preview_timeout);

        let generate_timeout = parsed_var::<u64>("TRADE_EXPORT_GENERATE_TIMEOUT_SECONDS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.generate_timeout);

        let cleanup_timeout = parsed_var::<u64>("TRADE_EXPORT_CLEANUP_TIMEOUT_SECONDS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.cleanup_timeout);

        let poll_interval = parsed_var::<u64>("TRADE_EXPORT_POLL_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let release_delay = parsed_var::<u64>("TRADE_EXPORT_URL_RELEASE_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.release_delay);

        let download_dir = text_var("TRADE_EXPORT_DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.download_dir);

        Self {
            base_url,
            row_limit,
            preview_limit,
            preview_timeout,
            generate_timeout,
            cleanup_timeout,
            poll_interval,
            release_delay,
            download_dir,
            server: text_var("TRADE_EXPORT_SERVER"),
            database: text_var("TRADE_EXPORT_DATABASE"),
            username: text_var("TRADE_EXPORT_USERNAME"),
            password: env::var("TRADE_EXPORT_PASSWORD").ok(),
        }
    }
}

fn text_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    text_var(name).and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spreadsheet_target() {
        let config = Config::default();
        assert_eq!(config.row_limit, 1_048_576);
        assert!(config.generate_timeout > config.preview_timeout);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn env_values_are_trimmed_and_parsed() {
        env::set_var("TRADE_EXPORT_TEST_LIMIT", " \"250\" ");
        assert_eq!(parsed_var::<u64>("TRADE_EXPORT_TEST_LIMIT"), Some(250));
        env::set_var("TRADE_EXPORT_TEST_LIMIT", "lots");
        assert_eq!(parsed_var::<u64>("TRADE_EXPORT_TEST_LIMIT"), None);
        env::remove_var("TRADE_EXPORT_TEST_LIMIT");
        assert_eq!(text_var("TRADE_EXPORT_TEST_LIMIT"), None);
    }
}
