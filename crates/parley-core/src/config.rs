use std::{env, fs, path::Path, time::Duration};

use crate::{errors::Error, transport::pagination::Cursor, Result};

pub const DEFAULT_API_HOST: &str = "https://api.parley.chat";
pub const DEFAULT_API_VERSION: &str = "v2";
pub const DEFAULT_COUNT_LIMIT: usize = 2000;

/// Typed configuration for a bot client.
#[derive(Clone, Debug)]
pub struct Config {
    // Credentials
    pub access_token: String,
    pub refresh_token: Option<String>,

    // REST endpoint
    pub api_host: String,
    pub api_version: String,
    pub user_agent: String,
    pub request_timeout: Duration,

    // Dispatch filters
    pub ignore_self: bool,
    pub ignore_bots: bool,

    // Pagination defaults
    pub page_limit: usize,
    pub page_backoff: Duration,
    /// `None` means unbounded.
    pub count_limit: Option<usize>,

    /// Maximum cached conversation snapshots; `None` keeps every snapshot.
    pub snapshot_capacity: Option<usize>,
}

impl Config {
    /// Defaults for everything but the access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            api_host: DEFAULT_API_HOST.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            user_agent: format!("parley/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(30),
            ignore_self: true,
            ignore_bots: true,
            page_limit: 50,
            page_backoff: Duration::from_millis(100),
            count_limit: Some(DEFAULT_COUNT_LIMIT),
            snapshot_capacity: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_api_host(mut self, host: impl Into<String>) -> Self {
        self.api_host = host.into();
        self
    }

    /// Load from `PARLEY_*` environment variables (and `.env` if present).
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let access_token = env_str("PARLEY_ACCESS_TOKEN").and_then(non_empty).ok_or_else(|| {
            Error::Config("PARLEY_ACCESS_TOKEN environment variable is required".to_string())
        })?;

        let mut cfg = Self::new(access_token);
        cfg.refresh_token = env_str("PARLEY_REFRESH_TOKEN").and_then(non_empty);

        if let Some(host) = env_str("PARLEY_API_HOST").and_then(non_empty) {
            cfg.api_host = host.trim_end_matches('/').to_string();
        }
        if let Some(version) = env_str("PARLEY_API_VERSION").and_then(non_empty) {
            cfg.api_version = version.trim_matches('/').to_string();
        }
        if let Some(ms) = env_u64("PARLEY_REQUEST_TIMEOUT_MS") {
            cfg.request_timeout = Duration::from_millis(ms);
        }

        cfg.ignore_self = env_bool("PARLEY_IGNORE_SELF").unwrap_or(cfg.ignore_self);
        cfg.ignore_bots = env_bool("PARLEY_IGNORE_BOTS").unwrap_or(cfg.ignore_bots);

        if let Some(limit) = env_usize("PARLEY_PAGE_LIMIT") {
            if limit == 0 {
                return Err(Error::Config("PARLEY_PAGE_LIMIT must be > 0".to_string()));
            }
            cfg.page_limit = limit;
        }
        if let Some(ms) = env_u64("PARLEY_PAGE_BACKOFF_MS") {
            cfg.page_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_usize("PARLEY_COUNT_LIMIT") {
            cfg.count_limit = zero_is_unbounded(n);
        }
        if let Some(n) = env_usize("PARLEY_SNAPSHOT_CAPACITY") {
            cfg.snapshot_capacity = zero_is_unbounded(n);
        }

        Ok(cfg)
    }

    /// Pagination cursor seeded from the configured defaults.
    pub fn default_cursor(&self) -> Cursor {
        Cursor {
            limit: self.page_limit,
            offset: 0,
            backoff: self.page_backoff,
            count_limit: self.count_limit,
            iterate: false,
        }
    }

    /// Absolute URL for `path`, prefixed with the API version when `versioned`.
    pub fn url_for(&self, path: &str, versioned: bool) -> String {
        let host = self.api_host.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if versioned {
            format!("{host}/{}/{path}", self.api_version)
        } else {
            format!("{host}/{path}")
        }
    }
}

fn zero_is_unbounded(n: usize) -> Option<usize> {
    if n == 0 {
        None
    } else {
        Some(n)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(v: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = v.strip_prefix(q).and_then(|rest| rest.strip_suffix(q)) {
            return inner;
        }
    }
    v
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::new("tok");
        assert!(cfg.ignore_self);
        assert!(cfg.ignore_bots);
        assert_eq!(cfg.count_limit, Some(2000));
        assert_eq!(cfg.api_version, "v2");
        assert!(cfg.user_agent.starts_with("parley/"));
        assert_eq!(cfg.snapshot_capacity, None);
    }

    #[test]
    fn url_for_joins_host_version_and_path() {
        let cfg = Config::new("tok").with_api_host("https://example.test/");
        assert_eq!(
            cfg.url_for("/conversations/c1", true),
            "https://example.test/v2/conversations/c1"
        );
        assert_eq!(cfg.url_for("auth/token", false), "https://example.test/auth/token");
    }

    #[test]
    fn strips_matching_quotes_only() {
        assert_eq!(strip_quotes("\"abc\""), "abc");
        assert_eq!(strip_quotes("'abc'"), "abc");
        assert_eq!(strip_quotes("\"abc'"), "\"abc'");
        assert_eq!(strip_quotes("\""), "\"");
    }

    #[test]
    fn zero_means_unbounded() {
        assert_eq!(zero_is_unbounded(0), None);
        assert_eq!(zero_is_unbounded(7), Some(7));
    }
}
