//! Cache settings and per-representation caching policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read cache settings from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid cache settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid cache settings: {0}")]
    Invalid(String),
}

/// Largest accepted `sweep_interval_secs` / `stale_retention_secs` (ten years).
const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Which storage backend holds variant records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSettings {
    #[default]
    Memory,
    File {
        dir: PathBuf,
    },
}

/// Process-wide cache settings.
///
/// ```
/// use respcache::cache::{BackendSettings, CacheSettings};
///
/// let settings = CacheSettings::from_json_str(
///     r#"{ "backend": { "kind": "file", "dir": "/var/cache/app" }, "sweep_interval_secs": 30 }"#,
/// ).unwrap();
/// assert!(matches!(settings.backend, BackendSettings::File { .. }));
/// assert_eq!(settings.stale_retention_secs, 300);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub backend: BackendSettings,
    /// How often expired records are swept. `0` disables the sweeper.
    pub sweep_interval_secs: u64,
    /// How long an expired record is retained for revalidation before the
    /// sweeper may drop it.
    pub stale_retention_secs: u64,
    /// Upper bound on handler execution during recompute.
    pub handler_timeout_ms: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: BackendSettings::Memory,
            sweep_interval_secs: 60,
            stale_retention_secs: 300,
            handler_timeout_ms: None,
        }
    }
}

impl CacheSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads settings from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let BackendSettings::File { dir } = &self.backend
            && dir.as_os_str().is_empty()
        {
            return Err(ConfigError::Invalid(
                "file backend requires a non-empty `dir`".to_owned(),
            ));
        }
        for (field, secs) in [
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("stale_retention_secs", self.stale_retention_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                return Err(ConfigError::Invalid(format!(
                    "`{field}` must be at most {MAX_WINDOW_SECS} (got {secs})"
                )));
            }
        }
        if self.handler_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "`handler_timeout_ms` must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn stale_retention(&self) -> Duration {
        Duration::from_secs(self.stale_retention_secs)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }
}

/// How one representation of a resource is cached.
///
/// `max_age` bounds freshness; `vary` names the request headers that select
/// among variants in addition to the negotiated media type. The remaining
/// flags only add directives to the emitted `Cache-Control` header.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use respcache::cache::CachePolicy;
///
/// let policy = CachePolicy::new(Duration::from_secs(60))
///     .s_max_age(Duration::from_secs(120))
///     .must_revalidate()
///     .vary("X-Count");
///
/// assert_eq!(
///     policy.cache_control(Duration::from_secs(60)),
///     "max-age=60, s-maxage=120, must-revalidate"
/// );
/// assert_eq!(policy.vary_headers(), ["x-count"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    max_age_secs: u64,
    #[serde(default)]
    s_max_age_secs: Option<u64>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    no_transform: bool,
    #[serde(default)]
    must_revalidate: bool,
    #[serde(default)]
    proxy_revalidate: bool,
    #[serde(default)]
    vary: Vec<String>,
}

impl CachePolicy {
    /// Freshness is tracked in whole seconds; sub-second parts are dropped.
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age_secs: max_age.as_secs(),
            s_max_age_secs: None,
            private: false,
            no_transform: false,
            must_revalidate: false,
            proxy_revalidate: false,
            vary: Vec::new(),
        }
    }

    #[must_use]
    pub fn s_max_age(mut self, s_max_age: Duration) -> Self {
        self.s_max_age_secs = Some(s_max_age.as_secs());
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    #[must_use]
    pub fn no_transform(mut self) -> Self {
        self.no_transform = true;
        self
    }

    #[must_use]
    pub fn must_revalidate(mut self) -> Self {
        self.must_revalidate = true;
        self
    }

    #[must_use]
    pub fn proxy_revalidate(mut self) -> Self {
        self.proxy_revalidate = true;
        self
    }

    /// Adds a request header to the vary declaration. Names are
    /// case-insensitive and kept in declaration order; duplicates are ignored.
    #[must_use]
    pub fn vary(mut self, header: &str) -> Self {
        let header = header.trim().to_ascii_lowercase();
        if !header.is_empty() && !self.vary.contains(&header) {
            self.vary.push(header);
        }
        self
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn vary_headers(&self) -> &[String] {
        &self.vary
    }

    /// Renders a `Cache-Control` value advertising `max_age` as the
    /// remaining lifetime.
    pub fn cache_control(&self, max_age: Duration) -> String {
        let mut directives = Vec::with_capacity(6);
        if self.private {
            directives.push("private".to_owned());
        }
        directives.push(format!("max-age={}", max_age.as_secs()));
        if let Some(s_max_age) = self.s_max_age_secs {
            directives.push(format!("s-maxage={s_max_age}"));
        }
        if self.no_transform {
            directives.push("no-transform".to_owned());
        }
        if self.must_revalidate {
            directives.push("must-revalidate".to_owned());
        }
        if self.proxy_revalidate {
            directives.push("proxy-revalidate".to_owned());
        }
        directives.join(", ")
    }
}
