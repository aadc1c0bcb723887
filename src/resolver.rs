use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, TranscodeError};

/// Structured cookie the storage provider needs on every download request.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// A direct download location for one source file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolvedSource {
    pub url: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub auth_cookie: Option<AuthCookie>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Turns a stable source key (a cloud file handle) into a download URL.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, source_key: &str) -> Result<ResolvedSource>;

    /// Whether resolved URLs expire, so a restart must resolve again.
    fn is_time_limited(&self) -> bool {
        false
    }
}

/// Treats the source key itself as the download URL.
#[derive(Debug, Default)]
pub struct DirectResolver;

#[async_trait]
impl SourceResolver for DirectResolver {
    async fn resolve(&self, source_key: &str) -> Result<ResolvedSource> {
        let key = source_key.trim();
        let is_url = ["http://", "https://", "file://"]
            .iter()
            .any(|scheme| key.starts_with(scheme));
        if !is_url && !key.starts_with('/') {
            return Err(TranscodeError::Resolution {
                key: key.to_string(),
                reason: "not a URL or absolute path".to_string(),
            });
        }
        Ok(ResolvedSource {
            url: key.to_string(),
            file_name: file_name_from_url(key),
            ..Default::default()
        })
    }
}

/// Asks an HTTP endpoint for download info: `GET {endpoint}?key=<source key>`
/// answered with a `ResolvedSource` JSON body.
pub struct HttpResolver {
    client: reqwest::Client,
    endpoint: String,
    time_limited: bool,
}

impl HttpResolver {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, time_limited: bool) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            time_limited,
        })
    }
}

#[async_trait]
impl SourceResolver for HttpResolver {
    async fn resolve(&self, source_key: &str) -> Result<ResolvedSource> {
        let failed = |reason: String| TranscodeError::Resolution {
            key: source_key.to_string(),
            reason,
        };

        debug!("resolving source key={} via {}", source_key, self.endpoint);
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("key", source_key)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| failed(e.to_string()))?;

        let mut source: ResolvedSource = resp.json().await.map_err(|e| failed(e.to_string()))?;
        if source.url.is_empty() {
            return Err(failed("resolver returned an empty url".to_string()));
        }
        if source.file_name.is_none() {
            source.file_name = file_name_from_url(&source.url);
        }
        Ok(source)
    }

    fn is_time_limited(&self) -> bool {
        self.time_limited
    }
}

/// Last path component of a URL, without the query string.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    (!name.is_empty()).then(|| name.to_string())
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    Direct,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_kind")]
    pub kind: ResolverKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_time_limited")]
    pub time_limited: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            endpoint: None,
            time_limited: default_time_limited(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_kind() -> ResolverKind {
    ResolverKind::Direct
}

fn default_time_limited() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    15
}

pub fn from_config(config: &ResolverConfig) -> anyhow::Result<Arc<dyn SourceResolver>> {
    match config.kind {
        ResolverKind::Direct => {
            info!("Using direct source resolver");
            Ok(Arc::new(DirectResolver))
        }
        ResolverKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| anyhow::anyhow!("resolver.endpoint is required for the http resolver"))?;
            info!("Using http source resolver at {} (time_limited={})", endpoint, config.time_limited);
            Ok(Arc::new(HttpResolver::new(
                endpoint,
                Duration::from_secs(config.timeout_secs),
                config.time_limited,
            )?))
        }
    }
}
