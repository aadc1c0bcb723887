use axum::http::{
    header::{ACCEPT, COOKIE, ORIGIN, REFERER, USER_AGENT},
    HeaderMap, HeaderName, HeaderValue,
};
use tracing::{debug, warn};

use crate::resolver::ResolvedSource;
use crate::settings::HeaderDefaults;
use crate::task::DedupKey;

/// Request headers sent upstream by both ffprobe and ffmpeg.
#[derive(Debug, Clone, Default)]
pub struct HeaderBlock(HeaderMap);

impl HeaderBlock {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `-headers` argument: one `Name: value` per line, CRLF terminated.
    pub fn to_ffmpeg_block(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.0 {
            if let Ok(value) = value.to_str() {
                out.push_str(&canonical_name(name));
                out.push_str(": ");
                out.push_str(value);
                out.push_str("\r\n");
            }
        }
        out
    }

    /// Header names only, for logs. Values may carry credentials.
    pub fn redacted(&self) -> String {
        self.0
            .keys()
            .map(canonical_name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn canonical_name(name: &HeaderName) -> String {
    name.as_str()
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

pub struct HeaderBuilder {
    defaults: HeaderDefaults,
}

impl HeaderBuilder {
    pub fn new(defaults: HeaderDefaults) -> Self {
        Self { defaults }
    }

    /// Merge upstream headers, synthesize the auth cookie and fill in the
    /// browser-like defaults the storage provider expects.
    pub fn build(&self, source: &ResolvedSource, key: &DedupKey) -> HeaderBlock {
        let mut map = HeaderMap::new();

        for (name, value) in &source.headers {
            match (
                HeaderName::from_bytes(name.trim().as_bytes()),
                HeaderValue::from_str(value.trim()),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => warn!("dropping invalid upstream header {:?} for key={}", name, key),
            }
        }

        if let Some(cookie) = &source.auth_cookie {
            let pair = format!("{}={}", cookie.name, cookie.value);
            let merged = match map.get(COOKIE).and_then(|v| v.to_str().ok()) {
                Some(existing) if !existing.trim().is_empty() => {
                    format!("{}; {}", existing.trim().trim_end_matches(';'), pair)
                }
                _ => pair,
            };
            match HeaderValue::from_str(&merged) {
                Ok(v) => {
                    map.insert(COOKIE, v);
                }
                Err(_) => warn!("auth cookie {:?} is not a valid header value; key={}", cookie.name, key),
            }
        }

        let referer = map
            .get(REFERER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| self.defaults.referer.clone())
            .or_else(|| origin_of(&source.url).map(|o| format!("{o}/")));
        let origin = self
            .defaults
            .origin
            .clone()
            .or_else(|| referer.as_deref().and_then(origin_of));

        insert_default(&mut map, USER_AGENT, Some(&self.defaults.user_agent));
        insert_default(&mut map, REFERER, referer.as_deref());
        insert_default(&mut map, ORIGIN, origin.as_deref());
        insert_default(&mut map, ACCEPT, Some(&self.defaults.accept));

        debug!("built upstream headers for key={}: {}", key, HeaderBlock(map.clone()).redacted());
        HeaderBlock(map)
    }
}

fn insert_default(map: &mut HeaderMap, name: HeaderName, value: Option<&str>) {
    if map.contains_key(&name) {
        return;
    }
    if let Some(value) = value.and_then(|v| HeaderValue::from_str(v).ok()) {
        map.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::AuthCookie;
    use std::collections::HashMap;

    fn source() -> ResolvedSource {
        ResolvedSource {
            url: "https://cdn.example.com/files/movie.mkv?t=1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn synthesizes_cookie_and_defaults() {
        let mut src = source();
        src.auth_cookie = Some(AuthCookie {
            name: "UID".into(),
            value: "abc".into(),
            path: Some("/".into()),
        });
        src.headers = HashMap::from([("Cookie".to_string(), "CID=1".to_string())]);

        let block = HeaderBuilder::new(HeaderDefaults::default()).build(&src, &DedupKey::from_source("k"));
        assert_eq!(block.get("cookie"), Some("CID=1; UID=abc"));
        assert_eq!(block.get("referer"), Some("https://cdn.example.com/"));
        assert_eq!(block.get("origin"), Some("https://cdn.example.com"));
        assert_eq!(block.get("accept"), Some("*/*"));
        assert!(block.get("user-agent").unwrap().starts_with("Mozilla/5.0"));
    }

    #[test]
    fn upstream_headers_win_over_defaults() {
        let mut src = source();
        src.headers = HashMap::from([
            ("User-Agent".to_string(), "Upstream/1.0".to_string()),
            ("Referer".to_string(), "https://portal.example.org/play".to_string()),
        ]);

        let block = HeaderBuilder::new(HeaderDefaults::default()).build(&src, &DedupKey::from_source("k"));
        assert_eq!(block.get("user-agent"), Some("Upstream/1.0"));
        assert_eq!(block.get("origin"), Some("https://portal.example.org"));
    }

    #[test]
    fn ffmpeg_block_is_crlf_joined() {
        let block = HeaderBuilder::new(HeaderDefaults::default()).build(&source(), &DedupKey::from_source("k"));
        let text = block.to_ffmpeg_block();
        assert!(text.ends_with("\r\n"));
        assert_eq!(text.matches("\r\n").count(), block.len());
        assert!(text.contains("User-Agent: "));
        assert!(!block.redacted().contains("Mozilla"));
    }

    #[test]
    fn invalid_upstream_header_is_dropped() {
        let mut src = source();
        src.headers = HashMap::from([("Bad Header".to_string(), "x".to_string())]);
        let block = HeaderBuilder::new(HeaderDefaults::default()).build(&src, &DedupKey::from_source("k"));
        assert!(block.get("bad header").is_none());
        assert_eq!(block.len(), 4);
    }
}
