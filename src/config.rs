//! Configuration file
//!
//! The gateway is configured by a single JSON document passed with `--config`.
//! Every field that shapes the caches or the token lifecycle has a default,
//! only the OAuth client registration is mandatory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Listing cache entry count floor
const MIN_CACHE_SIZE: u64 = 32;

/// Listing cache TTL floor in seconds
const MIN_CACHE_TTL: u64 = 10;

/// Raw on-disk configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub client_id: String,
    pub client_secret: String,
    /// Redirect URL registered with the OAuth application, ends in `/authcallback`
    pub redirect_url: String,
    /// Shared secret for `?auth=` and `?info=`
    #[serde(default)]
    pub password: String,
    /// Maximum number of cached folder listings
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
    /// Listing cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Content cache budget in MiB
    #[serde(default = "default_prefetch_size")]
    pub prefetch_size: u64,
    /// Files whose name matches are proxied through the content cache
    #[serde(default)]
    pub prefetch: Option<String>,
    /// Entries whose name matches are hidden from listings
    #[serde(default)]
    pub ignore: Option<String>,
    /// Seconds before the refresh limit at which callers stop trusting the token
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin: u64,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub token_dir: Option<PathBuf>,
    /// HTML inserted above every listing
    #[serde(default)]
    pub header: String,
    /// HTML inserted below every listing
    #[serde(default)]
    pub footer: String,
    /// Skip inlining README files under listings
    #[serde(default)]
    pub disable_readme: bool,
}

fn default_cache_size() -> u64 {
    1024
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_prefetch_size() -> u64 {
    512
}

fn default_refresh_margin() -> u64 {
    10
}

/// Validated configuration with compiled filters and resolved directories
#[derive(Debug, Clone)]
pub struct Settings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub password: String,
    pub cache_size: u64,
    pub cache_ttl: Duration,
    pub prefetch_bytes: u64,
    pub prefetch: Option<Regex>,
    pub ignore: Option<Regex>,
    pub refresh_margin: Duration,
    pub cache_dir: PathBuf,
    pub token_dir: PathBuf,
    pub header: String,
    pub footer: String,
    pub disable_readme: bool,
}

impl Config {
    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Check mandatory fields, clamp limits and compile the filters
    pub fn validate(self) -> Result<Settings> {
        if self.client_id.trim().is_empty() {
            return Err(anyhow!("client_id must be set"));
        }
        if self.client_secret.trim().is_empty() {
            return Err(anyhow!("client_secret must be set"));
        }
        if self.redirect_url.trim().is_empty() {
            return Err(anyhow!("redirect_url must be set"));
        }

        let prefetch = compile_filter("prefetch", self.prefetch.as_deref())?;
        let ignore = compile_filter("ignore", self.ignore.as_deref())?;

        let cache_dir = self.cache_dir.unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("onegate")
        });
        let token_dir = self.token_dir.unwrap_or_else(|| PathBuf::from("."));

        Ok(Settings {
            client_id: self.client_id,
            client_secret: self.client_secret,
            redirect_url: self.redirect_url,
            password: self.password,
            cache_size: self.cache_size.max(MIN_CACHE_SIZE),
            cache_ttl: Duration::from_secs(self.cache_ttl.max(MIN_CACHE_TTL)),
            prefetch_bytes: self.prefetch_size.saturating_mul(1024 * 1024),
            prefetch,
            ignore,
            refresh_margin: Duration::from_secs(self.refresh_margin),
            cache_dir,
            token_dir,
            header: self.header,
            footer: self.footer,
            disable_readme: self.disable_readme,
        })
    }
}

fn compile_filter(name: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        Some(p) if !p.is_empty() => Regex::new(p)
            .map(Some)
            .with_context(|| format!("Invalid {} pattern: {}", name, p)),
        _ => Ok(None),
    }
}

impl Settings {
    /// Whether a file is served through the content cache
    pub fn is_prefetchable(&self, name: &str) -> bool {
        self.prefetch.as_ref().is_some_and(|re| re.is_match(name))
    }

    /// Whether an entry is hidden from listings
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore.as_ref().is_some_and(|re| re.is_match(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_defaults_and_floors() {
        let settings = parse(
            r#"{
                "client_id": "id",
                "client_secret": "secret",
                "redirect_url": "https://example.com/authcallback",
                "cache_size": 4,
                "cache_ttl": 1
            }"#,
        )
        .validate()
        .unwrap();

        assert_eq!(settings.cache_size, MIN_CACHE_SIZE);
        assert_eq!(settings.cache_ttl, Duration::from_secs(MIN_CACHE_TTL));
        assert_eq!(settings.prefetch_bytes, 512 * 1024 * 1024);
        assert_eq!(settings.refresh_margin, Duration::from_secs(10));
        assert_eq!(settings.token_dir, PathBuf::from("."));
        assert!(!settings.is_prefetchable("a.mp4"));
        assert!(!settings.is_ignored("a.mp4"));
        assert!(settings.header.is_empty());
        assert!(!settings.disable_readme);
    }

    #[test]
    fn test_page_decorations() {
        let settings = parse(
            r#"{
                "client_id": "id",
                "client_secret": "secret",
                "redirect_url": "https://example.com/authcallback",
                "header": "<p>welcome</p>",
                "footer": "<p>bye</p>",
                "disable_readme": true
            }"#,
        )
        .validate()
        .unwrap();

        assert_eq!(settings.header, "<p>welcome</p>");
        assert_eq!(settings.footer, "<p>bye</p>");
        assert!(settings.disable_readme);
    }

    #[test]
    fn test_filters() {
        let settings = parse(
            r#"{
                "client_id": "id",
                "client_secret": "secret",
                "redirect_url": "https://example.com/authcallback",
                "prefetch": "\\.(md|txt)$",
                "ignore": "^\\."
            }"#,
        )
        .validate()
        .unwrap();

        assert!(settings.is_prefetchable("README.md"));
        assert!(!settings.is_prefetchable("movie.mkv"));
        assert!(settings.is_ignored(".secret"));
        assert!(!settings.is_ignored("public"));
    }

    #[test]
    fn test_missing_client_rejected() {
        let err = parse(r#"{"client_id": "", "client_secret": "s", "redirect_url": "r"}"#)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("client_id"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = parse(
            r#"{"client_id": "i", "client_secret": "s", "redirect_url": "r", "ignore": "("}"#,
        )
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("ignore"));
    }
}
