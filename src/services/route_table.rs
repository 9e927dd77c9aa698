//! Prefix route table and dispatcher.
//!
//! The table is built once from configuration and never mutated. Dispatch
//! picks the longest prefix that matches on a segment boundary, so
//! `/pro/luma/x` goes to the `/pro/luma` entry rather than a shorter one and
//! `/openapix` does not match `/openapi`.

use crate::api::auth::AuthLevel;
use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};

/// What happens to the matched prefix on the outgoing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRule {
    /// Drop the prefix: `/openapi/v1/models` becomes `/v1/models`.
    StripPrefix,
    /// Forward the full original path.
    Preserve,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub prefix: String,
    /// Key into [`AppConfig::providers`]
    pub provider: String,
    pub auth: AuthLevel,
    pub path_rule: PathRule,
    /// Require a verified challenge token when a challenge secret is configured
    pub challenge: bool,
}

impl RouteEntry {
    pub fn new(prefix: &str, provider: &str, auth: AuthLevel, path_rule: PathRule) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            provider: provider.to_string(),
            auth,
            path_rule,
            challenge: false,
        }
    }

    pub fn with_challenge(mut self) -> Self {
        self.challenge = true;
        self
    }

    fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    fn rewrite(&self, path: &str) -> String {
        match self.path_rule {
            PathRule::Preserve => path.to_string(),
            PathRule::StripPrefix => {
                let rest = &path[self.prefix.len()..];
                if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                }
            }
        }
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub entry: &'a RouteEntry,
    /// Path to send upstream after applying the entry's [`PathRule`]
    pub upstream_path: String,
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    // Sorted by descending prefix length so the first hit is the longest.
    entries: Vec<RouteEntry>,
}

/// Media providers served under their own name with the path preserved.
const PRESERVED_ROUTES: &[(&str, &str)] = &[
    ("/suno", "suno"),
    ("/luma", "luma"),
    ("/pro/luma", "luma"),
    ("/viggle", "viggle"),
    ("/pro/viggle", "viggle"),
    ("/runway", "runway"),
    ("/runwayml", "runwayml"),
    ("/kling", "kling"),
    ("/ideogram", "ideogram"),
    ("/pika", "pika"),
    ("/udio", "udio"),
    ("/pixverse", "pixverse"),
];

impl RouteTable {
    pub fn new(mut entries: Vec<RouteEntry>) -> Self {
        entries.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { entries }
    }

    /// Build the gateway's route table. Entries whose provider is missing
    /// from the configuration are skipped.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut entries = vec![
            RouteEntry::new(
                "/openapi",
                "openai",
                AuthLevel::SharedSecret,
                PathRule::StripPrefix,
            )
            .with_challenge(),
            RouteEntry::new("/mjapi", "mj", AuthLevel::SharedSecret, PathRule::StripPrefix),
            RouteEntry::new(
                "/sunoapi",
                "suno",
                AuthLevel::SharedSecret,
                PathRule::StripPrefix,
            ),
        ];
        entries.extend(PRESERVED_ROUTES.iter().map(|(prefix, provider)| {
            RouteEntry::new(prefix, provider, AuthLevel::SharedSecret, PathRule::Preserve)
        }));

        entries.retain(|entry| {
            let known = config.provider(&entry.provider).is_some();
            if !known {
                tracing::warn!(
                    prefix = %entry.prefix,
                    provider = %entry.provider,
                    "Skipping route for unconfigured provider"
                );
            }
            known
        });

        Self::new(entries)
    }

    /// Resolve `path` to its route entry and rewritten upstream path.
    pub fn dispatch(&self, path: &str) -> Result<RouteMatch<'_>> {
        self.entries
            .iter()
            .find(|entry| entry.matches(path))
            .map(|entry| RouteMatch {
                entry,
                upstream_path: entry.rewrite(path),
            })
            .ok_or_else(|| AppError::RouteNotFound(path.to_string()))
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn log_routes(&self) {
        for entry in &self.entries {
            tracing::info!(
                "Route {} -> {} (auth={:?}, path={:?}{})",
                entry.prefix,
                entry.provider,
                entry.auth,
                entry.path_rule,
                if entry.challenge { ", challenge" } else { "" }
            );
        }
    }
}
