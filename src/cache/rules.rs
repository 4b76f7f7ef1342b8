//! Cache-Control evaluation
//!
//! Parses the response `Cache-Control` and `Age` headers into a value
//! object that answers whether a buffered response may still be served at
//! a given instant.

use http::header::{AGE, CACHE_CONTROL};
use http::HeaderMap;

use crate::clock::{Duration, Instant};

// == Cache Rules ==
/// Parsed response caching directives.
///
/// `age_base` is the instant from which `max_age` is measured: the instant
/// of extraction, shifted earlier by any `Age` header seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRules {
    pub max_age: Duration,
    pub s_max_age: Duration,
    pub no_cache: bool,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    pub no_store: bool,
    pub private: bool,
    pub public: bool,
    pub must_understand: bool,
    pub no_transform: bool,
    pub immutable: bool,
    pub stale_while_revalidate: Duration,
    pub stale_if_error: Duration,
    pub age_base: Instant,
}

impl CacheRules {
    /// All-default rules anchored at `now`: zero durations, no flags set.
    pub fn new(now: Instant) -> Self {
        Self {
            max_age: Duration::ZERO,
            s_max_age: Duration::ZERO,
            no_cache: false,
            must_revalidate: false,
            proxy_revalidate: false,
            no_store: false,
            private: false,
            public: false,
            must_understand: false,
            no_transform: false,
            immutable: false,
            stale_while_revalidate: Duration::ZERO,
            stale_if_error: Duration::ZERO,
            age_base: now,
        }
    }

    /// Extracts caching directives from response headers.
    ///
    /// Elements are split on `;` and matched case-insensitively. Unknown
    /// directives are ignored and unparsable values become zero, so a
    /// malformed header devolves to immediate expiry rather than an error.
    pub fn extract(headers: &HeaderMap, now: Instant) -> Self {
        let mut rules = Self::new(now);

        if let Some(value) = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
            for element in value.split(';') {
                let element = element.trim();
                if element.is_empty() {
                    continue;
                }

                let (directive, value) = match element.split_once('=') {
                    Some((directive, value)) => (directive.trim(), Some(value.trim())),
                    None => (element, None),
                };

                match directive.to_ascii_lowercase().as_str() {
                    "max-age" => rules.max_age = parse_secs(value),
                    "s-max-age" => rules.s_max_age = parse_secs(value),
                    "stale-while-revalidate" => rules.stale_while_revalidate = parse_secs(value),
                    "stale-if-error" => rules.stale_if_error = parse_secs(value),
                    "no-cache" => rules.no_cache = true,
                    "no-store" => rules.no_store = true,
                    "must-revalidate" => rules.must_revalidate = true,
                    "proxy-revalidate" => rules.proxy_revalidate = true,
                    "private" => rules.private = true,
                    "public" => rules.public = true,
                    "must-understand" => rules.must_understand = true,
                    "no-transform" => rules.no_transform = true,
                    "immutable" => rules.immutable = true,
                    _ => {}
                }
            }
        }

        if let Some(age) = headers.get(AGE).and_then(|v| v.to_str().ok()) {
            let secs = age
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|secs| *secs >= 0)
                .unwrap_or(0);
            rules.age_base = now - Duration::from_secs(secs);
        }

        rules
    }

    /// Whether a response governed by these rules may be served at `instant`.
    ///
    /// Boundary condition: an entry is still valid when `instant` equals
    /// `age_base + max_age` exactly.
    pub fn valid_at(&self, instant: Instant) -> bool {
        if self.no_cache || self.no_store {
            return false;
        }
        if self.immutable {
            return true;
        }
        instant <= self.age_base + self.max_age
    }
}

/// Directive value in whole seconds; anything unparsable counts as zero.
fn parse_secs(value: Option<&str>) -> Duration {
    Duration::from_secs(
        value
            .and_then(|v| v.trim_matches('"').parse::<i64>().ok())
            .unwrap_or(0),
    )
}
