//! URL Normalizer (Component C): `Canonicalize(url)` and
//! `DiscoverPagination(url, html)`.
//!
//! Both operations go through the fetcher rather than a bare HTTP call, so
//! SSRF guards, rate limiting, and breaker state apply to preflight probes
//! the same as to any other request.

use crate::clock::SharedClock;
use crate::error::Outcome;
use crate::fetcher::{FetchOptions, Fetcher};
use dashmap::DashMap;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const DEFAULT_MAX_VARIANTS: usize = 8;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// One attempted variant and what it returned, kept for diagnostics when
/// every variant fails.
#[derive(Debug, Clone)]
pub struct VariantAttempt {
    pub url: String,
    pub outcome_summary: String,
}

#[derive(Debug, Clone)]
pub struct CanonicalizeResult {
    pub canonical_url: Option<String>,
    pub attempts: Vec<VariantAttempt>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PaginationResult {
    pub pages: Vec<String>,
    pub errors: Vec<String>,
}

/// Generate the deterministic, deduplicated set of canonicalization
/// candidates for `url`: HTTPS upgrade, `www` toggle, apex-domain variant,
/// and trailing-slash variants, capped at `max_variants`.
pub fn generate_variants(url: &str, max_variants: usize) -> Vec<String> {
    let Ok(parsed) = Url::parse(url) else { return Vec::new() };
    if parsed.host_str().is_none() {
        return Vec::new();
    }

    let mut variants: Vec<Url> = Vec::new();
    let mut push = |mut candidate: Url| {
        if candidate.path().is_empty() {
            candidate.set_path("/");
        }
        if !variants.iter().any(|v| v.as_str() == candidate.as_str()) && candidate.as_str() != parsed.as_str() {
            variants.push(candidate);
        }
    };

    if parsed.scheme() == "http" {
        let mut https = parsed.clone();
        let _ = https.set_scheme("https");
        push(https);
    }

    let host = parsed.host_str().unwrap_or_default().to_string();
    if let Some(apex) = host.strip_prefix("www.") {
        let mut without_www = parsed.clone();
        let _ = without_www.set_host(Some(apex));
        push(without_www);
    } else {
        let mut with_www = parsed.clone();
        let _ = with_www.set_host(Some(&format!("www.{host}")));
        push(with_www);
    }

    if parsed.path() != "/" && parsed.path().ends_with('/') {
        let mut trimmed = parsed.clone();
        trimmed.set_path(parsed.path().trim_end_matches('/'));
        push(trimmed);
    } else if !parsed.path().is_empty() && parsed.path() != "/" && !parsed.path().ends_with('/') {
        let mut slashed = parsed.clone();
        slashed.set_path(&format!("{}/", parsed.path()));
        push(slashed);
    }

    variants.truncate(max_variants);
    variants.into_iter().map(|v| v.to_string()).collect()
}

fn cache_key(url: &Url) -> String {
    format!("{}{}", url.host_str().unwrap_or_default(), url.path())
}

struct CacheEntry {
    canonical_url: String,
    expires_at_millis: u64,
}

pub struct Normalizer {
    fetcher: Arc<Fetcher>,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_variants: usize,
    clock: SharedClock,
    next_selector: Selector,
    pagination_class_selector: Selector,
}

impl Normalizer {
    pub fn new(fetcher: Arc<Fetcher>, clock: SharedClock) -> Self {
        Self {
            fetcher,
            cache: DashMap::new(),
            ttl: DEFAULT_CACHE_TTL,
            max_variants: DEFAULT_MAX_VARIANTS,
            clock,
            next_selector: Selector::parse(r#"a[rel~="next"]"#).expect("static selector"),
            pagination_class_selector: Selector::parse(
                r#"[class*="pagination"] a, [class*="pager"] a, [role="navigation"] a"#,
            )
            .expect("static selector"),
        }
    }

    pub async fn canonicalize(&self, url: &str) -> CanonicalizeResult {
        let Ok(parsed) = Url::parse(url) else {
            return CanonicalizeResult { canonical_url: None, attempts: vec![], error: Some("invalid url".into()) };
        };
        let key = cache_key(&parsed);
        if let Some(entry) = self.cache.get(&key) {
            if entry.expires_at_millis > self.clock.now_millis() {
                return CanonicalizeResult { canonical_url: Some(entry.canonical_url.clone()), attempts: vec![], error: None };
            }
        }

        let variants = generate_variants(url, self.max_variants);
        let mut attempts = Vec::with_capacity(variants.len() + 1);

        let mut candidates = vec![url.to_string()];
        candidates.extend(variants);

        for candidate in candidates {
            let outcome = self.probe(&candidate).await;
            let summary = summarize(&outcome);
            let is_success = outcome.is_success();
            attempts.push(VariantAttempt { url: candidate.clone(), outcome_summary: summary });
            if is_success {
                self.cache.insert(
                    key.clone(),
                    CacheEntry { canonical_url: candidate.clone(), expires_at_millis: self.clock.now_millis() + self.ttl.as_millis() as u64 },
                );
                return CanonicalizeResult { canonical_url: Some(candidate), attempts, error: None };
            }
        }

        CanonicalizeResult { canonical_url: None, attempts, error: Some("all-variants-failed".into()) }
    }

    async fn probe(&self, url: &str) -> Outcome {
        let head_options = FetchOptions { method: reqwest::Method::HEAD, max_retries: 0, ..FetchOptions::default() };
        let outcome = self.fetcher.fetch(url, &head_options).await;
        match outcome {
            Outcome::ClientError { status: 405 } => {
                let get_options = FetchOptions { max_retries: 0, ..FetchOptions::default() };
                self.fetcher.fetch(url, &get_options).await
            }
            other => other,
        }
    }

    /// Discover pagination links in `html`, probing each candidate with a
    /// HEAD fetch (falling back to GET on 405) until `max_pages` confirmed or
    /// `consecutive_404_threshold` consecutive non-2xx responses.
    pub async fn discover_pagination(
        &self,
        base_url: &str,
        html: &str,
        max_pages: usize,
        consecutive_404_threshold: usize,
    ) -> PaginationResult {
        let Ok(base) = Url::parse(base_url) else {
            return PaginationResult { pages: vec![], errors: vec!["invalid base url".into()] };
        };

        let mut candidates: Vec<Url> = Vec::new();
        {
            let document = Html::parse_document(html);
            let mut push_candidate = |resolved: Url| {
                if !candidates.iter().any(|c| c.as_str() == resolved.as_str()) {
                    candidates.push(resolved);
                }
            };

            for el in document.select(&self.next_selector) {
                if let Some(href) = el.value().attr("href") {
                    if let Ok(resolved) = base.join(href) {
                        push_candidate(resolved);
                    }
                }
            }
            for el in document.select(&self.pagination_class_selector) {
                let looks_like_next = el
                    .value()
                    .attr("aria-label")
                    .map(|label| label.to_lowercase().contains("next"))
                    .unwrap_or(false)
                    || el.text().any(|t| t.to_lowercase().contains("next"));
                if looks_like_next {
                    if let Some(href) = el.value().attr("href") {
                        if let Ok(resolved) = base.join(href) {
                            push_candidate(resolved);
                        }
                    }
                }
            }
            if let Some(templated) = next_numeric_page(&base) {
                push_candidate(templated);
            }
        }

        let mut pages = Vec::new();
        let mut errors = Vec::new();
        let mut consecutive_failures = 0usize;

        for candidate in candidates {
            if pages.len() >= max_pages || consecutive_failures >= consecutive_404_threshold {
                break;
            }
            let outcome = self.probe(candidate.as_str()).await;
            if outcome.is_success() {
                pages.push(candidate.to_string());
                consecutive_failures = 0;
            } else {
                consecutive_failures += 1;
                errors.push(format!("{}: {}", candidate, summarize(&outcome)));
            }
        }

        PaginationResult { pages, errors }
    }
}

/// Derive a templated "next page" URL by incrementing a trailing numeric
/// path segment, if one exists (e.g. `/articles/3` -> `/articles/4`).
fn next_numeric_page(base: &Url) -> Option<Url> {
    let segments: Vec<&str> = base.path_segments()?.collect();
    let last = *segments.last()?;
    let n: u64 = last.parse().ok()?;
    let mut next = base.clone();
    let mut new_segments = segments[..segments.len() - 1].to_vec();
    let incremented = (n + 1).to_string();
    new_segments.push(&incremented);
    next.set_path(&new_segments.join("/"));
    Some(next)
}

fn summarize(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success { response } => format!("status {}", response.status),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_https_upgrade_and_www_toggle() {
        let variants = generate_variants("http://example.com/page", 10);
        assert!(variants.contains(&"https://example.com/page".to_string()));
        assert!(variants.contains(&"http://www.example.com/page".to_string()));
    }

    #[test]
    fn strips_www_for_apex_variant() {
        let variants = generate_variants("https://www.example.com/", 10);
        assert!(variants.iter().any(|v| v == "https://example.com/"));
    }

    #[test]
    fn root_path_is_not_trailing_slash_toggled() {
        let variants = generate_variants("https://example.com/", 10);
        assert!(!variants.contains(&"https://example.com".to_string()));
    }

    #[test]
    fn invalid_url_returns_empty_variants() {
        assert!(generate_variants("not a url", 10).is_empty());
    }

    #[test]
    fn caps_at_max_variants() {
        let variants = generate_variants("http://www.example.com/page/", 1);
        assert_eq!(variants.len(), 1);
    }

    #[test]
    fn next_numeric_page_increments_trailing_segment() {
        let base = Url::parse("https://example.com/articles/3").unwrap();
        let next = next_numeric_page(&base).unwrap();
        assert_eq!(next.path(), "/articles/4");
    }

    #[test]
    fn next_numeric_page_none_without_trailing_number() {
        let base = Url::parse("https://example.com/articles/latest").unwrap();
        assert!(next_numeric_page(&base).is_none());
    }

    #[test]
    fn discover_pagination_parses_rel_next_link() {
        let html = r#"<html><body><a rel="next" href="/page/2">Next</a></body></html>"#;
        let document = Html::parse_document(html);
        let selector = Selector::parse(r#"a[rel~="next"]"#).unwrap();
        let found: Vec<_> = document.select(&selector).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value().attr("href"), Some("/page/2"));
    }
}
