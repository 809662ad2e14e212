//! Request classification by URL pattern.

use hymnal_common::HymnalError;
use hymnal_net::Request;
use regex::{Regex, RegexBuilder};
use url::Url;

use crate::config::SupervisorConfig;

/// Which bucket a request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Top-level page navigation.
    Navigation,
    /// Matched a network-first pattern.
    NetworkFirst,
    /// Matched a cache-first pattern.
    CacheFirst,
    /// Matched nothing.
    Default,
}

/// Response-sourcing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    NetworkFirst,
    CacheFirst,
    StaleWhileRevalidate,
}

impl RequestClass {
    /// Strategy used for this class.
    pub fn strategy(&self) -> Strategy {
        match self {
            RequestClass::Navigation => Strategy::StaleWhileRevalidate,
            RequestClass::NetworkFirst | RequestClass::Default => Strategy::NetworkFirst,
            RequestClass::CacheFirst => Strategy::CacheFirst,
        }
    }
}

/// Compiled pattern sets for one supervisor generation.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    network_first: Vec<Regex>,
    cache_first: Vec<Regex>,
    analytics: Vec<Regex>,
}

impl RequestClassifier {
    /// Compile the patterns of `config`.
    pub fn new(config: &SupervisorConfig) -> Result<Self, HymnalError> {
        Ok(Self {
            network_first: compile(&config.network_first_patterns, false)?,
            cache_first: compile(&config.cache_first_patterns, false)?,
            analytics: compile(&config.analytics_patterns, true)?,
        })
    }

    /// Whether the URL belongs to a telemetry endpoint.
    pub fn is_analytics(&self, url: &Url) -> bool {
        matches_any(&self.analytics, url)
    }

    /// Classify a request. Navigation wins over every URL pattern, and
    /// network-first patterns win over cache-first ones.
    pub fn classify(&self, request: &Request) -> RequestClass {
        if request.is_navigation() {
            RequestClass::Navigation
        } else if matches_any(&self.network_first, &request.url) {
            RequestClass::NetworkFirst
        } else if matches_any(&self.cache_first, &request.url) {
            RequestClass::CacheFirst
        } else {
            RequestClass::Default
        }
    }
}

fn compile(patterns: &[String], case_insensitive: bool) -> Result<Vec<Regex>, HymnalError> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(case_insensitive)
                .build()
                .map_err(|e| HymnalError::config_with_source(format!("bad pattern {p}"), e))
        })
        .collect()
}

fn matches_any(patterns: &[Regex], url: &Url) -> bool {
    patterns.iter().any(|re| re.is_match(url.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RequestClassifier {
        RequestClassifier::new(&SupervisorConfig::default()).unwrap()
    }

    fn get(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    #[test]
    fn test_hymn_data_is_network_first() {
        // Also under /static/, but the data file pattern takes precedence.
        let class = classifier().classify(&get("https://hymnal.app/static/hymns.json"));
        assert_eq!(class, RequestClass::NetworkFirst);
        assert_eq!(class.strategy(), Strategy::NetworkFirst);
    }

    #[test]
    fn test_api_is_network_first() {
        let class = classifier().classify(&get("https://hymnal.app/api/favourites?user=3"));
        assert_eq!(class, RequestClass::NetworkFirst);
    }

    #[test]
    fn test_assets_are_cache_first() {
        let c = classifier();
        for url in [
            "https://hymnal.app/icons/icon-192.png",
            "https://hymnal.app/favicon.ico",
            "https://hymnal.app/cover.WEBP.webp",
            "https://hymnal.app/assets/index-4f2a.js",
            "https://hymnal.app/assets/index-4f2a.css",
            "https://hymnal.app/static/fonts/serif.woff2",
        ] {
            assert_eq!(c.classify(&get(url)), RequestClass::CacheFirst, "{url}");
        }
    }

    #[test]
    fn test_extension_must_end_the_url() {
        let class = classifier().classify(&get("https://hymnal.app/assets/app.js?v=3"));
        assert_eq!(class, RequestClass::Default);
    }

    #[test]
    fn test_unmatched_is_default() {
        let class = classifier().classify(&get("https://hymnal.app/songs/42"));
        assert_eq!(class, RequestClass::Default);
        assert_eq!(class.strategy(), Strategy::NetworkFirst);
    }

    #[test]
    fn test_navigation_beats_patterns() {
        let request = Request::navigate(Url::parse("https://hymnal.app/static/page.html").unwrap());
        let class = classifier().classify(&request);
        assert_eq!(class, RequestClass::Navigation);
        assert_eq!(class.strategy(), Strategy::StaleWhileRevalidate);
    }

    #[test]
    fn test_analytics_is_case_insensitive() {
        let c = classifier();
        assert!(c.is_analytics(&Url::parse("https://cloud.umami.is/script.js").unwrap()));
        assert!(c.is_analytics(&Url::parse("https://stats.example.com/UMAMI/api/send").unwrap()));
        assert!(!c.is_analytics(&Url::parse("https://hymnal.app/static/hymns.json").unwrap()));
    }

    #[test]
    fn test_injected_patterns() {
        let config = SupervisorConfig {
            network_first_patterns: vec![r"/live/".into()],
            cache_first_patterns: vec![],
            ..SupervisorConfig::default()
        };
        let c = RequestClassifier::new(&config).unwrap();
        assert_eq!(c.classify(&get("https://x.test/live/feed")), RequestClass::NetworkFirst);
        assert_eq!(c.classify(&get("https://x.test/logo.png")), RequestClass::Default);
    }
}
