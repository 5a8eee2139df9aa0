//! 下载策略接口与按服务分派。
//!
//! 具体服务的抓取/转码逻辑不属于本模块；这里只定义同步阻塞的策略接口、
//! URL → 服务类型识别，以及服务类型 → 策略的注册表。

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use reqwest::Url;
use tracing::debug;

use super::models::ServiceType;

/// Raw progress sink handed to a strategy: `(percent 0..=100, bytes per second)`.
pub type ProgressSink<'a> = &'a mut dyn FnMut(f64, f64);

/// Performs the actual transfer for one service.
///
/// Called synchronously on the processor's worker thread. `Ok(false)` and
/// `Err` are both per-job failures; a panic is caught and treated the same way.
pub trait DownloadStrategy: Send + Sync {
    fn service(&self) -> ServiceType;

    fn download(&self, url: &str, save_path: &Path, progress: ProgressSink<'_>) -> Result<bool>;
}

pub trait StrategyResolver: Send + Sync {
    fn resolve(&self, url: &str) -> Option<Arc<dyn DownloadStrategy>>;
}

/// Parses `url` and accepts only absolute http(s) URLs with a host.
pub fn parse_http_url(url: &str) -> Option<Url> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = Url::parse(trimmed).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }
    Some(parsed)
}

// ── 服务识别 ──────────────────────────────────────────────────

/// Maps hosts to services: exact host match first, then any subdomain of a listed domain.
#[derive(Debug, Clone)]
pub struct ServiceDetector {
    domains: Vec<(String, ServiceType)>,
    allow_direct: bool,
}

impl ServiceDetector {
    pub fn new(service_domains: &BTreeMap<ServiceType, Vec<String>>, allow_direct: bool) -> Self {
        let mut domains = Vec::new();
        for (service, list) in service_domains {
            for d in list {
                let d = d.trim().to_ascii_lowercase();
                if !d.is_empty() {
                    domains.push((d, *service));
                }
            }
        }
        Self {
            domains,
            allow_direct,
        }
    }

    pub fn detect(&self, url: &str) -> Option<ServiceType> {
        let parsed = parse_http_url(url)?;
        let host = parsed.host_str()?.to_ascii_lowercase();

        if let Some((_, s)) = self.domains.iter().find(|(d, _)| *d == host) {
            return Some(*s);
        }
        if let Some((_, s)) = self.domains.iter().find(|(d, _)| is_subdomain(&host, d)) {
            return Some(*s);
        }
        if self.allow_direct {
            return Some(ServiceType::Direct);
        }
        debug!(target: "processor", "no service detected for host: {host}");
        None
    }
}

/// `sub.example.com` belongs to `example.com`; `notexample.com` does not.
fn is_subdomain(host: &str, domain: &str) -> bool {
    host.strip_suffix(domain).is_some_and(|prefix| prefix.ends_with('.'))
}

pub fn default_service_domains() -> BTreeMap<ServiceType, Vec<String>> {
    let table: [(ServiceType, &[&str]); 5] = [
        (ServiceType::Youtube, &["youtube.com", "youtu.be", "www.youtube.com"]),
        (
            ServiceType::Twitter,
            &["twitter.com", "x.com", "api.x.com", "mobile.x.com"],
        ),
        (
            ServiceType::Instagram,
            &["instagram.com", "www.instagram.com", "m.instagram.com"],
        ),
        (ServiceType::Pinterest, &["pinterest.com", "www.pinterest.com", "pin.it"]),
        (ServiceType::Soundcloud, &["soundcloud.com", "www.soundcloud.com"]),
    ];
    table
        .into_iter()
        .map(|(s, ds)| (s, ds.iter().map(|d| d.to_string()).collect()))
        .collect()
}

// ── 策略注册表 ──────────────────────────────────────────────────

pub struct StrategyRegistry {
    detector: ServiceDetector,
    strategies: HashMap<ServiceType, Arc<dyn DownloadStrategy>>,
}

impl StrategyRegistry {
    pub fn new(detector: ServiceDetector) -> Self {
        Self {
            detector,
            strategies: HashMap::new(),
        }
    }

    /// Registers `strategy` under its own service, replacing any previous one.
    pub fn register(&mut self, strategy: Arc<dyn DownloadStrategy>) {
        self.strategies.insert(strategy.service(), strategy);
    }

    pub fn with(mut self, strategy: Arc<dyn DownloadStrategy>) -> Self {
        self.register(strategy);
        self
    }

    pub fn supported_services(&self) -> Vec<ServiceType> {
        let mut v: Vec<ServiceType> = self.strategies.keys().copied().collect();
        v.sort();
        v
    }

    pub fn detect(&self, url: &str) -> Option<ServiceType> {
        self.detector.detect(url)
    }
}

impl StrategyResolver for StrategyRegistry {
    fn resolve(&self, url: &str) -> Option<Arc<dyn DownloadStrategy>> {
        let service = self.detector.detect(url)?;
        self.strategies.get(&service).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(ServiceType);

    impl DownloadStrategy for Noop {
        fn service(&self) -> ServiceType {
            self.0
        }

        fn download(&self, _: &str, _: &Path, _: ProgressSink<'_>) -> Result<bool> {
            Ok(true)
        }
    }

    fn detector(allow_direct: bool) -> ServiceDetector {
        ServiceDetector::new(&default_service_domains(), allow_direct)
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(parse_http_url("").is_none());
        assert!(parse_http_url("   ").is_none());
        assert!(parse_http_url("ftp://example.com/a").is_none());
        assert!(parse_http_url("not a url").is_none());
        assert!(parse_http_url(" https://example.com/a ").is_some());
    }

    #[test]
    fn detects_known_hosts() {
        let d = detector(false);
        assert_eq!(d.detect("https://youtu.be/abc"), Some(ServiceType::Youtube));
        assert_eq!(d.detect("https://x.com/u/status/1"), Some(ServiceType::Twitter));
        assert_eq!(
            d.detect("https://M.SoundCloud.com/artist/track"),
            Some(ServiceType::Soundcloud)
        );
        assert_eq!(d.detect("https://example.com/file.mp4"), None);
    }

    #[test]
    fn unknown_hosts_fall_back_to_direct_when_allowed() {
        let d = detector(true);
        assert_eq!(
            d.detect("https://cdn.example.com/file.mp4"),
            Some(ServiceType::Direct)
        );
        assert_eq!(d.detect(""), None);
    }

    #[test]
    fn service_domains_match_whole_labels_only() {
        let d = detector(true);
        for url in [
            "https://www.dropbox.com/s/abc/file.mp4",
            "https://netflix.com/title/1",
            "https://notyoutube.com/v.mp4",
        ] {
            assert_eq!(d.detect(url), Some(ServiceType::Direct), "{url}");
        }
        assert_eq!(d.detect("https://music.youtube.com/watch?v=1"), Some(ServiceType::Youtube));
        assert_eq!(d.detect("https://video.twimg.x.com/a"), Some(ServiceType::Twitter));

        assert!(is_subdomain("a.b.example.com", "example.com"));
        assert!(!is_subdomain("example.com", "example.com"));
        assert!(!is_subdomain("badexample.com", "example.com"));
    }

    #[test]
    fn registry_resolves_only_registered_services() {
        let registry = StrategyRegistry::new(detector(true))
            .with(Arc::new(Noop(ServiceType::Youtube)))
            .with(Arc::new(Noop(ServiceType::Direct)));

        assert_eq!(
            registry.supported_services(),
            vec![ServiceType::Youtube, ServiceType::Direct]
        );
        let yt = registry.resolve("https://www.youtube.com/watch?v=1").unwrap();
        assert_eq!(yt.service(), ServiceType::Youtube);
        assert!(registry.resolve("https://instagram.com/p/1").is_none());
        assert_eq!(
            registry.resolve("https://files.example.org/a.bin").unwrap().service(),
            ServiceType::Direct
        );
    }
}
