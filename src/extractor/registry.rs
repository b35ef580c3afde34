use super::{ExtractorError, ExtractorGateway, Manifest};
use crate::task::TaskOptions;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Platform tag for hosts no other platform claims.
pub const GENERIC_PLATFORM: &str = "generic";

const KNOWN_DOMAINS: &[(&str, &str)] = &[
    ("youtube.com", "youtube"),
    ("youtu.be", "youtube"),
    ("youtube-nocookie.com", "youtube"),
    ("vimeo.com", "vimeo"),
    ("soundcloud.com", "soundcloud"),
    ("dailymotion.com", "dailymotion"),
    ("dai.ly", "dailymotion"),
];

/// Resolves URLs of one platform.
#[async_trait]
pub trait PlatformResolver: Send + Sync {
    async fn resolve(&self, url: &Url, options: &TaskOptions) -> Result<Manifest, ExtractorError>;
}

/// Maps hosts to platform tags and platform tags to resolvers.
#[derive(Default)]
pub struct ExtractorRegistry {
    domains: HashMap<String, String>,
    resolvers: HashMap<String, Arc<dyn PlatformResolver>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already classifies the well-known video platforms.
    pub fn with_known_domains() -> Self {
        let mut registry = Self::new();
        for (domain, platform) in KNOWN_DOMAINS {
            registry.map_domain(domain, platform);
        }
        registry
    }

    /// Classify `domain` and its subdomains as `platform`.
    pub fn map_domain(&mut self, domain: &str, platform: &str) -> &mut Self {
        self.domains
            .insert(domain.to_ascii_lowercase(), platform.to_string());
        self
    }

    /// Use `resolver` for URLs classified as `platform`. The resolver
    /// registered for [`GENERIC_PLATFORM`] is the fallback for every platform.
    pub fn register(&mut self, platform: &str, resolver: Arc<dyn PlatformResolver>) -> &mut Self {
        self.resolvers.insert(platform.to_string(), resolver);
        self
    }

    /// Platform tag for a host name. `www.` is ignored and subdomains match
    /// their parent domain.
    pub fn platform_for_host(&self, host: &str) -> &str {
        let host = host.to_ascii_lowercase();
        let mut candidate = host.strip_prefix("www.").unwrap_or(&host);
        loop {
            if let Some(platform) = self.domains.get(candidate) {
                return platform;
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent,
                _ => return GENERIC_PLATFORM,
            }
        }
    }

    fn resolver_for(&self, platform: &str) -> Option<&Arc<dyn PlatformResolver>> {
        self.resolvers
            .get(platform)
            .or_else(|| self.resolvers.get(GENERIC_PLATFORM))
    }
}

#[async_trait]
impl ExtractorGateway for ExtractorRegistry {
    fn classify(&self, url: &Url) -> String {
        url.host_str()
            .map(|host| self.platform_for_host(host))
            .unwrap_or(GENERIC_PLATFORM)
            .to_string()
    }

    async fn resolve(&self, url: &str, options: &TaskOptions) -> Result<Manifest, ExtractorError> {
        let parsed =
            Url::parse(url).map_err(|e| ExtractorError::Unsupported(format!("{}: {}", url, e)))?;
        let platform = self.classify(&parsed);
        let resolver = self.resolver_for(&platform).ok_or_else(|| {
            ExtractorError::Unsupported(format!("no resolver for platform '{}'", platform))
        })?;
        debug!("Resolving {} with the {} resolver", url, platform);
        resolver.resolve(&parsed, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::StreamDescriptor;

    struct FixedResolver(&'static str);

    #[async_trait]
    impl PlatformResolver for FixedResolver {
        async fn resolve(
            &self,
            url: &Url,
            _options: &TaskOptions,
        ) -> Result<Manifest, ExtractorError> {
            Ok(Manifest {
                streams: vec![StreamDescriptor::new(url.as_str())],
                title: Some(self.0.to_string()),
                duration_secs: None,
            })
        }
    }

    fn classify(registry: &ExtractorRegistry, url: &str) -> String {
        registry.classify(&Url::parse(url).unwrap())
    }

    #[test]
    fn test_classify_known_hosts() {
        let registry = ExtractorRegistry::with_known_domains();
        assert_eq!(classify(&registry, "https://www.youtube.com/watch?v=x"), "youtube");
        assert_eq!(classify(&registry, "https://m.youtube.com/watch?v=x"), "youtube");
        assert_eq!(classify(&registry, "https://youtu.be/x"), "youtube");
        assert_eq!(classify(&registry, "https://player.vimeo.com/video/1"), "vimeo");
        assert_eq!(classify(&registry, "https://dai.ly/x"), "dailymotion");
        assert_eq!(classify(&registry, "https://example.com/a.mp4"), GENERIC_PLATFORM);
        assert_eq!(classify(&registry, "https://notyoutube.com/x"), GENERIC_PLATFORM);
    }

    #[tokio::test]
    async fn test_resolve_dispatches_by_platform() {
        let mut registry = ExtractorRegistry::with_known_domains();
        registry
            .register("youtube", Arc::new(FixedResolver("yt")))
            .register(GENERIC_PLATFORM, Arc::new(FixedResolver("generic")));

        let options = TaskOptions::default();
        let yt = registry
            .resolve("https://youtu.be/abc", &options)
            .await
            .unwrap();
        assert_eq!(yt.title.as_deref(), Some("yt"));

        // vimeo has no resolver of its own and falls back to generic
        let vimeo = registry
            .resolve("https://vimeo.com/1", &options)
            .await
            .unwrap();
        assert_eq!(vimeo.title.as_deref(), Some("generic"));
    }

    #[tokio::test]
    async fn test_resolve_without_resolver_is_unsupported() {
        let registry = ExtractorRegistry::with_known_domains();
        let err = registry
            .resolve("https://example.com/a.mp4", &TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractorError::Unsupported(_)));

        let err = registry
            .resolve("not a url", &TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractorError::Unsupported(_)));
    }
}
