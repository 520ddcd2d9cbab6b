//! Request classification.

use std::fmt;
use std::sync::Arc;

use cafe_net::Request;
use http::Method;
use serde::Serialize;
use tracing::trace;
use url::Url;

use crate::config::CacheConfig;

/// How an intercepted GET request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestCategory {
    /// Precache manifest entry: cache first.
    Precache,
    /// Primary stylesheet, script or HTML entry: network first.
    CoreAsset,
    /// Anything under the image segment: runtime cache first.
    Image,
    /// The data document: stale-while-revalidate.
    DataDocument,
    /// Document navigation: network first, root document fallback.
    Navigation,
    /// Everything else: cache first.
    Default,
}

impl fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Precache => "precache",
            Self::CoreAsset => "core-asset",
            Self::Image => "image",
            Self::DataDocument => "data-document",
            Self::Navigation => "navigation",
            Self::Default => "default",
        };
        f.write_str(name)
    }
}

/// Classifies requests for one generation and registration scope.
#[derive(Debug, Clone)]
pub struct RequestRouter {
    config: Arc<CacheConfig>,
    scope: Url,
}

impl RequestRouter {
    pub fn new(config: Arc<CacheConfig>, scope: Url) -> Self {
        Self { config, scope }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Classify a request. `None` means the request is not intercepted.
    ///
    /// First match wins. The data document is listed in the precache
    /// manifest but always routes as [`RequestCategory::DataDocument`].
    pub fn route(&self, request: &Request) -> Option<RequestCategory> {
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Not intercepting");
            return None;
        }

        let path = request.url.path();
        let config = &self.config;

        let is_data_document = ends_with_file(path, &config.data_document);

        let category = if !is_data_document
            && config.precache.iter().any(|p| ends_with_file(path, p))
        {
            RequestCategory::Precache
        } else if config.core_assets.iter().any(|name| ends_with_file(path, name)) {
            RequestCategory::CoreAsset
        } else if path.contains(config.image_segment.as_str()) {
            RequestCategory::Image
        } else if is_data_document {
            RequestCategory::DataDocument
        } else if request.is_navigation() || request.accepts_html() {
            RequestCategory::Navigation
        } else {
            RequestCategory::Default
        };

        trace!(url = %request.url, %category, "Routed request");
        Some(category)
    }

    /// Whether responses for `url` may be written to a cache bucket:
    /// http(s) and the same origin as the scope.
    pub fn is_cacheable_url(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https") && url.origin() == self.scope.origin()
    }
}

/// Whether `path` ends with the file `name` at a segment boundary.
fn ends_with_file(path: &str, name: &str) -> bool {
    let name = name.trim_start_matches('/');
    if name.is_empty() {
        return false;
    }
    path == name
        || path
            .strip_suffix(name)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn router() -> RequestRouter {
        RequestRouter::new(
            Arc::new(CacheConfig::default()),
            Url::parse("https://cafe.example/app/").unwrap(),
        )
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[test]
    fn test_non_get_is_not_intercepted() {
        let url = Url::parse("https://cafe.example/app/menu.json").unwrap();
        assert_eq!(router().route(&Request::post(url, Bytes::from_static(b"{}"))), None);
    }

    #[test]
    fn test_precache_entry_under_subpath() {
        assert_eq!(
            router().route(&get("https://cafe.example/app/manifest.json")),
            Some(RequestCategory::Precache)
        );
        assert_eq!(
            router().route(&get("https://cafe.example/manifest.json")),
            Some(RequestCategory::Precache)
        );
    }

    #[test]
    fn test_file_names_match_whole_segments() {
        assert_eq!(
            router().route(&get("https://cafe.example/app/mymanifest.json")),
            Some(RequestCategory::Default)
        );
        assert_eq!(
            router().route(&get("https://cafe.example/app/webapp.js")),
            Some(RequestCategory::Default)
        );
    }

    #[test]
    fn test_core_assets() {
        for url in [
            "https://cafe.example/app/style.css",
            "https://cafe.example/app/app.js",
            "https://cafe.example/app/index.html",
        ] {
            assert_eq!(router().route(&get(url)), Some(RequestCategory::CoreAsset), "{url}");
        }
    }

    #[test]
    fn test_core_asset_wins_over_navigation() {
        let url = Url::parse("https://cafe.example/app/index.html").unwrap();
        assert_eq!(
            router().route(&Request::navigate(url)),
            Some(RequestCategory::CoreAsset)
        );
    }

    #[test]
    fn test_images() {
        assert_eq!(
            router().route(&get("https://cafe.example/app/images/soup.jpg")),
            Some(RequestCategory::Image)
        );
        assert_eq!(
            router().route(&get("https://cafe.example/app/imagery/soup.jpg")),
            Some(RequestCategory::Default)
        );
    }

    #[test]
    fn test_data_document_beats_precache() {
        assert_eq!(
            router().route(&get("https://cafe.example/app/menu.json?fresh=1")),
            Some(RequestCategory::DataDocument)
        );
    }

    #[test]
    fn test_navigation_by_mode_or_accept_header() {
        let url = Url::parse("https://cafe.example/app/kitchen/").unwrap();
        assert_eq!(
            router().route(&Request::navigate(url.clone())),
            Some(RequestCategory::Navigation)
        );

        let by_header = Request::get(url).header(
            http::header::ACCEPT,
            http::HeaderValue::from_static("text/html"),
        );
        assert_eq!(router().route(&by_header), Some(RequestCategory::Navigation));
    }

    #[test]
    fn test_cacheable_url_requires_same_origin_http() {
        let router = router();
        assert!(router.is_cacheable_url(&Url::parse("https://cafe.example/x.png").unwrap()));
        assert!(!router.is_cacheable_url(&Url::parse("https://cdn.example/x.png").unwrap()));
        assert!(!router.is_cacheable_url(&Url::parse("http://cafe.example/x.png").unwrap()));
        assert!(!router.is_cacheable_url(&Url::parse("chrome-extension://abc/x.png").unwrap()));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(RequestCategory::DataDocument.to_string(), "data-document");
    }
}
