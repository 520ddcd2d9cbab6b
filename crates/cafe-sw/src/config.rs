//! Per-generation cache configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Configuration for one deployed generation of the offline cache.
///
/// Every field has a default, so a JSON document only needs to name what it
/// changes (usually just `generation`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Generation tag, fixed at deploy time.
    pub generation: String,

    /// Prefix of the precache (app shell) bucket name.
    pub shell_prefix: String,

    /// Prefix of the runtime bucket name.
    pub runtime_prefix: String,

    /// Scope-relative paths fetched into the precache bucket on install.
    pub precache: Vec<String>,

    /// File names always fetched network-first.
    pub core_assets: Vec<String>,

    /// Path segment identifying image requests.
    pub image_segment: String,

    /// File name of the stale-while-revalidate data document.
    pub data_document: String,

    /// Scope-relative key the latest navigation response is stored under.
    pub root_document: String,

    /// Activate right after install instead of waiting for old clients.
    pub skip_waiting_on_install: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            generation: "v5".to_string(),
            shell_prefix: "cafe-app-shell".to_string(),
            runtime_prefix: "cafe-runtime".to_string(),
            precache: vec!["menu.json".to_string(), "manifest.json".to_string()],
            core_assets: vec![
                "style.css".to_string(),
                "app.js".to_string(),
                "index.html".to_string(),
            ],
            image_segment: "/images/".to_string(),
            data_document: "menu.json".to_string(),
            root_document: "index.html".to_string(),
            skip_waiting_on_install: true,
        }
    }
}

impl CacheConfig {
    /// Default configuration for a given generation tag.
    pub fn with_generation(generation: impl Into<String>) -> Self {
        Self {
            generation: generation.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ServiceWorkerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON document from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ServiceWorkerError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ServiceWorkerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject configurations that would break bucket naming or routing.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.generation.trim().is_empty() {
            return Err(ServiceWorkerError::Config("generation tag is empty".into()));
        }
        if self.shell_prefix.is_empty() || self.runtime_prefix.is_empty() {
            return Err(ServiceWorkerError::Config("bucket prefix is empty".into()));
        }
        if self.shell_prefix == self.runtime_prefix {
            return Err(ServiceWorkerError::Config(format!(
                "precache and runtime buckets share the name {}",
                self.precache_bucket()
            )));
        }
        if self.data_document.is_empty() {
            return Err(ServiceWorkerError::Config("data document name is empty".into()));
        }
        Ok(())
    }

    /// Name of this generation's precache bucket.
    pub fn precache_bucket(&self) -> String {
        format!("{}-{}", self.shell_prefix, self.generation)
    }

    /// Name of this generation's runtime bucket.
    pub fn runtime_bucket(&self) -> String {
        format!("{}-{}", self.runtime_prefix, self.generation)
    }

    /// Whether `name` is one of this generation's two buckets.
    pub fn is_current_bucket(&self, name: &str) -> bool {
        name == self.precache_bucket() || name == self.runtime_bucket()
    }

    /// Resolve the precache manifest against the registration scope.
    pub fn precache_urls(&self, scope: &Url) -> Result<Vec<Url>, ServiceWorkerError> {
        self.precache
            .iter()
            .map(|path| resolve(scope, path))
            .collect()
    }

    /// Resolve the root document key against the registration scope.
    pub fn root_document_url(&self, scope: &Url) -> Result<Url, ServiceWorkerError> {
        resolve(scope, &self.root_document)
    }
}

fn resolve(scope: &Url, path: &str) -> Result<Url, ServiceWorkerError> {
    scope
        .join(path.trim_start_matches('/'))
        .map_err(|e| ServiceWorkerError::Config(format!("cannot resolve {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bucket_names() {
        let config = CacheConfig::default();
        assert_eq!(config.precache_bucket(), "cafe-app-shell-v5");
        assert_eq!(config.runtime_bucket(), "cafe-runtime-v5");
        assert!(config.is_current_bucket("cafe-runtime-v5"));
        assert!(!config.is_current_bucket("cafe-runtime-v4"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CacheConfig::from_json_str(r#"{ "generation": "v6" }"#).unwrap();
        assert_eq!(config.generation, "v6");
        assert_eq!(config.precache, vec!["menu.json", "manifest.json"]);
        assert!(config.skip_waiting_on_install);
    }

    #[test]
    fn test_validate_rejects_shared_bucket_names() {
        let json = r#"{ "shell_prefix": "cafe", "runtime_prefix": "cafe" }"#;
        assert!(matches!(
            CacheConfig::from_json_str(json),
            Err(ServiceWorkerError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_generation() {
        assert!(CacheConfig::with_generation("  ").validate().is_err());
    }

    #[test]
    fn test_precache_urls_follow_subpath_scope() {
        let scope = Url::parse("https://user.github.io/cafe/").unwrap();
        let urls = CacheConfig::default().precache_urls(&scope).unwrap();
        assert_eq!(urls[0].as_str(), "https://user.github.io/cafe/menu.json");
        assert_eq!(urls[1].as_str(), "https://user.github.io/cafe/manifest.json");
    }

    #[test]
    fn test_root_document_strips_leading_slash() {
        let scope = Url::parse("https://user.github.io/cafe/").unwrap();
        let config = CacheConfig {
            root_document: "/index.html".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.root_document_url(&scope).unwrap().as_str(),
            "https://user.github.io/cafe/index.html"
        );
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{ "generation": "v7", "skip_waiting_on_install": false }"#).unwrap();

        let config = CacheConfig::from_path(&path).unwrap();
        assert_eq!(config.precache_bucket(), "cafe-app-shell-v7");
        assert!(!config.skip_waiting_on_install);

        assert!(CacheConfig::from_path(dir.path().join("missing.json")).is_err());
    }
}
