//! Harness for the cafe offline cache.
//!
//! Provides commands for:
//! - Showing how a URL would be routed
//! - Installing a generation against a live origin and fetching through it
//!
//! ## Usage
//!
//! ```bash
//! # Which policy handles the menu document?
//! cafe-warm classify https://cafe.example/menu.json
//!
//! # Install v6 and warm the runtime bucket
//! cafe-warm warm --scope https://cafe.example/ --config cache.json images/soup.jpg style.css
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cafe_common::{init_logging, CafeError, LogConfig, LogFormat, Result, ResultExt};
use cafe_net::{Fetcher, LoaderConfig, Request, ResourceLoader, Url};
use cafe_sw::{CacheConfig, CacheStorage, OfflineCacheManager, RequestCategory, RequestRouter};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cafe-warm")]
#[command(about = "Drive the cafe offline cache against a live origin")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Emit JSON logs
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the caching policy for a URL
    Classify {
        /// Absolute URL to classify
        url: String,
        /// Registration scope
        #[arg(long, default_value = "https://localhost/")]
        scope: String,
        /// Generation config (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Treat as a document navigation
        #[arg(long)]
        navigate: bool,
    },

    /// Install a generation and fetch paths through it
    Warm {
        /// Registration scope on the live origin
        #[arg(long)]
        scope: String,
        /// Generation config (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Scope-relative paths to fetch after activation
        paths: Vec<String>,
        /// Write the JSON report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(category = e.category(), "{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_logging(LogConfig::from_level_name(&cli.log_level)?.with_format(format))?;

    match cli.command {
        Commands::Classify {
            url,
            scope,
            config,
            navigate,
        } => {
            let config = load_config(config.as_deref())?;
            match classify(&scope, &url, config, navigate)? {
                Some(category) => println!("{category}"),
                None => println!("passthrough"),
            }
        }

        Commands::Warm {
            scope,
            config,
            paths,
            output,
        } => {
            let config = load_config(config.as_deref())?;
            let loader = ResourceLoader::new(LoaderConfig::default())
                .map_err(|e| CafeError::network_with_source("cannot build HTTP client", e))?;
            let report = warm(&scope, config, Arc::new(loader), &paths).await?;

            let json = serde_json::to_string_pretty(&report).context("serializing report")?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Report written to: {}", path.display());
                }
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CacheConfig> {
    match path {
        Some(path) => CacheConfig::from_path(path)
            .map_err(|e| CafeError::config_with_source(format!("loading {}", path.display()), e)),
        None => Ok(CacheConfig::default()),
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| CafeError::InvalidArgument(format!("{raw}: {e}")))
}

fn classify(
    scope: &str,
    url: &str,
    config: CacheConfig,
    navigate: bool,
) -> Result<Option<RequestCategory>> {
    let router = RequestRouter::new(Arc::new(config), parse_url(scope)?);
    let url = parse_url(url)?;
    let request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };
    Ok(router.route(&request))
}

/// Outcome of a warm run.
#[derive(Debug, Serialize)]
struct WarmReport {
    scope: String,
    generation: String,
    fetches: Vec<FetchReport>,
    buckets: Vec<BucketReport>,
}

#[derive(Debug, Serialize)]
struct FetchReport {
    path: String,
    category: Option<RequestCategory>,
    status: Option<u16>,
    from_cache: bool,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct BucketReport {
    name: String,
    entries: usize,
    bytes: usize,
}

async fn warm(
    scope: &str,
    config: CacheConfig,
    fetcher: Arc<dyn Fetcher>,
    paths: &[String],
) -> Result<WarmReport> {
    let scope = parse_url(scope)?;
    let generation = config.generation.clone();

    let (manager, _events) = OfflineCacheManager::new(scope, fetcher, CacheStorage::new().shared())
        .map_err(|e| CafeError::lifecycle_with_source("registration failed", e))?;
    let router = RequestRouter::new(Arc::new(config.clone()), manager.scope().clone());
    manager
        .install(config)
        .await
        .map_err(|e| CafeError::lifecycle_with_source(format!("install of {generation} failed"), e))?;
    info!(%generation, "Generation active");

    let mut fetches = Vec::with_capacity(paths.len());
    for path in paths {
        let url = manager
            .scope()
            .join(path.trim_start_matches('/'))
            .map_err(|e| CafeError::InvalidArgument(format!("{path}: {e}")))?;
        let request = Request::get(url);
        let category = router.route(&request);

        let report = match manager.handle_fetch(request).await {
            Ok(Some(response)) => FetchReport {
                path: path.clone(),
                category,
                status: Some(response.status.as_u16()),
                from_cache: response.from_cache,
                error: None,
            },
            Ok(None) => FetchReport {
                path: path.clone(),
                category,
                status: None,
                from_cache: false,
                error: Some("not intercepted".to_string()),
            },
            Err(e) => FetchReport {
                path: path.clone(),
                category,
                status: None,
                from_cache: false,
                error: Some(e.to_string()),
            },
        };
        fetches.push(report);
    }
    manager.wait_background().await;

    let caches = manager.caches();
    let storage = caches.read().await;
    let buckets = storage
        .keys()
        .into_iter()
        .filter_map(|name| storage.get(name))
        .map(|bucket| BucketReport {
            name: bucket.name.clone(),
            entries: bucket.len(),
            bytes: bucket.size_bytes(),
        })
        .collect();

    Ok(WarmReport {
        scope: manager.scope().to_string(),
        generation,
        fetches,
        buckets,
    })
}
