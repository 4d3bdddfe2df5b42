//! Content Cache CLI
//!
//! Drives the cache manager from the command line against the listing API.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use content_cache::{CacheConfig, CacheManager, HttpFetcher};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Fetch one listing page
    Listing { source_id: String, page: u32 },
    /// Load an image, prefetching the ones after it
    Image { url: String, next_urls: Vec<String> },
    /// Check whether an image is cached
    Lookup { url: String },
    /// Print blob store statistics
    Stats,
    /// Clear both cache tiers
    Clear,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Content Cache - tiered listing and image cache

USAGE:
    content-cache listing <source_id> [page]
    content-cache image <url> [next_url...]
    content-cache lookup <url>
    content-cache stats
    content-cache clear
    content-cache help

COMMANDS:
    listing  Fetch a listing page (default page 1) and print its items
    image    Load an image into the cache and print its local path;
             any further URLs are prefetched
    lookup   Print the local path of a cached image
    stats    Print blob store statistics as JSON
    clear    Delete every cached listing and image
    help     Show this help message

ENVIRONMENT:
    CONTENT_CACHE_DIR                Cache root directory
    CONTENT_CACHE_MAX_SIZE           Blob store size budget in bytes
    CONTENT_CACHE_MAX_AGE_SECS       Maximum idle age of a cached image
    CONTENT_CACHE_METADATA_CAPACITY  Listing pages kept in memory
    CONTENT_CACHE_PREFETCH_LIMIT     Images accepted per prefetch
    CONTENT_CACHE_API_URL            Listing API base URL
    RUST_LOG                         Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "listing" => {
            let source_id = args
                .get(2)
                .cloned()
                .ok_or_else(|| anyhow!("Usage: content-cache listing <source_id> [page]"))?;
            let page = match args.get(3) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("Invalid page number: {}", raw))?,
                None => 1,
            };
            Ok(Command::Listing { source_id, page })
        }
        "image" => {
            if args.len() < 3 {
                return Err(anyhow!("Usage: content-cache image <url> [next_url...]"));
            }
            Ok(Command::Image {
                url: args[2].clone(),
                next_urls: args[3..].to_vec(),
            })
        }
        "lookup" => {
            let url = args
                .get(2)
                .cloned()
                .ok_or_else(|| anyhow!("Usage: content-cache lookup <url>"))?;
            Ok(Command::Lookup { url })
        }
        "stats" => Ok(Command::Stats),
        "clear" => Ok(Command::Clear),
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = CacheConfig::from_env();
    let fetcher = HttpFetcher::from_config(&config).context("Failed to build HTTP client")?;
    let manager = CacheManager::open(config, Arc::new(fetcher))
        .await
        .context("Failed to open cache")?;

    match command {
        Command::Listing { source_id, page } => {
            let listing = match manager.fetch_data(&source_id, page).await {
                Ok(listing) => listing,
                Err(e) => {
                    error!(source = %source_id, page, error = %e, "Failed to fetch listing");
                    return Err(e.into());
                }
            };

            println!("{} page {} ({} items):", source_id, page, listing.len());
            for item in listing.iter() {
                println!("  [{}] {} -> {}", item.id, item.title, item.image);
            }
        }
        Command::Image { url, next_urls } => {
            let handle = match manager.get_cached_image(&url).await {
                Some(handle) => {
                    info!(url = %url, "Cache hit");
                    handle
                }
                None => manager
                    .cache_image(&url)
                    .await
                    .with_context(|| format!("Failed to cache {}", url))?,
            };
            println!("{} ({} bytes)", handle.path.display(), handle.size_bytes);

            if !next_urls.is_empty() {
                let report = manager.prefetch(next_urls).await?;
                println!(
                    "Prefetched {} of {} (already cached: {}, failed: {})",
                    report.fetched, report.requested, report.already_cached, report.failed
                );
            }
        }
        Command::Lookup { url } => match manager.get_cached_image(&url).await {
            Some(handle) => println!("{}", handle.path.display()),
            None => println!("not cached"),
        },
        Command::Stats => {
            let stats = manager.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Clear => {
            manager.clear_cache().await;
            println!("Cache cleared.");
        }
        Command::Help => print_help(),
    }

    Ok(())
}
