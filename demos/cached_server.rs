//! A small server with one cached resource in two media types.
//!
//! ```text
//! cargo run --example cached_server [settings.json]
//!
//! curl -i localhost:8080/cache
//! curl -i -H 'Accept: text/html' localhost:8080/cache
//! curl -i -H 'If-None-Match: "<etag>"' localhost:8080/cache
//! curl -i -X PUT localhost:8080/cache
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use respcache::cache::CacheSettings;
use respcache::context::Context;
use respcache::{CachePolicy, MediaType, Response, ResponseCache, Router, Server, StatusCode};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().compact())
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => CacheSettings::load(path).await?,
        None => CacheSettings::default(),
    };
    let cache = ResponseCache::open(&settings).await?;

    let counter = Arc::new(AtomicUsize::new(0));
    let policy = CachePolicy::new(Duration::from_secs(2)).vary("X-Count");

    let mut router = Router::new().with_cache(cache);
    let plain = Arc::clone(&counter);
    router.get_cached("/cache", MediaType::text_plain(), policy.clone(), move |_ctx: Context| {
        let n = plain.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Response::new(StatusCode::Ok).body(format!("hello world{n}")) }
    });
    let html = Arc::clone(&counter);
    router.get_cached("/cache", MediaType::text_html(), policy, move |ctx: Context| {
        let n = html.fetch_add(1, Ordering::SeqCst) + 1;
        let chosen = ctx.media_type().map(ToString::to_string).unwrap_or_default();
        async move {
            Response::new(StatusCode::Ok).body(format!("<p>hello world{n}</p><!-- {chosen} -->"))
        }
    });
    router.put("/cache", |_ctx: Context| async {
        Response::new(StatusCode::NoContent)
    });

    let server = Server::bind("127.0.0.1:8080").await?;
    info!(address = %server.local_addr(), "try GET and PUT on /cache");
    server
        .serve(router, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
