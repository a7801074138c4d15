//! # respcache
//!
//! An async HTTP/1.1 server with a content-negotiated, validator-aware
//! response cache.
//!
//! Routes registered with [`Router::get_cached`] are served through a
//! [`ResponseCache`]: the `Accept` header picks a representation, stored
//! variants are keyed by media type, query and `Vary` headers, clients
//! revalidate with `ETag`/`If-None-Match` or `If-Modified-Since`, and any
//! `POST`/`PUT`/`PATCH`/`DELETE` to the same path drops every variant.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use respcache::{CachePolicy, MediaType, Response, ResponseCache, Router, Server, StatusCode};
//! use respcache::context::Context;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new().with_cache(ResponseCache::in_memory());
//!     router.get_cached(
//!         "/hello",
//!         MediaType::text_plain(),
//!         CachePolicy::new(Duration::from_secs(2)),
//!         |_ctx: Context| async { Response::new(StatusCode::Ok).body("Hello, World!") },
//!     );
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://{}", server.local_addr());
//!     server
//!         .serve(router, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod negotiate;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CachePolicy, ResponseCache};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use negotiate::MediaType;
pub use router::Router;
pub use server::{Server, ServerError};
