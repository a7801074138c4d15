//! Server-side response cache.
//!
//! Each cacheable resource declares one or more [`Representation`]s: a media
//! type, a [`CachePolicy`] and the handler that renders it. For every `GET`
//! or `HEAD` the [`ResponseCache`]:
//!
//! 1. negotiates a representation from the `Accept` header;
//! 2. builds a [`VariantKey`] from the media type, canonical query and the
//!    policy's vary headers;
//! 3. looks up the stored [`VariantRecord`] and classifies it
//!    ([`Outcome`]) against the client's validators and the record's age;
//! 4. answers `304`, replays the record, or runs the handler and stores the
//!    fresh `200`.
//!
//! Mutating requests remove every variant of their resource through the
//! [`InvalidationCoordinator`]. Records live in a [`CacheBackend`]:
//! [`InMemoryBackend`] or the durable [`FileBackend`].
//!
//! ## Quick start
//!
//! ```rust
//! use std::time::Duration;
//! use respcache::cache::{CachePolicy, Representation, ResponseCache};
//! use respcache::context::Context;
//! use respcache::http::{Headers, Method, Request, Response, StatusCode};
//! use respcache::negotiate::MediaType;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = ResponseCache::in_memory();
//! let hello = Representation::new(
//!     MediaType::text_plain(),
//!     CachePolicy::new(Duration::from_secs(2)),
//!     |_ctx: Context| async { Response::new(StatusCode::Ok).body("Hello World") },
//! );
//!
//! let request = Request::new(Method::Get, "/hello", Headers::new());
//! let response = cache.serve(Context::new(request), &[hello]).await.unwrap();
//! assert_eq!(response.status(), StatusCode::Ok);
//! assert!(response.headers().contains("etag"));
//! # }
//! ```

mod backend;
mod clock;
mod config;
mod error;
mod etag;
mod invalidate;
mod key;
mod orchestrator;
mod record;
mod stats;
mod store;
mod sweeper;
mod validate;

pub use backend::{BackendFuture, CacheBackend, FileBackend, InMemoryBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendSettings, CachePolicy, CacheSettings, ConfigError};
pub use error::{BackendError, CacheError};
pub use etag::{EntityTag, IfNoneMatch};
pub use invalidate::InvalidationCoordinator;
pub use key::{ResourceIdentity, VariantKey, VaryVector};
pub use orchestrator::{Representation, ResponseCache, ResponseCacheBuilder, negotiate};
pub use record::VariantRecord;
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{Generation, PutOutcome, VariantStore};
pub use validate::{Conditions, Outcome, evaluate};
