//! The request-facing cache: negotiation, lookup, validation, recompute and
//! store, in that order.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{CacheBackend, FileBackend, InMemoryBackend};
use super::clock::{Clock, SystemClock};
use super::config::{BackendSettings, CachePolicy, CacheSettings};
use super::error::CacheError;
use super::invalidate::InvalidationCoordinator;
use super::key::{ResourceIdentity, VariantKey};
use super::record::VariantRecord;
use super::stats::{CacheStats, StatsSnapshot};
use super::store::{Generation, PutOutcome, VariantStore};
use super::sweeper;
use super::validate::{self, Conditions, Outcome};
use crate::context::Context;
use crate::http::headers::names;
use crate::http::{Method, Request, Response, StatusCode};
use crate::negotiate::{Accept, MediaType};
use crate::router::{Handler, IntoHandler};

/// One media type a resource can produce, with its caching policy and the
/// handler that renders it.
#[derive(Clone)]
pub struct Representation {
    media_type: MediaType,
    policy: CachePolicy,
    handler: Handler,
}

impl Representation {
    pub fn new(media_type: MediaType, policy: CachePolicy, handler: impl IntoHandler) -> Self {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        Self::from_handler(media_type, policy, handler)
    }

    pub fn from_handler(media_type: MediaType, policy: CachePolicy, handler: Handler) -> Self {
        Self {
            media_type,
            policy,
            handler,
        }
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl fmt::Debug for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Representation")
            .field("media_type", &self.media_type)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Index of the representation `request` prefers, in declaration order
/// terms. `None` when nothing is acceptable.
pub fn negotiate(representations: &[Representation], request: &Request) -> Option<usize> {
    let producible: Vec<MediaType> = representations
        .iter()
        .map(|r| r.media_type.clone())
        .collect();
    Accept::parse(request.headers().get_all(names::ACCEPT)).preferred(&producible)
}

// The `Vary` value advertised for a resource: `Accept` when it has more than
// one representation, then the declared headers.
fn vary_header(representations: &[Representation], policy: &CachePolicy) -> Option<String> {
    let mut fields: Vec<&str> = Vec::new();
    if representations.len() > 1 {
        fields.push(names::ACCEPT);
    }
    fields.extend(policy.vary_headers().iter().map(String::as_str));
    (!fields.is_empty()).then(|| fields.join(", "))
}

fn respond(
    status: StatusCode,
    record: &VariantRecord,
    policy: &CachePolicy,
    vary: Option<&str>,
    max_age: Duration,
) -> Response {
    let mut response = Response::new(status);
    if status == StatusCode::Ok {
        for (name, value) in record.headers().iter() {
            response.add_header(name, value);
        }
        response.set_header(names::CONTENT_TYPE, record.media_type().to_string());
    }
    response.set_header(names::ETAG, record.etag().to_string());
    response.set_header(names::CACHE_CONTROL, policy.cache_control(max_age));
    if let Some(vary) = vary {
        response.set_header(names::VARY, vary);
    }
    if let Some(last_modified) = record.last_modified() {
        response.set_header(names::LAST_MODIFIED, httpdate::fmt_http_date(last_modified));
    }
    if status == StatusCode::Ok {
        response = response.body_bytes(record.body().clone());
    }
    response
}

/// Configures and builds a [`ResponseCache`].
#[must_use]
pub struct ResponseCacheBuilder {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    handler_timeout: Option<Duration>,
    sweep_interval: Option<Duration>,
    stale_retention: Duration,
}

impl ResponseCacheBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Enables the background sweeper. `None` disables it.
    pub fn sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.sweep_interval = interval.filter(|i| !i.is_zero());
        self
    }

    pub fn stale_retention(mut self, retention: Duration) -> Self {
        self.stale_retention = retention;
        self
    }

    /// Builds the cache. The sweeper, if enabled, needs a running Tokio
    /// runtime and is skipped with a warning without one.
    pub fn build(self) -> ResponseCache {
        let stats = Arc::new(CacheStats::default());
        let store = Arc::new(VariantStore::new(self.backend));
        let invalidator = InvalidationCoordinator::new(Arc::clone(&store), Arc::clone(&stats));

        let sweeper = match (self.sweep_interval, tokio::runtime::Handle::try_current()) {
            (Some(interval), Ok(_)) => Some(sweeper::spawn_sweeper(
                Arc::clone(&store),
                Arc::clone(&self.clock),
                Arc::clone(&stats),
                interval,
                self.stale_retention,
            )),
            (Some(_), Err(_)) => {
                warn!("no Tokio runtime available; cache sweeper disabled");
                None
            }
            (None, _) => None,
        };

        ResponseCache {
            inner: Arc::new(Inner {
                store,
                invalidator,
                clock: self.clock,
                stats,
                handler_timeout: self.handler_timeout,
                stale_retention: self.stale_retention,
                sweeper: Mutex::new(sweeper),
            }),
        }
    }
}

struct Inner {
    store: Arc<VariantStore>,
    invalidator: InvalidationCoordinator,
    clock: Arc<dyn Clock>,
    stats: Arc<CacheStats>,
    handler_timeout: Option<Duration>,
    stale_retention: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// A server-side response cache shared by every request of a process.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<Inner>,
}

impl ResponseCache {
    /// Starts configuring a cache over `backend`. Defaults: system clock,
    /// no handler timeout, no sweeper, 300 s stale retention.
    pub fn builder(backend: Arc<dyn CacheBackend>) -> ResponseCacheBuilder {
        let defaults = CacheSettings::default();
        ResponseCacheBuilder {
            backend,
            clock: Arc::new(SystemClock),
            handler_timeout: None,
            sweep_interval: None,
            stale_retention: defaults.stale_retention(),
        }
    }

    /// An in-memory cache with default settings and no sweeper.
    pub fn in_memory() -> Self {
        Self::builder(Arc::new(InMemoryBackend::new())).build()
    }

    /// Builds a cache from settings, opening the configured backend.
    pub async fn open(settings: &CacheSettings) -> Result<Self, CacheError> {
        settings.validate()?;
        let backend: Arc<dyn CacheBackend> = match &settings.backend {
            BackendSettings::Memory => Arc::new(InMemoryBackend::new()),
            BackendSettings::File { dir } => Arc::new(FileBackend::open(dir.clone()).await?),
        };
        info!(
            backend = backend.name(),
            sweep_interval_secs = settings.sweep_interval_secs,
            "response cache ready"
        );
        Ok(Self::builder(backend)
            .handler_timeout(settings.handler_timeout())
            .sweep_interval(settings.sweep_interval())
            .stale_retention(settings.stale_retention())
            .build())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn store(&self) -> &VariantStore {
        &self.inner.store
    }

    /// Answers a `GET` or `HEAD` for a resource produced by `representations`.
    ///
    /// # Errors
    ///
    /// - [`CacheError::NotAcceptable`] when no representation satisfies `Accept`.
    /// - [`CacheError::HandlerTimedOut`] when recompute exceeds the configured limit.
    ///
    /// Backend failures during lookup or store are logged and the request is
    /// answered uncached.
    pub async fn serve(
        &self,
        ctx: Context,
        representations: &[Representation],
    ) -> Result<Response, CacheError> {
        let request = ctx.request();
        let identity = ResourceIdentity::from_request(request);
        let head = *request.method() == Method::Head;

        let Some(index) = negotiate(representations, request) else {
            self.inner.stats.record_not_acceptable();
            debug!(identity = %identity, "no acceptable representation");
            return Err(CacheError::NotAcceptable { identity });
        };
        let representation = &representations[index];
        let policy = representation.policy();
        let vary = vary_header(representations, policy);
        let key = VariantKey::build(
            representation.media_type().clone(),
            policy.vary_headers(),
            request,
        );
        let conditions = Conditions::from_headers(request.headers());

        let generation = self.inner.store.generation(&identity);
        let record = match self.inner.store.lookup(&identity, &key).await {
            Ok(record) => record,
            Err(err) => {
                self.inner.stats.record_backend_error();
                warn!(identity = %identity, error = %err, "cache lookup failed; treating as miss");
                None
            }
        };

        let now = self.inner.clock.now();
        let outcome = validate::evaluate(record.as_ref(), &conditions, now);
        self.inner.stats.record_outcome(outcome);
        debug!(
            identity = %identity,
            media_type = %key.media_type(),
            outcome = %outcome,
            "cache lookup"
        );

        let response = match record {
            Some(record) if !outcome.needs_recompute() => {
                let status = if outcome == Outcome::ValidatorHit {
                    StatusCode::NotModified
                } else {
                    StatusCode::Ok
                };
                respond(status, &record, policy, vary.as_deref(), record.remaining(now))
            }
            _ => {
                self.recompute(
                    ctx,
                    &identity,
                    &key,
                    representation,
                    &conditions,
                    vary.as_deref(),
                    generation,
                )
                .await?
            }
        };

        Ok(if head { response.head_only() } else { response })
    }

    #[allow(clippy::too_many_arguments)]
    async fn recompute(
        &self,
        mut ctx: Context,
        identity: &ResourceIdentity,
        key: &VariantKey,
        representation: &Representation,
        conditions: &Conditions,
        vary: Option<&str>,
        generation: Generation,
    ) -> Result<Response, CacheError> {
        self.inner.stats.record_recompute();
        ctx.extensions_mut().insert(representation.media_type().clone());

        let pending = (representation.handler)(ctx);
        let response = match self.inner.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                warn!(identity = %identity, timeout = ?limit, "handler timed out");
                CacheError::HandlerTimedOut {
                    identity: identity.clone(),
                    after: limit,
                }
            })?,
            None => pending.await,
        };

        if response.status() != StatusCode::Ok {
            debug!(identity = %identity, status = %response.status(), "response not cacheable");
            return Ok(response);
        }

        let policy = representation.policy();
        let record = VariantRecord::from_response(
            response,
            representation.media_type(),
            policy.max_age(),
            self.inner.clock.now(),
        );
        match self
            .inner
            .store
            .put(identity, key, record.clone(), generation)
            .await
        {
            Ok(PutOutcome::Stored) => self.inner.stats.record_store(),
            Ok(PutOutcome::Superseded) => self.inner.stats.record_superseded(),
            Err(err) => {
                self.inner.stats.record_backend_error();
                warn!(identity = %identity, error = %err, "failed to store variant; served uncached");
            }
        }

        let status = if conditions.not_modified(record.etag(), record.last_modified()) {
            StatusCode::NotModified
        } else {
            StatusCode::Ok
        };
        Ok(respond(status, &record, policy, vary, policy.max_age()))
    }

    /// Removes every cached variant of `identity`.
    pub async fn invalidate(&self, identity: &ResourceIdentity) -> Result<usize, CacheError> {
        self.inner.invalidator.on_mutating_request(identity).await
    }

    /// Runs one sweep pass now, independent of the background sweeper.
    pub async fn sweep(&self) -> Result<usize, CacheError> {
        let removed = sweeper::sweep_once(
            &self.inner.store,
            self.inner.clock.as_ref(),
            self.inner.stale_retention,
            &self.inner.stats,
        )
        .await?;
        Ok(removed)
    }

    /// Stops the sweeper and flushes the backend.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        if let Some(handle) = self.inner.sweeper.lock().await.take() {
            handle.abort();
        }
        self.inner.store.flush().await?;
        info!(backend = self.inner.store.backend().name(), "response cache shut down");
        Ok(())
    }
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("backend", &self.inner.store.backend().name())
            .field("handler_timeout", &self.inner.handler_timeout)
            .field("stats", &self.inner.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::http::Headers;

    fn get(target: &str, headers: &[(&str, &str)]) -> Context {
        let headers: Headers = headers
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Context::new(Request::new(Method::Get, target, headers))
    }

    fn counting(media_type: MediaType, counter: Arc<AtomicUsize>) -> Representation {
        Representation::new(
            media_type,
            CachePolicy::new(Duration::from_secs(2)),
            move |_ctx: Context| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Response::new(StatusCode::Ok).body(format!("Hello World {n}"))
                }
            },
        )
    }

    fn cache(clock: Arc<ManualClock>) -> ResponseCache {
        ResponseCache::builder(Arc::new(InMemoryBackend::new()))
            .clock(clock)
            .build()
    }

    #[tokio::test]
    async fn miss_then_fresh_hit() {
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_000)));
        let cache = cache(clock.clone());
        let counter = Arc::new(AtomicUsize::new(0));
        let reps = [counting(MediaType::text_plain(), counter.clone())];

        let first = cache.serve(get("/cache", &[]), &reps).await.unwrap();
        assert_eq!(first.content().as_ref(), b"Hello World 1");
        assert_eq!(first.headers().get("cache-control"), Some("max-age=2"));
        assert_eq!(first.headers().get("content-type"), Some("text/plain"));
        assert!(first.headers().get("vary").is_none());

        clock.advance(Duration::from_secs(1));
        let second = cache.serve(get("/cache", &[]), &reps).await.unwrap();
        assert_eq!(second.content().as_ref(), b"Hello World 1");
        assert_eq!(second.headers().get("cache-control"), Some("max-age=1"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.no_variant_misses, 1);
        assert_eq!(stats.fresh_hits, 1);
        assert_eq!(stats.stores, 1);
    }

    #[tokio::test]
    async fn not_acceptable_is_an_error() {
        let cache = ResponseCache::in_memory();
        let counter = Arc::new(AtomicUsize::new(0));
        let reps = [counting(MediaType::text_plain(), counter.clone())];

        let err = cache
            .serve(get("/cache", &[("Accept", "application/json")]), &reps)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::NotAcceptable { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn negotiated_media_type_reaches_handler() {
        let cache = ResponseCache::in_memory();
        let rep = Representation::new(
            MediaType::text_html(),
            CachePolicy::new(Duration::from_secs(5)),
            |ctx: Context| async move {
                let seen = ctx
                    .media_type()
                    .map(MediaType::essence)
                    .unwrap_or_default();
                Response::new(StatusCode::Ok).body(seen)
            },
        );

        let response = cache.serve(get("/page", &[]), &[rep]).await.unwrap();
        assert_eq!(response.content().as_ref(), b"text/html");
    }

    #[tokio::test]
    async fn non_ok_responses_are_not_stored() {
        let cache = ResponseCache::in_memory();
        let rep = Representation::new(
            MediaType::text_plain(),
            CachePolicy::new(Duration::from_secs(5)),
            |_ctx: Context| async { Response::new(StatusCode::NotFound) },
        );

        let response = cache.serve(get("/missing", &[]), &[rep.clone()]).await.unwrap();
        assert_eq!(response.status(), StatusCode::NotFound);
        assert!(response.headers().get("etag").is_none());
        cache.serve(get("/missing", &[]), &[rep]).await.unwrap();
        assert_eq!(cache.stats().stores, 0);
        assert_eq!(cache.stats().no_variant_misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let cache = ResponseCache::builder(Arc::new(InMemoryBackend::new()))
            .handler_timeout(Some(Duration::from_millis(100)))
            .build();
        let rep = Representation::new(
            MediaType::text_plain(),
            CachePolicy::new(Duration::from_secs(5)),
            |_ctx: Context| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Response::new(StatusCode::Ok)
            },
        );

        let err = cache.serve(get("/slow", &[]), &[rep]).await.unwrap_err();
        assert!(matches!(err, CacheError::HandlerTimedOut { .. }));
        assert_eq!(err.status(), StatusCode::GatewayTimeout);
    }

    #[test]
    fn vary_header_lists_accept_for_multiple_representations() {
        let counter = Arc::new(AtomicUsize::new(0));
        let policy = CachePolicy::new(Duration::from_secs(1)).vary("X-Count");
        let reps = [
            counting(MediaType::text_plain(), counter.clone()),
            counting(MediaType::text_html(), counter),
        ];
        assert_eq!(vary_header(&reps, &policy).as_deref(), Some("Accept, x-count"));
        assert_eq!(vary_header(&reps[..1], &policy).as_deref(), Some("x-count"));
        assert_eq!(
            vary_header(&reps[..1], &CachePolicy::new(Duration::ZERO)),
            None
        );
    }
}
