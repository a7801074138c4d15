//! Request routing: map URL patterns and HTTP methods to handlers, optionally
//! through the response cache.
//!
//! Three pattern styles are supported:
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/users`             | `/users`                   | *(none)*                        |
//! | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `/files/*`           | `/files/docs/readme.txt`   | `wildcard → "/docs/readme.txt"` |
//!
//! Trailing slashes are normalized on both patterns and incoming paths.
//! Routes are matched in registration order; the first route whose method
//! and pattern both match wins.
//!
//! Routes registered with [`Router::get_cached`] go through the
//! [`ResponseCache`] attached with [`Router::with_cache`]. Registering the
//! same path again with another media type adds a representation to the
//! same route, negotiated through `Accept`. `HEAD` is answered by `GET`
//! routes with the content omitted. Any mutating request whose path matches
//! a cached route invalidates that resource before and after its handler
//! runs; when the first invalidation fails the handler is not run and the
//! client gets `503`.

use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{
    CacheError, CachePolicy, Representation, ResourceIdentity, ResponseCache, negotiate,
};
use crate::context::{Context, Parameters};
use crate::http::headers::names;
use crate::negotiate::MediaType;
use crate::{Method, Request, Response, StatusCode};

/// Type-erased async handler processing a [`Context`] into a [`Response`].
///
/// Stored behind `Arc<dyn Fn(…)>` so routes and cached representations can
/// share it across tasks. Build one through [`Router::get`] and friends, or
/// [`Representation::new`].
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

// A single path segment, either a literal string or a named capture (`:name`).
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Static(String),
    Parameter(String),
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone, PartialEq)]
enum Pattern {
    // Matches one exact path string, e.g. `/users`.
    Exact(String),
    // Matches a fixed number of segments where some may be named captures, e.g. `/users/:id`.
    Parameterized { segments: Vec<Segment> },
    // Matches any path that starts with the given prefix, e.g. `/files/*`.
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

impl Pattern {
    /// Parse a route pattern string.
    ///
    /// 1. Ends with `/*` → [`Pattern::Wildcard`].
    /// 2. Contains `:` → [`Pattern::Parameterized`].
    /// 3. Otherwise → [`Pattern::Exact`].
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_string());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(p) => Segment::Parameter(p.to_string()),
                    None => Segment::Static(s.to_string()),
                })
                .collect();

            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_string())
    }

    // Try to match `path`, returning the extracted parameters on success.
    fn matches(&self, path: &str) -> Option<Parameters> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(Parameters::new),
            Pattern::Parameterized { segments } => {
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.len() != path_segments.len() {
                    return None;
                }

                let mut params = Parameters::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => {
                            params.insert(name.clone(), path_seg.to_string());
                        }
                    }
                }
                Some(params)
            }
            Pattern::Wildcard(prefix) => path.strip_prefix(prefix.as_str()).map(|suffix| {
                let mut params = Parameters::new();
                params.insert("wildcard".to_string(), suffix.to_string());
                params
            }),
        }
    }
}

// What a route dispatches to.
enum Endpoint {
    Handler(Handler),
    // Representations of one resource, in declaration order.
    Cached(Vec<Representation>),
}

struct Route {
    method: Method,
    pattern: Pattern,
    endpoint: Endpoint,
}

impl Route {
    fn matches(&self, method: &Method, path: &str) -> Option<Parameters> {
        if &self.method == method {
            self.pattern.matches(path)
        } else {
            None
        }
    }

    fn is_cached(&self) -> bool {
        matches!(self.endpoint, Endpoint::Cached(_))
    }
}

/// HTTP request router.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use respcache::{Router, Response, StatusCode};
/// use respcache::cache::{CachePolicy, ResponseCache};
/// use respcache::context::Context;
/// use respcache::negotiate::MediaType;
///
/// let mut router = Router::new().with_cache(ResponseCache::in_memory());
///
/// router.get("/ping", |_ctx: Context| async { Response::new(StatusCode::Ok) });
/// router.get_cached(
///     "/greeting",
///     MediaType::text_plain(),
///     CachePolicy::new(Duration::from_secs(30)),
///     |_ctx: Context| async { Response::new(StatusCode::Ok).body("hello") },
/// );
/// router.get_cached(
///     "/greeting",
///     MediaType::text_html(),
///     CachePolicy::new(Duration::from_secs(30)),
///     |_ctx: Context| async { Response::new(StatusCode::Ok).body("<p>hello</p>") },
/// );
/// assert_eq!(router.len(), 2);
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    cache: Option<ResponseCache>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the cache used by routes registered with
    /// [`get_cached`](Self::get_cached).
    #[must_use]
    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    /// Register a handler for `GET` (and `HEAD`) requests matching `path`.
    ///
    /// ```rust
    /// use respcache::{Router, Response, StatusCode};
    /// use respcache::context::Context;
    ///
    /// let mut router = Router::new();
    /// router.get("/hello", |_ctx: Context| async { Response::new(StatusCode::Ok) });
    /// ```
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, handler);
    }

    pub fn put(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Put, path, handler);
    }

    pub fn delete(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Delete, path, handler);
    }

    pub fn options(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Options, path, handler);
    }

    pub fn patch(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Patch, path, handler);
    }

    /// Register a cached `GET` representation of `path` producing
    /// `media_type`.
    ///
    /// Calling this again for the same path with another media type adds a
    /// representation; the first declared one wins when a client accepts
    /// several equally. A second registration of the same media type is
    /// ignored, as is a cached registration for a path that already has a
    /// plain `GET` route.
    pub fn get_cached(
        &mut self,
        path: &str,
        media_type: MediaType,
        policy: CachePolicy,
        handler: impl IntoHandler,
    ) {
        let representation = Representation::new(media_type, policy, handler);
        let pattern = Pattern::parse(path);

        let existing = self
            .routes
            .iter_mut()
            .find(|route| route.method == Method::Get && route.pattern == pattern);
        match existing.map(|route| &mut route.endpoint) {
            Some(Endpoint::Cached(representations)) => {
                if representations
                    .iter()
                    .any(|r| r.media_type() == representation.media_type())
                {
                    warn!(
                        path,
                        media_type = %representation.media_type(),
                        "duplicate cached representation ignored"
                    );
                } else {
                    representations.push(representation);
                }
                return;
            }
            Some(Endpoint::Handler(_)) => {
                warn!(
                    path,
                    media_type = %representation.media_type(),
                    "path already has an uncached GET route; cached representation ignored"
                );
                return;
            }
            None => {}
        }

        self.routes.push(Route {
            method: Method::Get,
            pattern,
            endpoint: Endpoint::Cached(vec![representation]),
        });
    }

    // Erase the concrete handler type and store it as a `Handler` trait object.
    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            endpoint: Endpoint::Handler(handler),
        });
    }

    /// Number of registered routes. Representations added to an existing
    /// cached route do not count.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    // Whether `path` addresses a resource with cached representations.
    fn is_cached_path(&self, path: &str) -> bool {
        self.routes
            .iter()
            .any(|route| route.is_cached() && route.pattern.matches(path).is_some())
    }

    /// Dispatch `request` to the first matching route.
    ///
    /// Returns `404 Not Found` when nothing matches. Cache errors are mapped
    /// to their status (`406`, `503`, `504`).
    pub async fn route(&self, request: Request) -> Response {
        let method = request.method().clone();
        let head = method == Method::Head;
        let dispatch = if head { Method::Get } else { method.clone() };

        let invalidation = match &self.cache {
            Some(cache) if method.is_mutating() && self.is_cached_path(request.path()) => {
                Some((cache, ResourceIdentity::from_request(&request)))
            }
            _ => None,
        };
        if let Some((cache, identity)) = &invalidation
            && let Err(err) = cache.invalidate(identity).await
        {
            return err.into_response();
        }

        let matched = self.routes.iter().find_map(|route| {
            route
                .matches(&dispatch, request.path())
                .map(|params| (route, params))
        });
        let Some((route, params)) = matched else {
            debug!(method = %method, path = request.path(), "no route matched");
            return Response::new(StatusCode::NotFound);
        };

        let ctx = Context::with_params(request, params);
        let response = match &route.endpoint {
            Endpoint::Handler(handler) => handler(ctx).await,
            Endpoint::Cached(representations) => match &self.cache {
                Some(cache) => cache
                    .serve(ctx, representations)
                    .await
                    .unwrap_or_else(CacheError::into_response),
                None => serve_uncached(ctx, representations).await,
            },
        };

        // Drop anything a concurrent GET cached while the mutation ran.
        if let Some((cache, identity)) = &invalidation
            && let Err(err) = cache.invalidate(identity).await
        {
            warn!(identity = %identity, error = %err, "post-mutation invalidation failed");
        }

        if head { response.head_only() } else { response }
    }

    /// Shuts down the attached cache, if any.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        match &self.cache {
            Some(cache) => cache.shutdown().await,
            None => Ok(()),
        }
    }
}

// Negotiates and runs a cached route's handler when no cache is attached.
async fn serve_uncached(mut ctx: Context, representations: &[Representation]) -> Response {
    let Some(index) = negotiate(representations, ctx.request()) else {
        return Response::new(StatusCode::NotAcceptable)
            .body(StatusCode::NotAcceptable.canonical_reason());
    };
    let representation = &representations[index];
    ctx.extensions_mut().insert(representation.media_type().clone());

    let mut response = (representation.handler())(ctx).await;
    if !response.headers().contains(names::CONTENT_TYPE) {
        response.set_header(names::CONTENT_TYPE, representation.media_type().to_string());
    }
    response
}
