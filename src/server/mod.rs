//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a [`Router`].
//! Supports HTTP/1.1 persistent connections (keep-alive) and stops accepting
//! when the shutdown future resolves, then shuts the router's cache down.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::cache::CacheError;
use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::router::Router;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cache shutdown failed: {0}")]
    Cache(#[from] CacheError),
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use respcache::{Router, Server, Response, StatusCode};
/// use respcache::cache::{CachePolicy, ResponseCache};
/// use respcache::context::Context;
/// use respcache::negotiate::MediaType;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new().with_cache(ResponseCache::in_memory());
///     router.get_cached(
///         "/hello",
///         MediaType::text_plain(),
///         CachePolicy::new(Duration::from_secs(2)),
///         |_ctx: Context| async { Response::new(StatusCode::Ok).body("Hello!") },
///     );
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server
///         .serve(router, async {
///             let _ = tokio::signal::ctrl_c().await;
///         })
///         .await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections and dispatches requests to `router` until
    /// `shutdown` resolves.
    ///
    /// Connections already accepted keep running on their own tasks; the
    /// router's cache is shut down once the accept loop exits.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Cache`] if the cache fails to shut down.
    pub async fn serve<S>(self, router: Router, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let router = Arc::new(router);
        info!(address = %self.local_addr, "listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            debug!(peer = %peer_addr, "connection accepted");
            let router = Arc::clone(&router);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, router).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }

        info!(address = %self.local_addr, "shutting down");
        router.shutdown().await?;
        Ok(())
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<Router>,
) -> Result<(), std::io::Error> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Bytes left over from a pipelined request may already hold a full request.
        let (request, consumed) = match next_request(&buf) {
            Parsed::Request(request, consumed) => (request, consumed),
            Parsed::TooLarge => {
                warn!(peer = %peer_addr, "request too large, sending 413");
                stream.write_all(&payload_too_large().into_bytes()).await?;
                break;
            }
            Parsed::NeedMore => {
                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request too large, sending 413");
                    stream.write_all(&payload_too_large().into_bytes()).await?;
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Parsed::Invalid(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = router.route(request).await.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(consumed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

fn payload_too_large() -> Response {
    Response::new(StatusCode::PayloadTooLarge)
        .body("Request entity too large")
        .keep_alive(false)
}

enum Parsed {
    Request(Request, usize),
    NeedMore,
    TooLarge,
    Invalid(RequestError),
}

// Parses one request (head plus `Content-Length` body) from the front of `buf`.
fn next_request(buf: &[u8]) -> Parsed {
    if buf.is_empty() {
        return Parsed::NeedMore;
    }
    match Request::parse(buf) {
        Ok((request, body_offset)) => {
            let total = body_offset.checked_add(request.content_length().unwrap_or(0));
            match total {
                Some(total) if total > MAX_REQUEST_SIZE => Parsed::TooLarge,
                Some(total) if buf.len() < total => Parsed::NeedMore,
                Some(total) => Parsed::Request(request, total),
                None => Parsed::TooLarge,
            }
        }
        Err(RequestError::Incomplete) => Parsed::NeedMore,
        Err(RequestError::BodyTooLarge(_)) => Parsed::TooLarge,
        Err(e) => Parsed::Invalid(e),
    }
}
