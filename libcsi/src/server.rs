//! gRPC server for a CSI plugin listening on a UNIX domain socket.
//!
//! Every call is tagged with a correlation id taken from a [`CallCounter`]
//! so that the request and outcome log lines of one call can be paired up.

use std::future::Future;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::service::Routes;
use tonic::transport::Server;
use tower::{Layer, Service};
use tracing::{debug, error, info};

const UNIX_SCHEME: &str = "unix://";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to parse endpoint {0:?}: expected a UNIX domain socket URL unix://<absolute path to socket>")]
    InvalidEndpoint(String),

    #[error("failed to remove existing UNIX domain socket {path:?}: {reason}")]
    StaleSocket { path: PathBuf, reason: String },

    #[error("listen failed on {path:?}: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("gRPC server error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// A UNIX domain socket the plugin serves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub path: PathBuf,
}

impl Endpoint {
    /// Accepts `unix:///abs/path.sock` or a bare absolute path.
    pub fn parse(endpoint: &str) -> Result<Self, ServerError> {
        let socket_path = endpoint.strip_prefix(UNIX_SCHEME).unwrap_or(endpoint);
        let path = Path::new(socket_path);
        if !path.is_absolute() {
            return Err(ServerError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

/// Delete a socket left behind by a previous instance of the plugin.
///
/// A missing path is fine. Anything at the path that is not a socket is
/// left untouched and reported as an error.
pub fn remove_stale_socket(path: &Path) -> Result<(), ServerError> {
    let stale = |reason: String| ServerError::StaleSocket {
        path: path.to_path_buf(),
        reason,
    };

    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(stale(e.to_string())),
    };

    if !meta.file_type().is_socket() {
        return Err(stale("not a UNIX domain socket".to_string()));
    }

    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(stale(e.to_string())),
    }
}

/// Source of gRPC call correlation ids.
#[derive(Debug, Default)]
pub struct CallCounter(AtomicU64);

impl CallCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Tower layer logging each gRPC call together with its outcome.
#[derive(Debug, Clone)]
pub struct CallLogLayer {
    counter: Arc<CallCounter>,
}

impl CallLogLayer {
    pub fn new(counter: Arc<CallCounter>) -> Self {
        Self { counter }
    }
}

impl<S> Layer<S> for CallLogLayer {
    type Service = CallLog<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CallLog {
            inner,
            counter: self.counter.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallLog<S> {
    inner: S,
    counter: Arc<CallCounter>,
}

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for CallLog<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let call_id = self.counter.next();
        let method = req.uri().path().to_string();
        debug!("Call-ID {call_id}: Call: {method}");

        // The clone may not be ready; keep the instance poll_ready was called on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let resp = inner.call(req).await?;
            // Failed unary calls are "trailers-only" responses, with the
            // status carried in the headers.
            match tonic::Status::from_header_map(resp.headers()) {
                Some(status) if status.code() != tonic::Code::Ok => {
                    error!(
                        "Call-ID {call_id}: Error: {method}: {:?}: {}",
                        status.code(),
                        status.message()
                    );
                }
                _ => debug!("Call-ID {call_id}: Response: {method}: OK"),
            }
            Ok(resp)
        })
    }
}

/// Serve `routes` on `endpoint` until `shutdown` resolves.
pub async fn serve<F>(
    endpoint: &Endpoint,
    routes: Routes,
    counter: Arc<CallCounter>,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send,
{
    remove_stale_socket(&endpoint.path)?;

    let listener = UnixListener::bind(&endpoint.path).map_err(|source| ServerError::Listen {
        path: endpoint.path.clone(),
        source,
    })?;
    info!("Listening for connections on {}", endpoint.path.display());

    Server::builder()
        .layer(CallLogLayer::new(counter))
        .add_routes(routes)
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;

    info!("Server on {} stopped", endpoint.path.display());
    Ok(())
}
