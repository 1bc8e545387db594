//! The HTTP server, handler and routes.
//!
//! This file itself contains fairly little business logic and just sets up the
//! `hyper` server and catches errors. The main logic is in `handlers.rs`.

use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
    service::TowerToHyperService,
};
use std::{
    convert::Infallible,
    fs,
    future::Future,
    net::IpAddr,
    os::unix::fs::PermissionsExt,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::Arc,
};
use tokio::net::{TcpListener, UnixListener};
use tower::ServiceBuilder;

use crate::{api, prelude::*};
use self::{cors::CorsConfig, handlers::handle};


mod cors;
mod handlers;
mod log;
mod response;


/// HTTP server configuration.
#[derive(Debug, Clone, confique::Config)]
pub(crate) struct HttpConfig {
    /// The TCP port the HTTP server should listen on.
    #[config(default = 8080)]
    pub(crate) port: u16,

    /// The bind address to listen on.
    #[config(default = "127.0.0.1")]
    pub(crate) address: IpAddr,

    /// Unix domain socket to listen on. Specifying this will overwrite
    /// the TCP configuration. Example: "/tmp/notes-api.socket".
    pub(crate) unix_socket: Option<PathBuf>,

    /// Unix domain socket file permissions.
    #[config(default = 0o755)]
    pub(crate) unix_socket_permissions: u32,

    #[config(nested)]
    pub(crate) cors: CorsConfig,
}

impl HttpConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        cors::layer(self.cors.allowed_origins.as_deref().unwrap_or_default())?;
        Ok(())
    }
}


// Requests come with hyper's streaming body, responses are always fully
// buffered.
type Response<T = http_body_util::Full<bytes::Bytes>> = hyper::Response<T>;
type Request<T = hyper::body::Incoming> = hyper::Request<T>;


/// Context that the request handler has access to.
struct Context {
    api_root: api::RootNode,
    services: Arc<api::Services>,
}


/// Starts the HTTP server and runs it until the process receives Ctrl+C.
pub(crate) async fn serve(
    config: &HttpConfig,
    api_root: api::RootNode,
    services: Arc<api::Services>,
) -> Result<()> {
    let ctx = Arc::new(Context { api_root, services });
    let cors = cors::layer(config.cors.allowed_origins.as_deref().unwrap_or_default())?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // Accepts connections on the given listener and spawns a task serving
    // each. This is a macro as unix and TCP listeners share no trait for
    // `accept`.
    macro_rules! accept_loop {
        ($listener:expr) => {
            loop {
                let stream = tokio::select! {
                    res = $listener.accept() => match res {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    },
                    _ = &mut shutdown => {
                        info!("Received Ctrl+C, shutting down HTTP server");
                        break;
                    }
                };

                let ctx = Arc::clone(&ctx);
                let service = ServiceBuilder::new()
                    .layer(cors.clone())
                    .service_fn(move |req: Request| {
                        handle_internal_errors(handle(req, Arc::clone(&ctx)))
                    });
                tokio::spawn(async move {
                    let res = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service))
                        .await;
                    if let Err(e) = res {
                        debug!("Error while serving HTTP connection: {e}");
                    }
                });
            }
        };
    }

    if let Some(unix_socket) = &config.unix_socket {
        // Bind to Unix domain socket.
        if unix_socket.exists() {
            fs::remove_file(unix_socket)?;
        }
        let listener = UnixListener::bind(unix_socket)
            .with_context(|| format!("failed to bind to '{}'", unix_socket.display()))?;
        info!("Listening on unix://{}", unix_socket.display());
        let permissions = fs::Permissions::from_mode(config.unix_socket_permissions);
        fs::set_permissions(unix_socket, permissions)?;
        accept_loop!(listener);
    } else {
        // Bind to TCP socket.
        let listener = TcpListener::bind((config.address, config.port))
            .await
            .with_context(|| format!("failed to bind to {}:{}", config.address, config.port))?;
        info!("Listening on http://{}", listener.local_addr()?);
        accept_loop!(listener);
    }

    Ok(())
}

/// This just wraps another future and catches all panics that might occur when
/// resolving/polling that given future. This ensures that we always answer with
/// `500` instead of just crashing the thread and closing the connection.
async fn handle_internal_errors(
    future: impl Future<Output = Response>,
) -> Result<Response, Infallible> {
    // Hyper catches panics for us anyway, so this changes nothing except that
    // our response is better.
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(response) => Ok(response),
        Err(panic) => {
            // The `panic` information is just an `Any` object representing the
            // value the panic was invoked with. For most panics (which use
            // `panic!` like `println!`), this is either `&str` or `String`.
            let msg = panic.downcast_ref::<String>()
                .map(|s| s.as_str())
                .or(panic.downcast_ref::<&str>().copied());

            match msg {
                Some(msg) => error!("INTERNAL SERVER ERROR: HTTP handler panicked: '{msg}'"),
                None => error!("INTERNAL SERVER ERROR: HTTP handler panicked"),
            }

            Ok(response::internal_server_error())
        }
    }
}
