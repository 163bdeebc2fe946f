//! The server fixture: listener lifecycle and the hyper seam.
//!
//! `start` binds the port and accepts connections until `stop`, which ends
//! every timer and subscription, stops accepting, and drains in-flight
//! connections. A fixture stops when the test says so; it does not watch
//! process signals.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

use crate::capture::CapturedRequest;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::handler::Handler;
use crate::method::Method;

const DEFAULT_WORKERS: usize = 10;

/// The HTTP server fixture.
///
/// ```rust,no_run
/// use stunt::{Method, Server};
///
/// #[tokio::main]
/// async fn main() {
///     let server = Server::new(0);
///     server.start().await.unwrap();
///
///     server.handle(Method::Get, "/name/:name")
///         .with(200, "text/plain", "Hello :name");
///
///     // ... point the program under test at server.url("/") ...
///
///     server.stop().await;
/// }
/// ```
pub struct Server {
    port: u16,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<Option<Running>>,
}

struct Running {
    addr: SocketAddr,
    shutdown: watch::Sender<()>,
    acceptor: JoinHandle<()>,
}

impl Server {
    /// A fixture that will bind `port` on localhost. Port 0 picks a free
    /// ephemeral port; read it back with [`addr`](Self::addr) after `start`.
    pub fn new(port: u16) -> Self {
        Self::with_workers(port, DEFAULT_WORKERS)
    }

    /// Like [`new`](Self::new), with an explicit async worker-pool size
    /// bounding concurrent delayed/streamed body writes.
    pub fn with_workers(port: u16, workers: usize) -> Self {
        Self {
            port,
            dispatcher: Arc::new(Dispatcher::new(workers)),
            state: Mutex::new(None),
        }
    }

    /// Binds the listener and starts serving.
    pub async fn start(&self) -> Result<(), Error> {
        if self.state().is_some() {
            return Err(Error::AlreadyStarted);
        }
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.port)).await?;
        let addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(());
        let dispatcher = Arc::clone(&self.dispatcher);
        let acceptor = tokio::spawn(accept_loop(listener, dispatcher, shutdown_rx));

        info!(%addr, "stunt fixture listening");
        *self.state() = Some(Running { addr, shutdown, acceptor });
        Ok(())
    }

    /// Stops the fixture: cancels subscriptions and timers, closes the
    /// listener, and drains in-flight connections. A no-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.state().take() else {
            return;
        };
        // Ending timers and subscriptions first closes held-open response
        // streams, so draining cannot wait on them.
        self.dispatcher.shutdown();
        let _ = running.shutdown.send(());
        let _ = running.acceptor.await;
        info!("stunt fixture stopped");
    }

    /// The bound address.
    ///
    /// # Panics
    ///
    /// Panics if the fixture is not running.
    pub fn addr(&self) -> SocketAddr {
        self.state()
            .as_ref()
            .map(|running| running.addr)
            .expect("fixture is not running; call start() first")
    }

    /// Absolute URL for `path` on the running fixture.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr())
    }

    /// Scripts the response for `method` requests to `resource`.
    pub fn handle(&self, method: Method, resource: &str) -> Handler {
        self.dispatcher.add_handler(method, resource, None)
    }

    /// Scripts the response for `method` requests to `resource` carrying
    /// exactly `content_type`. Distinct content-types are distinct handlers,
    /// and a typed handler never serves an untyped request.
    pub fn handle_content_type(
        &self,
        method: Method,
        resource: &str,
        content_type: &str,
    ) -> Handler {
        self.dispatcher.add_handler(method, resource, Some(content_type.to_owned()))
    }

    /// Snapshot of every captured request, oldest first.
    pub fn captured_requests(&self) -> Vec<CapturedRequest> {
        self.dispatcher.captured_requests()
    }

    /// Removes and returns the oldest captured request.
    pub fn request(&self) -> Option<CapturedRequest> {
        self.dispatcher.next_captured_request()
    }

    /// Bounds the capture ring: once over `limit`, oldest entries are
    /// evicted. Unbounded until called.
    pub fn set_max_captured_requests(&self, limit: usize) {
        self.dispatcher.set_max_captured_requests(limit);
    }

    // The lock only guards the Running handle; a poisoned guard is taken
    // rather than propagating a panic from an unrelated thread.
    fn state(&self) -> MutexGuard<'_, Option<Running>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<()>,
) {
    // Every connection task is tracked so stop() can drain them all.
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            // Check shutdown first so stop() immediately halts accepting,
            // even with connections queued.
            biased;

            _ = shutdown.changed() => {
                info!(in_flight = connections.len(), "draining connections");
                break;
            }

            res = listener.accept() => {
                let (stream, remote) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                let dispatcher = Arc::clone(&dispatcher);
                let mut shutdown = shutdown.clone();
                let io = TokioIo::new(stream);

                connections.spawn(async move {
                    let svc = service_fn(move |req| {
                        let dispatcher = Arc::clone(&dispatcher);
                        async move { Ok::<_, Infallible>(dispatcher.dispatch(req).await) }
                    });

                    let conn = http1::Builder::new().serve_connection(io, svc);
                    tokio::pin!(conn);
                    tokio::select! {
                        res = conn.as_mut() => {
                            if let Err(e) = res {
                                // Routine for a fixture: clients hang up on
                                // open streams all the time.
                                tracing::debug!(peer = %remote, "connection ended: {e}");
                            }
                        }
                        _ = shutdown.changed() => {
                            // Finish the in-flight exchange, then close.
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.as_mut().await;
                        }
                    }
                });
            }

            // Reap finished connection tasks so the set does not grow without
            // bound across a long test.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
}
