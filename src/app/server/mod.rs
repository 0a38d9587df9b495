pub mod generation;
pub mod speech;

use anyhow::{Context, Result};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tracing::{info, warn};

/// Cloneable trigger for a graceful server stop.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Model state of one service: created empty when the server starts, filled
/// once by the background loader, read by every request.
pub struct ServiceContext<T: ?Sized> {
    model: OnceCell<Arc<T>>,
    shutdown: Shutdown,
}

impl<T: ?Sized> ServiceContext<T> {
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            model: OnceCell::new(),
            shutdown,
        }
    }

    /// Returns false when a model was already installed.
    pub fn install(&self, model: Arc<T>) -> bool {
        self.model.set(model).is_ok()
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.model.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

pub struct Server {
    host: String,
    port: u16,
    router: Router,
}

impl Server {
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            router: Router::new(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn routes(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        info!("Server listening on {}", addr);

        let signal = async move {
            tokio::select! {
                _ = shutdown.wait() => info!("Shutdown requested"),
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("Failed to listen for ctrl-c: {}", e);
                        shutdown.wait().await;
                    }
                    info!("Interrupted");
                }
            }
        };
        axum::serve(listener, self.router)
            .with_graceful_shutdown(signal)
            .await?;

        info!("Server on {} stopped", addr);
        Ok(())
    }

    /// Serves while `load` builds the model for `context`.
    ///
    /// A server error is returned as soon as it happens, without waiting for
    /// the load. A failed load stops the server and fails the call. A model
    /// that finishes loading after shutdown was requested is dropped.
    pub async fn run_with_loader<T: ?Sized>(
        self,
        context: &ServiceContext<T>,
        load: impl Future<Output = Result<Arc<T>>>,
    ) -> Result<()> {
        let shutdown = context.shutdown().clone();
        let served = self.run(shutdown.clone());
        tokio::pin!(served);
        tokio::pin!(load);

        tokio::select! {
            result = &mut served => result,
            loaded = &mut load => match loaded {
                Ok(model) => {
                    if shutdown.is_triggered() {
                        info!("Shutdown requested while loading, discarding the model");
                    } else {
                        context.install(model);
                        info!("Model ready");
                    }
                    served.await
                }
                Err(e) => {
                    shutdown.trigger();
                    if let Err(stop) = served.await {
                        warn!("Server stopped with error: {:#}", stop);
                    }
                    Err(e.context("Failed to load model"))
                }
            },
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use axum::body::Body;
    use axum::http::{Request, Response};

    pub async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        waiter.await.unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.wait().await;
    }

    fn context() -> ServiceContext<str> {
        ServiceContext::new(Shutdown::new())
    }

    #[tokio::test]
    async fn test_bind_failure_does_not_wait_for_load() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let context = context();
        let load = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, anyhow::Error>(Arc::<str>::from("late"))
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Server::new().port(port).run_with_loader(&context, load),
        )
        .await
        .expect("bind failure should not wait for the loader");

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to bind"), "{:#}", err);
        assert!(!context.is_loaded());
    }

    #[tokio::test]
    async fn test_load_failure_stops_server() {
        let context = context();
        let load = async { Err::<Arc<str>, _>(anyhow::anyhow!("weights missing")) };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Server::new().port(0).run_with_loader(&context, load),
        )
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to load model: weights missing"));
        assert!(context.shutdown().is_triggered());
        assert!(!context.is_loaded());
    }

    #[tokio::test]
    async fn test_model_loaded_after_shutdown_is_not_installed() {
        let context = context();
        let shutdown = context.shutdown().clone();
        let load = async move {
            shutdown.trigger();
            Ok::<_, anyhow::Error>(Arc::<str>::from("late"))
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            Server::new().port(0).run_with_loader(&context, load),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!context.is_loaded());
    }

    #[test]
    fn test_context_installs_once() {
        let context = context();
        assert!(!context.is_loaded());
        assert!(context.install(Arc::from("first")));
        assert!(!context.install(Arc::from("second")));
        assert_eq!(context.get().as_deref(), Some("first"));
    }
}
