//! Association server lifecycle.
//!
//! Listens for incoming associations, serves each one on its own task,
//! and drains in-flight associations on shutdown before returning.

use std::sync::Arc;

use snafu::{Report, ResultExt, Whatever};
use tokio::net::TcpListener;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::ServiceRegistry;
use crate::security::TlsMaterial;

mod association;

pub use association::VERIFICATION;

/// A-ASSOCIATE-RJ PDU: rejected-transient, service provider
/// (presentation related), local-limit-exceeded (PS3.8 9.3.4).
const ASSOCIATE_RJ_LOCAL_LIMIT: [u8; 10] =
    [0x03, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x02, 0x03, 0x02];

/// Tell the peer the association limit is reached, then close.
async fn reject_at_capacity(mut socket: tokio::net::TcpStream) {
    use tokio::io::AsyncWriteExt;
    let _ = socket.write_all(&ASSOCIATE_RJ_LOCAL_LIMIT).await;
    let _ = socket.shutdown().await;
}

/// The Order Filler association server.
pub struct OrderFiller {
    config: Arc<ServerConfig>,
    registry: Arc<ServiceRegistry>,
    tls: Option<Arc<TlsMaterial>>,
    shutdown: Arc<Notify>,
}

impl OrderFiller {
    pub fn new(config: ServerConfig, registry: ServiceRegistry) -> Self {
        OrderFiller {
            config: Arc::new(config),
            registry: Arc::new(registry),
            tls: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(Arc::new(tls));
        self
    }

    /// Handle that stops the server when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the listener until shutdown is requested.
    ///
    /// On shutdown the listener closes first, then all in-flight
    /// associations are allowed to finish before this returns.
    pub async fn run(&self) -> Result<(), Whatever> {
        let listen_addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&listen_addr)
            .await
            .whatever_context(format!("could not bind to {listen_addr}"))?;
        info!(
            "{} listening on: tcp://{}",
            self.config.ae_title, listen_addr
        );
        if self.config.max_outstanding_ops > 1 {
            // TODO: offer the asynchronous operations window during
            // negotiation once the upper layer exposes extended items
            warn!(
                maxops = self.config.max_outstanding_ops,
                "asynchronous operations window configured, but operations are processed sequentially per association"
            );
        }
        if let Some(tls) = &self.tls {
            // TODO: wire the loaded material into an acceptor once the
            // upper layer crate grows TLS support
            warn!(
                cipher_suite = ?tls.config.cipher_suite,
                "TLS material validated, but associations are served over plain TCP"
            );
        }

        let permits = Arc::new(Semaphore::new(self.config.max_associations));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        warn!("refusing association from {}: at capacity", peer);
                        tokio::spawn(reject_at_capacity(socket));
                        continue;
                    };
                    let config = self.config.clone();
                    let registry = self.registry.clone();
                    tasks.spawn(async move {
                        if let Err(e) = association::serve(socket, config, registry).await {
                            error!("{}", Report::from_error(e));
                        }
                        drop(permit);
                    });
                }
                _ = self.shutdown.notified() => {
                    info!("shutdown requested, draining associations");
                    break;
                }
            }

            // reap finished association tasks without blocking accept
            while tasks.try_join_next().is_some() {}
        }

        drop(listener);
        while tasks.join_next().await.is_some() {}
        info!("server stopped");
        Ok(())
    }
}
