//! Lantern relay - local forward proxy that tunnels through remote fallbacks
//!
//! The relay polls a remote JSON document describing fallback proxies, keeps
//! the current validated set in a registry, and forwards every local HTTP
//! proxy request to a fallback over a certificate-pinned TLS connection.
//!
//! # Architecture
//!
//! ```text
//!  +-------------------+   validated config   +---------------------+
//!  | provider::fetcher | -------------------> | provider::registry  |
//!  |  (poll + jitter)  |   (hand-off + ack)   |  (FallbackRegistry) |
//!  +-------------------+                      +----------+----------+
//!                                                        | select()
//!  +----------+   HTTP    +----------------+             |
//!  |  client  | --------> | inbound::http  | <-----------+
//!  +----------+           | (RelaySession) |
//!                         +-------+--------+
//!                                 | TLS (outbound)
//!                                 v
//!                         +----------------+
//!                         | remote fallback|
//!                         +----------------+
//! ```

pub mod common;
pub mod config;
pub mod inbound;
pub mod outbound;
pub mod provider;

pub use common::error::{Error, Result};
pub use config::Config;

use inbound::{Relay, RelayListener};
use provider::{handoff, policy_for, ConfigFetcher, ConfigSource, FallbackRegistry, HttpConfigSource};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Owns the registry and the shutdown token, and wires the fetcher, the
/// registry consumer and the listener together.
pub struct Gateway {
    config: Config,
    registry: Arc<FallbackRegistry>,
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(FallbackRegistry::new(
            config.trust_mode,
            policy_for(config.selection),
        ));

        info!(
            "Lantern relay v{} (trust: {:?}, selection: {})",
            VERSION,
            config.trust_mode,
            registry.policy_name()
        );

        Ok(Gateway {
            config,
            registry,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<FallbackRegistry> {
        &self.registry
    }

    /// Token that stops every task when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start polling the configured URL and serving clients
    pub async fn start(&self) -> Result<Running> {
        let url = self.config.resolve_config_url()?;
        let source = HttpConfigSource::new(url, self.config.fetch_timeout())?;
        self.start_with_source(source).await
    }

    /// Start with an explicit configuration source.
    ///
    /// With `wait-for-config` set, this returns only after the first document
    /// has been applied; the listener is not bound before then.
    pub async fn start_with_source<S>(&self, source: S) -> Result<Running>
    where
        S: ConfigSource + 'static,
    {
        let cancel = self.cancel.clone();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(1);
        let (publisher, receiver) = handoff::channel();

        let consumer = tokio::spawn(self.registry.clone().consume(receiver, cancel.clone()));

        let fetcher = ConfigFetcher::new(source, self.config.poll_window(), publisher);
        let fetch_fatal = fatal_tx.clone();
        let fetch_cancel = cancel.clone();
        let fetching = tokio::spawn(async move {
            if let Err(e) = fetcher.run(fetch_cancel).await {
                error!("Configuration fetcher failed: {}", e);
                let _ = fetch_fatal.try_send(e);
            }
        });

        if self.config.wait_for_config {
            info!("Waiting for fallback configuration");
            let waited = tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = self.registry.wait_applied() => Ok(()),
                fatal = fatal_rx.recv() => Err(fatal.unwrap_or(Error::Cancelled)),
            };
            if let Err(e) = waited {
                cancel.cancel();
                let _ = futures::future::join(fetching, consumer).await;
                return Err(e);
            }
        }

        let relay = Arc::new(Relay::from_config(&self.config, self.registry.clone()));
        let listener = match RelayListener::bind(self.config.listen_addr()?, relay, fatal_tx).await {
            Ok(listener) => listener,
            Err(e) => {
                cancel.cancel();
                let _ = futures::future::join(fetching, consumer).await;
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;
        let listening = tokio::spawn(listener.run(cancel.clone()));

        let completion = tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                fatal = fatal_rx.recv() => match fatal {
                    Some(e) => Err(e),
                    None => Ok(()),
                },
            };

            cancel.cancel();
            let (listened, _, _) = futures::future::join3(listening, fetching, consumer).await;
            match listened {
                Ok(Err(e)) => warn!("Listener stopped with error: {}", e),
                Err(e) => warn!("Listener task failed: {}", e),
                Ok(Ok(())) => {}
            }

            info!("Gateway stopped");
            outcome
        });

        Ok(Running {
            local_addr,
            completion,
        })
    }
}

/// A started gateway
pub struct Running {
    local_addr: SocketAddr,
    completion: JoinHandle<Result<()>>,
}

impl Running {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Completion signal: resolves once the listener has terminated.
    pub fn completion(self) -> JoinHandle<Result<()>> {
        self.completion
    }

    /// Wait for shutdown. Returns the fatal error, if one stopped the relay.
    pub async fn wait(self) -> Result<()> {
        self.completion
            .await
            .map_err(|e| Error::internal(format!("gateway task failed: {}", e)))?
    }
}
