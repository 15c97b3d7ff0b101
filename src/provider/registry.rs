//! Fallback registry
//!
//! Holds the current validated fallback set. The set is rebuilt in full on
//! every accepted document and swapped in under the lock, so `select` never
//! observes a partial update. Sessions get an owned snapshot of the chosen
//! fallback and never hold a reference into the registry.

use super::handoff::ConfigReceiver;
use crate::config::{FallbackSpec, SelectionMode, TrustMode, ValidatedConfig, ValidatedFallback};
use crate::common::net::join_host_port;
use crate::outbound::tls;
use crate::{Error, Result};
use parking_lot::Mutex;
use rustls::ClientConfig;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A fallback ready for use: the declared endpoint plus a TLS client config
/// trusting only its certificate.
#[derive(Clone)]
pub struct TrustedFallback {
    spec: Arc<FallbackSpec>,
    port: u16,
    tls_config: Arc<ClientConfig>,
}

impl TrustedFallback {
    pub fn new(spec: FallbackSpec, port: u16, tls_config: Arc<ClientConfig>) -> Self {
        TrustedFallback {
            spec: Arc::new(spec),
            port,
            tls_config,
        }
    }

    pub fn from_validated(fallback: ValidatedFallback, mode: TrustMode) -> Result<Self> {
        let tls_config = tls::client_config(&fallback.cert, mode)?;
        Ok(Self::new(fallback.spec, fallback.port, tls_config))
    }

    pub fn host(&self) -> &str {
        &self.spec.ip
    }

    /// `host:port` as dialed
    pub fn address(&self) -> String {
        join_host_port(&self.spec.ip, self.port)
    }

    pub fn protocol(&self) -> &str {
        &self.spec.protocol
    }

    pub fn auth_token(&self) -> &str {
        &self.spec.auth_token
    }

    pub fn tls_config(&self) -> Arc<ClientConfig> {
        self.tls_config.clone()
    }
}

impl fmt::Debug for TrustedFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedFallback")
            .field("address", &self.address())
            .field("protocol", &self.spec.protocol)
            .finish_non_exhaustive()
    }
}

/// Chooses which fallback serves a new session.
///
/// `pick` is only called with a non-empty set and must return an index
/// below `count`.
pub trait SelectionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn pick(&self, count: usize) -> usize;
}

/// Always the first fallback in document order
#[derive(Debug, Default)]
pub struct FirstFallback;

impl SelectionPolicy for FirstFallback {
    fn name(&self) -> &'static str {
        "first"
    }

    fn pick(&self, _count: usize) -> usize {
        0
    }
}

/// Cycles through fallbacks in document order
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SelectionPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn pick(&self, count: usize) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % count
    }
}

pub fn policy_for(mode: SelectionMode) -> Box<dyn SelectionPolicy> {
    match mode {
        SelectionMode::First => Box::new(FirstFallback),
        SelectionMode::RoundRobin => Box::new(RoundRobin::default()),
    }
}

struct Snapshot {
    serial: Option<i64>,
    fallbacks: Arc<[TrustedFallback]>,
}

/// Current fallback set, shared between the config consumer and sessions
pub struct FallbackRegistry {
    current: Mutex<Snapshot>,
    policy: Box<dyn SelectionPolicy>,
    trust_mode: TrustMode,
    /// Bumped on every successful apply
    generation: watch::Sender<u64>,
}

impl FallbackRegistry {
    pub fn new(trust_mode: TrustMode, policy: Box<dyn SelectionPolicy>) -> Self {
        let (generation, _) = watch::channel(0);
        FallbackRegistry {
            current: Mutex::new(Snapshot {
                serial: None,
                fallbacks: Arc::from(Vec::new()),
            }),
            policy,
            trust_mode,
            generation,
        }
    }

    /// Replace the fallback set with one built from `config`.
    ///
    /// The new set is built completely before the lock is taken; if any entry
    /// fails to build, the current set is left untouched.
    pub fn apply(&self, config: ValidatedConfig) -> Result<()> {
        let serial = config.serial_no;
        let fallbacks = config
            .fallbacks
            .into_iter()
            .map(|f| TrustedFallback::from_validated(f, self.trust_mode))
            .collect::<Result<Vec<_>>>()?;
        let count = fallbacks.len();

        {
            let mut current = self.current.lock();
            current.serial = Some(serial);
            current.fallbacks = Arc::from(fallbacks);
        }
        self.generation.send_modify(|g| *g += 1);

        if count == 0 {
            warn!(serial, "applied configuration has no fallbacks");
        } else {
            info!(serial, fallbacks = count, "fallback set updated");
        }
        Ok(())
    }

    /// Fallback for a new session, per the selection policy
    pub fn select(&self) -> Result<TrustedFallback> {
        let current = self.current.lock();
        let count = current.fallbacks.len();
        if count == 0 {
            return Err(Error::NoFallback);
        }
        let index = self.policy.pick(count).min(count - 1);
        Ok(current.fallbacks[index].clone())
    }

    pub fn len(&self) -> usize {
        self.current.lock().fallbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serial number of the applied document, if any
    pub fn serial(&self) -> Option<i64> {
        self.current.lock().serial
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Resolves once at least one document has been applied
    pub async fn wait_applied(&self) {
        let mut rx = self.generation.subscribe();
        let _ = rx.wait_for(|g| *g > 0).await;
    }

    /// Apply every published document until cancelled or the publisher is gone.
    pub async fn consume(self: Arc<Self>, mut updates: ConfigReceiver, cancel: CancellationToken) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };

            let (config, ack) = update.into_parts();
            let result = self.apply(config);
            if let Err(ref e) = result {
                warn!("Unable to apply fallback configuration: {}", e);
            }
            ack.complete(result);
        }
        debug!("config consumer stopped");
    }
}

impl Default for FallbackRegistry {
    fn default() -> Self {
        Self::new(TrustMode::default(), Box::new(FirstFallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::remote::tests::test_cert_pem;
    use crate::config::RemoteConfig;

    fn validated(hosts: &[(&str, &str, &str)]) -> ValidatedConfig {
        let pem = test_cert_pem();
        let fallbacks: Vec<_> = hosts
            .iter()
            .map(|(ip, port, token)| {
                serde_json::json!({
                    "ip": ip, "port": port, "protocol": "tcp",
                    "auth_token": token, "cert": pem
                })
            })
            .collect();
        let doc = serde_json::json!({
            "serial_no": 1, "controller": "", "minpoll": 1, "maxpoll": 2,
            "fallbacks": fallbacks
        });
        RemoteConfig::from_slice(doc.to_string().as_bytes())
            .unwrap()
            .validate()
            .unwrap()
    }

    #[test]
    fn test_select_returns_first_fallback() {
        let registry = FallbackRegistry::default();
        registry
            .apply(validated(&[("10.0.0.1", "443", "a"), ("10.0.0.2", "443", "b")]))
            .unwrap();

        for _ in 0..10 {
            let fallback = registry.select().unwrap();
            assert_eq!(fallback.host(), "10.0.0.1");
            assert_eq!(fallback.auth_token(), "a");
        }
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.serial(), Some(1));
    }

    #[test]
    fn test_select_on_empty_registry_is_typed_error() {
        let registry = FallbackRegistry::default();
        assert!(matches!(registry.select(), Err(Error::NoFallback)));

        registry.apply(validated(&[])).unwrap();
        assert!(matches!(registry.select(), Err(Error::NoFallback)));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let doc = validated(&[("10.0.0.9", "8443", "token")]);
        let once = FallbackRegistry::default();
        once.apply(doc.clone()).unwrap();

        let twice = FallbackRegistry::default();
        twice.apply(doc.clone()).unwrap();
        twice.apply(doc).unwrap();

        let a = once.select().unwrap();
        let b = twice.select().unwrap();
        assert_eq!(a.address(), b.address());
        assert_eq!(a.auth_token(), b.auth_token());
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn test_snapshot_survives_replacement() {
        let registry = FallbackRegistry::default();
        registry.apply(validated(&[("10.0.0.1", "443", "old")])).unwrap();
        let held = registry.select().unwrap();

        registry.apply(validated(&[("10.0.0.2", "443", "new")])).unwrap();
        assert_eq!(held.auth_token(), "old");
        assert_eq!(registry.select().unwrap().auth_token(), "new");
    }

    #[test]
    fn test_round_robin_policy() {
        let registry = FallbackRegistry::new(TrustMode::Pinned, policy_for(SelectionMode::RoundRobin));
        registry
            .apply(validated(&[("10.0.0.1", "443", "a"), ("10.0.0.2", "443", "b")]))
            .unwrap();
        let picks: Vec<_> = (0..4)
            .map(|_| registry.select().unwrap().auth_token().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "a", "b"]);
        assert_eq!(registry.policy_name(), "round-robin");
    }

    #[test]
    fn test_debug_hides_token() {
        let registry = FallbackRegistry::default();
        registry.apply(validated(&[("10.0.0.1", "443", "hunter2")])).unwrap();
        let printed = format!("{:?}", registry.select().unwrap());
        assert!(printed.contains("10.0.0.1:443"));
        assert!(!printed.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_consume_applies_published_config() {
        let registry = Arc::new(FallbackRegistry::default());
        let (publisher, receiver) = crate::provider::handoff::channel();
        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(registry.clone().consume(receiver, cancel.clone()));

        publisher
            .publish(validated(&[("10.0.0.1", "443", "a")]))
            .await
            .unwrap();
        // publish only returns once the registry has applied the document
        assert_eq!(registry.len(), 1);
        registry.wait_applied().await;

        cancel.cancel();
        consumer.await.unwrap();
    }
}
