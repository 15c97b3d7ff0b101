//! Remote configuration fetcher with jittered re-polling

use super::handoff::ConfigPublisher;
use crate::common::random::secure_rng;
use crate::config::{PollWindow, RemoteConfig, ValidatedConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where configuration documents come from
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Location, for logging
    fn url(&self) -> &str;

    /// Fetch the raw document body
    async fn fetch(&self) -> Result<Vec<u8>>;
}

/// Fetches the document over HTTP(S)
pub struct HttpConfigSource {
    url: String,
    client: reqwest::Client,
}

impl HttpConfigSource {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::fetch(e.to_string()))?;
        Ok(HttpConfigSource { url, client })
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::fetch(format!("Unable to read configuration from response: {}", e)))?;

        if status != reqwest::StatusCode::OK {
            warn!(
                status = status.as_u16(),
                url = %self.url,
                "--------- Body was: -----------\n{}\n-----------------",
                String::from_utf8_lossy(&body)
            );
            return Err(Error::fetch(format!(
                "Unexpected response status: {}",
                status.as_u16()
            )));
        }

        Ok(body.to_vec())
    }
}

/// Polls a [`ConfigSource`] and publishes every document that validates
pub struct ConfigFetcher<S> {
    source: S,
    poll: PollWindow,
    publisher: ConfigPublisher,
}

impl<S: ConfigSource> ConfigFetcher<S> {
    pub fn new(source: S, initial_poll: PollWindow, publisher: ConfigPublisher) -> Self {
        ConfigFetcher {
            source,
            poll: initial_poll,
            publisher,
        }
    }

    /// Poll window used for the next sleep
    pub fn poll_window(&self) -> PollWindow {
        self.poll
    }

    /// Fetch, parse and validate one document
    pub async fn fetch_once(&self) -> Result<ValidatedConfig> {
        let body = self.source.fetch().await?;
        let config = RemoteConfig::from_slice(&body).map_err(|e| {
            warn!(
                url = self.source.url(),
                "Unable to decode configuration; body was:\n{}",
                String::from_utf8_lossy(&body)
            );
            e
        })?;
        config.validate()
    }

    /// Run until cancelled.
    ///
    /// Fetch and validation failures are logged and retried on the next tick.
    /// The only error returned is an entropy failure while drawing the next
    /// poll delay.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(url = self.source.url(), "polling fallback configuration");

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.fetch_once() => fetched,
            };

            match fetched {
                Ok(config) => {
                    self.poll = config.poll;
                    let serial = config.serial_no;
                    let published = tokio::select! {
                        _ = cancel.cancelled() => break,
                        published = self.publisher.publish(config) => published,
                    };
                    match published {
                        Ok(()) => debug!(serial, "configuration published"),
                        Err(e) => warn!(serial, "Configuration was not applied: {}", e),
                    }
                }
                Err(e) => {
                    warn!(url = self.source.url(), "Unable to update configuration: {}", e);
                }
            }

            let delay = self.next_delay()?;
            debug!(minutes = delay.as_secs() / 60, "next configuration poll scheduled");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("config fetcher stopped");
        Ok(())
    }

    fn next_delay(&self) -> Result<Duration> {
        let mut rng = secure_rng()?;
        Ok(self.poll.next_delay(&mut rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::remote::tests::test_cert_pem;
    use crate::provider::{handoff, FallbackRegistry};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serves scripted responses, then repeats the last one
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<Vec<u8>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<Vec<u8>>>) -> Self {
            ScriptedSource {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ConfigSource for ScriptedSource {
        fn url(&self) -> &str {
            "scripted://config"
        }

        async fn fetch(&self) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::fetch("script exhausted")))
        }
    }

    fn doc(serial: i64, cert: &str, minpoll: i64, maxpoll: i64) -> Vec<u8> {
        serde_json::json!({
            "serial_no": serial,
            "controller": "",
            "minpoll": minpoll,
            "maxpoll": maxpoll,
            "fallbacks": [
                { "ip": "10.0.0.1", "port": "443", "protocol": "tcp",
                  "auth_token": "token", "cert": cert }
            ]
        })
        .to_string()
        .into_bytes()
    }

    fn fetcher(source: ScriptedSource) -> (ConfigFetcher<ScriptedSource>, handoff::ConfigReceiver) {
        let (publisher, receiver) = handoff::channel();
        let fetcher = ConfigFetcher::new(source, PollWindow::new(5, 15).unwrap(), publisher);
        (fetcher, receiver)
    }

    #[tokio::test]
    async fn test_fetch_once_rejects_bad_cert() {
        let (fetcher, _rx) = fetcher(ScriptedSource::new(vec![Ok(doc(1, "garbage", 1, 2))]));
        assert!(matches!(fetcher.fetch_once().await, Err(Error::Certificate(_))));
    }

    #[tokio::test]
    async fn test_fetch_once_rejects_bad_json() {
        let (fetcher, _rx) = fetcher(ScriptedSource::new(vec![Ok(b"{not json".to_vec())]));
        assert!(matches!(fetcher.fetch_once().await, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn test_fetch_once_propagates_transport_error() {
        let (fetcher, _rx) = fetcher(ScriptedSource::new(vec![Err(Error::fetch(
            "Unexpected response status: 403",
        ))]));
        assert!(matches!(fetcher.fetch_once().await, Err(Error::Fetch(_))));
    }

    #[tokio::test]
    async fn test_run_publishes_valid_document_and_adopts_poll_window() {
        let pem = test_cert_pem();
        let (fetcher, receiver) = fetcher(ScriptedSource::new(vec![Ok(doc(3, &pem, 2, 4))]));
        let registry = Arc::new(FallbackRegistry::default());
        let cancel = CancellationToken::new();

        let consumer = tokio::spawn(registry.clone().consume(receiver, cancel.clone()));
        let running = tokio::spawn(fetcher.run(cancel.clone()));

        registry.wait_applied().await;
        assert_eq!(registry.serial(), Some(3));
        assert_eq!(registry.select().unwrap().host(), "10.0.0.1");

        // The fetcher is now in its jittered sleep; cancellation must end it.
        cancel.cancel();
        running.await.unwrap().unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_document_leaves_applied_set_unchanged() {
        let pem = test_cert_pem();
        let bad_cert = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        let source = ScriptedSource::new(vec![Ok(doc(1, &pem, 1, 2)), Ok(doc(9, bad_cert, 1, 2))]);
        let (fetcher, receiver) = fetcher(source);
        let registry = Arc::new(FallbackRegistry::default());
        let cancel = CancellationToken::new();

        let consumer = tokio::spawn(registry.clone().consume(receiver, cancel.clone()));
        let running = tokio::spawn(fetcher.run(cancel.clone()));

        registry.wait_applied().await;
        assert_eq!(registry.serial(), Some(1));
        let before = registry.select().unwrap().address();

        // Paused clock: the jittered sleeps elapse instantly, so the rejected
        // document and later failed polls all run inside this window.
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;

        assert_eq!(registry.serial(), Some(1));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.select().unwrap().address(), before);

        cancel.cancel();
        running.await.unwrap().unwrap();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_document_is_never_handed_off() {
        let source = ScriptedSource::new(vec![Ok(doc(9, "garbage", 1, 2))]);
        let (publisher, mut receiver) = handoff::channel();
        let fetcher = ConfigFetcher::new(source, PollWindow::new(5, 15).unwrap(), publisher);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(fetcher.run(cancel.clone()));

        // Nothing arrives on the hand-off while the fetcher sleeps.
        let received = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
        assert!(received.is_err());

        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_poll_window() {
        let (fetcher, _rx) = fetcher(ScriptedSource::new(vec![Err(Error::fetch("down"))]));
        assert!(fetcher.fetch_once().await.is_err());
        assert_eq!(fetcher.poll_window(), PollWindow::new(5, 15).unwrap());
        assert_eq!(fetcher.source.calls.load(Ordering::SeqCst), 1);
    }
}
