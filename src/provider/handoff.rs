//! Blocking hand-off of validated configurations to the registry consumer
//!
//! A bounded channel carries each document together with a oneshot
//! acknowledgement. `publish` waits for that acknowledgement, so the fetcher
//! cannot get ahead of the consumer and documents are applied in publish
//! order.

use crate::config::ValidatedConfig;
use crate::{Error, Result};
use tokio::sync::{mpsc, oneshot};

/// A published document awaiting application
pub struct ConfigUpdate {
    config: ValidatedConfig,
    ack: Ack,
}

impl ConfigUpdate {
    pub fn into_parts(self) -> (ValidatedConfig, Ack) {
        (self.config, self.ack)
    }
}

/// Completion handle returned to the publisher
pub struct Ack(oneshot::Sender<Result<()>>);

impl Ack {
    pub fn complete(self, result: Result<()>) {
        let _ = self.0.send(result);
    }
}

/// Sending side, owned by the fetcher
#[derive(Clone)]
pub struct ConfigPublisher {
    tx: mpsc::Sender<ConfigUpdate>,
}

impl ConfigPublisher {
    /// Hand `config` to the consumer and wait until it has been applied.
    pub async fn publish(&self, config: ValidatedConfig) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(ConfigUpdate {
                config,
                ack: Ack(ack_tx),
            })
            .await
            .map_err(|_| Error::internal("config consumer has stopped"))?;

        ack_rx
            .await
            .map_err(|_| Error::internal("config consumer dropped the update"))?
    }
}

/// Receiving side, owned by the registry consumer
pub struct ConfigReceiver {
    rx: mpsc::Receiver<ConfigUpdate>,
}

impl ConfigReceiver {
    pub async fn recv(&mut self) -> Option<ConfigUpdate> {
        self.rx.recv().await
    }
}

pub fn channel() -> (ConfigPublisher, ConfigReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ConfigPublisher { tx }, ConfigReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollWindow;
    use std::time::Duration;

    fn empty_config(serial_no: i64) -> ValidatedConfig {
        ValidatedConfig {
            serial_no,
            controller: String::new(),
            poll: PollWindow::new(1, 2).unwrap(),
            fallbacks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_waits_for_ack() {
        let (publisher, mut receiver) = channel();

        let publishing = tokio::spawn(async move { publisher.publish(empty_config(1)).await });

        let update = receiver.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publishing.is_finished());

        let (config, ack) = update.into_parts();
        assert_eq!(config.serial_no, 1);
        ack.complete(Ok(()));
        publishing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_publish_reports_apply_failure() {
        let (publisher, mut receiver) = channel();
        let publishing = tokio::spawn(async move { publisher.publish(empty_config(2)).await });

        let (_, ack) = receiver.recv().await.unwrap().into_parts();
        ack.complete(Err(Error::tls("bad")));
        assert!(matches!(publishing.await.unwrap(), Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn test_publish_fails_without_consumer() {
        let (publisher, receiver) = channel();
        drop(receiver);
        assert!(publisher.publish(empty_config(3)).await.is_err());
    }
}
