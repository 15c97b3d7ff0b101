//! HTTP relay inbound
//!
//! Every accepted connection becomes one [`RelaySession`]: read the request
//! head, pick a fallback, dial it over TLS, take over the client socket, inject
//! the padding and auth headers, then splice bytes both ways until either side
//! closes. Any failure before splicing starts answers the client with a
//! `502 Bad Gateway`.

use super::http_response::{bad_gateway, bad_request, write_response};
use super::request::{RequestHead, AUTH_TOKEN_HEADER, MAX_HEAD_SIZE, PADDING_HEADER};
use crate::common::net::{configure_tcp_stream, splice};
use crate::common::PaddingToken;
use crate::config::Config;
use crate::outbound::FallbackDialer;
use crate::provider::FallbackRegistry;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// A client connection whose raw byte stream can be taken over once the
/// request head has been read.
pub trait Hijack: AsyncRead + AsyncWrite + Unpin + Send + Sized {
    type Raw: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Give up the raw stream, or hand `self` back with the reason it cannot.
    fn hijack(self) -> std::result::Result<Self::Raw, (Self, Error)>;
}

impl Hijack for TcpStream {
    type Raw = TcpStream;

    fn hijack(self) -> std::result::Result<Self::Raw, (Self, Error)> {
        Ok(self)
    }
}

impl Hijack for DuplexStream {
    type Raw = DuplexStream;

    fn hijack(self) -> std::result::Result<Self::Raw, (Self, Error)> {
        Ok(self)
    }
}

/// Client side of a session: the stream plus whatever was read past the head
#[derive(Debug)]
pub struct ClientConn<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: Hijack> ClientConn<S> {
    pub fn new(stream: S) -> Self {
        ClientConn {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read until a complete request head is buffered and parse it.
    ///
    /// Bytes after the head stay buffered and are returned by [`hijack`].
    ///
    /// [`hijack`]: ClientConn::hijack
    pub async fn read_head(&mut self) -> Result<RequestHead> {
        loop {
            if !self.buf.is_empty() {
                if let Some((head, len)) = RequestHead::parse(&self.buf)? {
                    let _ = self.buf.split_to(len);
                    return Ok(head);
                }
            }

            if self.buf.len() >= MAX_HEAD_SIZE {
                return Err(Error::protocol("Request header too large"));
            }

            let n = self.stream.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    Error::protocol("Empty request")
                } else {
                    Error::protocol("Connection closed before request head complete")
                });
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Take the raw stream and any buffered bytes that follow the head.
    pub fn hijack(self) -> std::result::Result<(S::Raw, Bytes), (Self, Error)> {
        let ClientConn { stream, buf } = self;
        match stream.hijack() {
            Ok(raw) => Ok((raw, buf.freeze())),
            Err((stream, e)) => Err((ClientConn { stream, buf }, e)),
        }
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Selecting,
    Dialing,
    Hijacking,
    Padding,
    Forwarding,
    Piping,
    Closed,
}

impl SessionStage {
    /// Failures in these stages are still answered with a 502
    pub fn can_reject(&self) -> bool {
        !matches!(self, SessionStage::Piping | SessionStage::Closed)
    }
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStage::Selecting => "selecting",
            SessionStage::Dialing => "dialing",
            SessionStage::Hijacking => "hijacking",
            SessionStage::Padding => "padding",
            SessionStage::Forwarding => "forwarding",
            SessionStage::Piping => "piping",
            SessionStage::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one proxied request
#[derive(Debug)]
pub struct RelaySession {
    peer: SocketAddr,
    url: String,
    stage: SessionStage,
    upstream: Option<String>,
}

impl RelaySession {
    pub fn new(peer: SocketAddr, url: String) -> Self {
        RelaySession {
            peer,
            url,
            stage: SessionStage::Selecting,
            upstream: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn advance(&mut self, stage: SessionStage) {
        trace!(peer = %self.peer, from = %self.stage, to = %stage, "session stage");
        self.stage = stage;
    }
}

/// Totals for a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub upstream: String,
    pub sent: u64,
    pub received: u64,
}

/// Runs sessions against the current fallback set
pub struct Relay {
    registry: Arc<FallbackRegistry>,
    dialer: FallbackDialer,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Relay {
    pub fn new(
        registry: Arc<FallbackRegistry>,
        dialer: FallbackDialer,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Relay {
            registry,
            dialer,
            read_timeout,
            write_timeout,
        }
    }

    pub fn from_config(config: &Config, registry: Arc<FallbackRegistry>) -> Self {
        Self::new(
            registry,
            FallbackDialer::from_config(config),
            config.read_timeout(),
            config.write_timeout(),
        )
    }

    pub fn registry(&self) -> &Arc<FallbackRegistry> {
        &self.registry
    }

    /// Serve one client connection to completion
    pub async fn serve<S: Hijack>(&self, stream: S, peer: SocketAddr) -> Result<SessionSummary> {
        let mut client = ClientConn::new(stream);

        let mut head = match timeout(self.read_timeout, client.read_head()).await {
            Ok(Ok(head)) => head,
            Ok(Err(Error::Protocol(reason))) => {
                debug!(peer = %peer, "rejecting request: {}", reason);
                let _ = write_response(client.get_mut(), &bad_request(&reason), self.write_timeout)
                    .await;
                return Err(Error::Protocol(reason));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::timeout(format!(
                    "Reading request head from {}",
                    peer
                )))
            }
        };

        let mut session = RelaySession::new(peer, head.proxy_uri().to_string());

        let fallback = match self.registry.select() {
            Ok(fallback) => fallback,
            Err(e) => {
                self.reject(&mut session, client.get_mut(), &e.to_string()).await;
                return Err(e);
            }
        };
        session.upstream = Some(fallback.address());
        debug!(
            peer = %peer,
            method = head.method(),
            url = session.url(),
            upstream = %fallback.address(),
            protocol = fallback.protocol(),
            "relaying request"
        );

        session.advance(SessionStage::Dialing);
        let mut upstream = match self.dialer.dial(&fallback).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let reason = format!("Unable to open socket to upstream proxy: {}", e);
                self.reject(&mut session, client.get_mut(), &reason).await;
                return Err(e);
            }
        };

        session.advance(SessionStage::Hijacking);
        let (mut raw, buffered) = match client.hijack() {
            Ok(taken) => taken,
            Err((mut client, e)) => {
                drop(upstream);
                self.reject(&mut session, client.get_mut(), &e.to_string()).await;
                return Err(e);
            }
        };

        session.advance(SessionStage::Padding);
        let padding = match PaddingToken::generate() {
            Ok(padding) => padding,
            Err(e) => {
                let reason = format!("Unable to generate random length header: {}", e);
                self.reject(&mut session, &mut raw, &reason).await;
                return Err(e);
            }
        };

        session.advance(SessionStage::Forwarding);
        head.set_header(PADDING_HEADER, padding.as_str());
        head.set_header(AUTH_TOKEN_HEADER, fallback.auth_token());
        let encoded = head.encode_proxy();

        let forwarded = timeout(self.write_timeout, async {
            upstream.write_all(&encoded).await?;
            if !buffered.is_empty() {
                upstream.write_all(&buffered).await?;
            }
            upstream.flush().await
        })
        .await;
        let forwarded = match forwarded {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::timeout("Writing request to upstream proxy")),
        };
        if let Err(e) = forwarded {
            let reason = format!("Unable to forward request to upstream proxy: {}", e);
            self.reject(&mut session, &mut raw, &reason).await;
            return Err(e);
        }
        trace!(peer = %peer, padding = padding.len(), head = encoded.len(), "request forwarded");

        session.advance(SessionStage::Piping);
        let (sent, received) = splice(raw, upstream).await?;
        session.advance(SessionStage::Closed);

        Ok(SessionSummary {
            upstream: fallback.address(),
            sent,
            received,
        })
    }

    async fn reject<W>(&self, session: &mut RelaySession, writer: &mut W, reason: &str)
    where
        W: AsyncWrite + Unpin,
    {
        debug_assert!(session.stage.can_reject());
        debug!(
            peer = %session.peer,
            url = session.url(),
            stage = %session.stage,
            upstream = session.upstream.as_deref().unwrap_or("-"),
            "Bad Gateway: {}",
            reason
        );

        let response = bad_gateway(&session.url, reason);
        if let Err(e) = write_response(writer, &response, self.write_timeout).await {
            debug!(peer = %session.peer, "Unable to write error to client: {}", e);
        }
        session.advance(SessionStage::Closed);
    }
}

/// Accept loop for the local listener
pub struct RelayListener {
    listener: TcpListener,
    relay: Arc<Relay>,
    fatal: mpsc::Sender<Error>,
}

impl RelayListener {
    /// Bind `addr`. Errors that leave the relay useless are reported on `fatal`.
    pub async fn bind(addr: SocketAddr, relay: Arc<Relay>, fatal: mpsc::Sender<Error>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connection(format!("Unable to listen at {}: {}", addr, e)))?;
        Ok(RelayListener {
            listener,
            relay,
            fatal,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until cancelled. In-flight sessions are dropped on cancellation.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.listener.local_addr()?;
        info!("HTTP relay listening on {}", addr);

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("HTTP accept error: {}", e);
                        continue;
                    }
                },
            };

            configure_tcp_stream(&stream);
            let relay = self.relay.clone();
            let fatal = self.fatal.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let served = tokio::select! {
                    _ = cancel.cancelled() => return,
                    served = relay.serve(stream, peer) => served,
                };

                match served {
                    Ok(summary) => debug!(
                        "Session {} -> {} completed (sent: {}, received: {})",
                        peer, summary.upstream, summary.sent, summary.received
                    ),
                    Err(Error::NoFallback) => {
                        error!("No fallback configured, relay cannot serve {}", peer);
                        let _ = fatal.try_send(Error::NoFallback);
                    }
                    Err(e) => debug!("Session from {} ended: {}", peer, e),
                }
            });
        }

        info!("HTTP relay on {} stopped", addr);
        Ok(())
    }
}
