//! Cross-process bus channels.
//!
//! When the dispatcher and the scenario side run as separate OS processes, the
//! bus contract of [`crate::bus`] is carried over TCP as newline-delimited
//! JSON envelopes. Every bridged subsystem gets two unidirectional channels: a
//! command channel (scenario -> dispatcher) and a telemetry channel
//! (dispatcher -> consumers). Keeping the directions on separate sockets keeps
//! publish order unambiguous.
//!
//! Like the zmq sockets these replace, which end binds and which connects is
//! independent of the message direction: the dispatcher binds both of its
//! channel ends, scenario processes connect.

use std::collections::VecDeque;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::protocol::Message;

const FANOUT_BUFFER: usize = 256;

/// One message on a bus channel: the topic it was published under plus the
/// message itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, message: Message) -> Self {
        Self { topic: topic.into(), message }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("channel i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel endpoint closed")]
    Disconnected,
    #[error("envelope serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

enum PubInner {
    /// Fan-out server: every accepted subscriber gets every envelope, in
    /// connection order.
    Fanout(broadcast::Sender<String>),
    /// Single outbound link to a bound subscriber end.
    Link(mpsc::UnboundedSender<String>),
}

/// Publishing end of a channel.
pub struct PubEndpoint {
    inner: PubInner,
    local_addr: Option<SocketAddr>,
}

impl PubEndpoint {
    /// Bind a fan-out server. Subscribers connect and receive everything
    /// published from then on.
    pub async fn bind(addr: SocketAddr) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(FANOUT_BUFFER);
        let accept_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "channel subscriber connected");
                        let rx = accept_tx.subscribe();
                        tokio::spawn(feed_subscriber(stream, rx));
                    }
                    Err(error) => {
                        warn!(%error, "channel accept failed");
                        break;
                    }
                }
            }
        });
        info!(%local_addr, "publishing channel bound");
        Ok(Self { inner: PubInner::Fanout(tx), local_addr: Some(local_addr) })
    }

    /// Connect to a subscriber end bound elsewhere.
    pub async fn connect(addr: SocketAddr) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (_, write_half) = stream.into_split();
        tokio::spawn(async move {
            let mut writer = write_half;
            while let Some(line) = rx.recv().await {
                if let Err(error) = write_line(&mut writer, &line).await {
                    warn!(%error, "channel write failed, dropping link");
                    break;
                }
            }
        });
        Ok(Self { inner: PubInner::Link(tx), local_addr: None })
    }

    /// Publish one envelope. Publishing with no connected subscribers is a
    /// no-op, not an error.
    pub fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let line = serde_json::to_string(envelope)?;
        match &self.inner {
            PubInner::Fanout(tx) => {
                // A send error just means nobody is connected right now.
                let _ = tx.send(line);
                Ok(())
            }
            PubInner::Link(tx) => tx.send(line).map_err(|_| BusError::Disconnected),
        }
    }

    /// The bound address, for configurations using an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

async fn feed_subscriber(stream: TcpStream, mut rx: broadcast::Receiver<String>) {
    let (_, mut writer) = stream.into_split();
    loop {
        match rx.recv().await {
            Ok(line) => {
                if let Err(error) = write_line(&mut writer, &line).await {
                    debug!(%error, "subscriber link dropped");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "slow channel subscriber skipped envelopes");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Subscribing end of a channel. `ready().await` parks until an envelope is
/// buffered; `try_next()` pops without waiting.
pub struct SubEndpoint {
    rx: mpsc::UnboundedReceiver<Envelope>,
    pending: VecDeque<Envelope>,
    local_addr: Option<SocketAddr>,
}

impl SubEndpoint {
    /// Bind an intake server. Publisher links connect and everything they
    /// send is merged into one inbound stream.
    pub async fn bind(addr: SocketAddr) -> Result<Self, BusError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "channel publisher connected");
                        tokio::spawn(drain_publisher(stream, tx.clone()));
                    }
                    Err(error) => {
                        warn!(%error, "channel accept failed");
                        break;
                    }
                }
            }
        });
        info!(%local_addr, "subscription channel bound");
        Ok(Self { rx, pending: VecDeque::new(), local_addr: Some(local_addr) })
    }

    /// Connect to a fan-out server bound elsewhere.
    pub async fn connect(addr: SocketAddr) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_publisher(stream, tx));
        Ok(Self { rx, pending: VecDeque::new(), local_addr: None })
    }

    /// Wait until at least one envelope is available. If the feeding task is
    /// gone this parks forever; the caller's wait timeout still applies.
    pub async fn ready(&mut self) {
        if !self.pending.is_empty() {
            return;
        }
        match self.rx.recv().await {
            Some(envelope) => self.pending.push_back(envelope),
            None => std::future::pending::<()>().await,
        }
    }

    /// Pop the next buffered envelope, if any.
    pub fn try_next(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.pending.pop_front() {
            return Some(envelope);
        }
        self.rx.try_recv().ok()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

async fn drain_publisher(stream: TcpStream, tx: mpsc::UnboundedSender<Envelope>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => {
                    if tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "malformed envelope on channel, skipped"),
            },
            Ok(None) => {
                debug!("channel publisher disconnected");
                break;
            }
            Err(error) => {
                warn!(%error, "channel read failed");
                break;
            }
        }
    }
}
