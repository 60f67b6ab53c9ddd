//! The bridge reactor.
//!
//! One dispatcher process owns one link to the system under test plus the two
//! bus channels for its subsystem, and copies messages between them:
//!
//! ```text
//! link -> frame -> decode -> telemetry channel
//! command channel -> encode -> link
//! ```
//!
//! A single cooperative loop serves everything. The wait timeout is short
//! while a serial frame is being accumulated and long when idle, so frame
//! flushing and liveness logging ride the same clock. Handlers are never
//! aborted mid-execution; shutdown is a flag consulted at each iteration
//! boundary.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, TransportConfig};
use crate::framing::{Frame, FrameAssembler, IDLE_TIMEOUT, MAX_FRAME_LEN};
use crate::netbus::{Envelope, PubEndpoint, SubEndpoint};
use crate::protocol::{Message, ProtocolFamily};
use crate::session::{ByteLink, Session, SessionId};

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("bus channel: {0}")]
    Channel(#[from] crate::netbus::BusError),
    #[error("every transport is gone; supervisor restart required")]
    TransportLost,
}

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BridgeStats {
    pub sessions_accepted: u64,
    pub sessions_closed: u64,
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub telemetry_out: u64,
    pub commands_in: u64,
    pub commands_rejected: u64,
}

#[derive(Default)]
struct ShutdownFlag {
    stop: AtomicBool,
    notify: Notify,
}

/// Clonable stop control handed to supervisors and signal handlers.
#[derive(Clone)]
pub struct DispatcherHandle {
    flag: Arc<ShutdownFlag>,
}

impl DispatcherHandle {
    pub fn stop(&self) {
        self.flag.stop.store(true, Ordering::Relaxed);
        self.flag.notify.notify_waiters();
    }
}

/// Single-reactor bridge between one transport and its bus channels.
pub struct Dispatcher {
    name: String,
    family: ProtocolFamily,
    transport: TransportConfig,
    command_bind: SocketAddr,
    telemetry_bind: SocketAddr,
    command_topic: String,
    telemetry_topic: String,
    listener: Option<TcpListener>,
    udp: Option<UdpSocket>,
    udp_peer: Option<SocketAddr>,
    session: Option<Session>,
    commands: Option<SubEndpoint>,
    telemetry: Option<PubEndpoint>,
    shutdown: Arc<ShutdownFlag>,
    next_session: u64,
    stats: BridgeStats,
}

impl Dispatcher {
    pub fn new(config: BridgeConfig) -> Self {
        let command_topic = config.command_topic();
        let telemetry_topic = config.telemetry_topic();
        let bridge = config.bridge;
        Self {
            name: bridge.name,
            family: bridge.family,
            transport: bridge.transport,
            command_bind: bridge.channels.command,
            telemetry_bind: bridge.channels.telemetry,
            command_topic,
            telemetry_topic,
            listener: None,
            udp: None,
            udp_peer: None,
            session: None,
            commands: None,
            telemetry: None,
            shutdown: Arc::new(ShutdownFlag::default()),
            next_session: 0,
            stats: BridgeStats::default(),
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle { flag: Arc::clone(&self.shutdown) }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the link OBIS connects to (TCP/UDP transports), once bound.
    pub fn transport_addr(&self) -> Option<SocketAddr> {
        if let Some(listener) = &self.listener {
            return listener.local_addr().ok();
        }
        self.udp.as_ref().and_then(|socket| socket.local_addr().ok())
    }

    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.commands.as_ref().and_then(SubEndpoint::local_addr)
    }

    pub fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.telemetry.as_ref().and_then(PubEndpoint::local_addr)
    }

    /// Open the transport named by configuration and bind both bus channels.
    pub async fn create_sessions(&mut self) -> Result<(), DispatcherError> {
        let transport = self.transport.clone();
        match transport {
            TransportConfig::Tcp { bind } => {
                let listener = TcpListener::bind(bind).await?;
                info!(name = %self.name, addr = %listener.local_addr()?, "listening for OBIS");
                self.listener = Some(listener);
            }
            TransportConfig::Udp { bind } => {
                let socket = UdpSocket::bind(bind).await?;
                info!(name = %self.name, addr = %socket.local_addr()?, "datagram link open");
                self.udp = Some(socket);
            }
            TransportConfig::Serial { device, baud } => {
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&device)
                    .await?;
                info!(name = %self.name, device = %device.display(), baud, "serial link open");
                self.attach_byte_stream(Box::new(file), &device.display().to_string(), baud);
            }
        }
        self.commands = Some(SubEndpoint::bind(self.command_bind).await?);
        self.telemetry = Some(PubEndpoint::bind(self.telemetry_bind).await?);
        Ok(())
    }

    /// Install a byte-stream session directly. Used for the serial transport
    /// and for in-memory links in tests.
    pub fn attach_byte_stream(&mut self, stream: Box<dyn ByteLink>, peer: &str, baud: u32) {
        let id = self.next_session_id();
        self.session = Some(Session::connected(
            id,
            stream,
            peer.to_string(),
            FrameAssembler::byte_stream(baud),
        ));
    }

    /// The reactor loop. Returns when [`DispatcherHandle::stop`] is called or
    /// when no transport remains to serve.
    pub async fn run(&mut self) -> Result<(), DispatcherError> {
        if self.telemetry.is_none() {
            self.create_sessions().await?;
        }
        info!(name = %self.name, family = %self.family, "bridge running");
        let mut link_buf = vec![0u8; MAX_FRAME_LEN];
        let mut udp_buf = vec![0u8; MAX_FRAME_LEN];

        loop {
            if self.shutdown.stop.load(Ordering::Relaxed) {
                info!(name = %self.name, "bridge stopped");
                return Ok(());
            }
            if self.session.is_none() && self.listener.is_none() && self.udp.is_none() {
                error!(name = %self.name, "transport lost");
                return Err(DispatcherError::TransportLost);
            }

            let wait = match &self.session {
                Some(session) => session.assembler().poll_timeout(Instant::now()),
                None => IDLE_TIMEOUT,
            };
            let accept_from =
                if self.session.is_none() { self.listener.as_ref() } else { None };

            tokio::select! {
                biased;
                _ = stop_requested(&self.shutdown) => {}
                _ = command_ready(self.commands.as_mut()) => {
                    self.process_commands().await;
                }
                accepted = maybe_accept(accept_from) => {
                    match accepted {
                        Ok((stream, peer)) => self.accept_session(stream, peer),
                        Err(error) => warn!(%error, "accept failed"),
                    }
                }
                read = maybe_read(self.session.as_mut(), &mut link_buf) => {
                    match read {
                        Ok(0) => self.close_session(),
                        Ok(n) => self.ingest(&link_buf[..n]),
                        Err(error) => {
                            warn!(%error, "session read failed");
                            self.close_session();
                        }
                    }
                }
                received = maybe_recv(self.udp.as_ref(), &mut udp_buf) => {
                    match received {
                        Ok((n, peer)) => {
                            self.udp_peer = Some(peer);
                            let now = Instant::now();
                            let frame = Frame {
                                bytes: udp_buf[..n].to_vec(),
                                session: SessionId(0),
                                received_at: now,
                            };
                            self.handle_frame(frame);
                        }
                        Err(error) => {
                            error!(%error, "datagram link failed");
                            self.udp = None;
                        }
                    }
                }
                _ = tokio::time::sleep(wait) => {
                    self.on_wait_timeout();
                }
            }
        }
    }

    fn next_session_id(&mut self) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        id
    }

    fn accept_session(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_session_id();
        self.stats.sessions_accepted += 1;
        self.session = Some(Session::connected(
            id,
            Box::new(stream),
            peer.to_string(),
            FrameAssembler::delimited(),
        ));
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            self.stats.sessions_closed += 1;
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let now = Instant::now();
        let frames = match self.session.as_mut() {
            Some(session) => session.feed(bytes, now),
            None => return,
        };
        for frame in frames {
            self.handle_frame(frame);
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        self.stats.frames_in += 1;
        match self.family.decode(&frame.bytes) {
            Ok(message) => {
                debug!(session = %frame.session, tag = message.tag(), "message decoded");
                self.publish_telemetry(message);
            }
            Err(error) => {
                // One bad frame never takes the bridge down.
                warn!(session = %frame.session, %error, "frame dropped");
                self.stats.frames_dropped += 1;
            }
        }
    }

    fn publish_telemetry(&mut self, message: Message) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let envelope = Envelope::new(self.telemetry_topic.clone(), message);
        match telemetry.publish(&envelope) {
            Ok(()) => self.stats.telemetry_out += 1,
            Err(error) => warn!(%error, "telemetry publish failed"),
        }
    }

    async fn process_commands(&mut self) {
        loop {
            let Some(envelope) = self.commands.as_mut().and_then(SubEndpoint::try_next)
            else {
                break;
            };
            self.stats.commands_in += 1;
            if envelope.topic != self.command_topic {
                debug!(topic = %envelope.topic, "foreign topic on command channel");
            }
            let bytes = match self.family.encode(&envelope.message) {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(%error, "command rejected");
                    self.stats.commands_rejected += 1;
                    continue;
                }
            };
            let mut write_failed = false;
            if let Some(session) = self.session.as_mut() {
                if let Err(error) = session.write_all(&bytes).await {
                    warn!(%error, "session write failed");
                    write_failed = true;
                }
            } else if let (Some(udp), Some(peer)) = (&self.udp, self.udp_peer) {
                if let Err(error) = udp.send_to(&bytes, peer).await {
                    warn!(%error, "datagram send failed");
                }
            } else {
                warn!("command dropped, no connected session");
                self.stats.commands_rejected += 1;
            }
            if write_failed {
                self.close_session();
            }
        }
    }

    fn on_wait_timeout(&mut self) {
        let now = Instant::now();
        let flushed = self.session.as_mut().and_then(|session| {
            let id = session.id();
            session
                .assembler_mut()
                .on_timeout(now)
                .map(|blob| Frame { bytes: blob, session: id, received_at: now })
        });
        match flushed {
            Some(frame) => self.handle_frame(frame),
            None => debug!(name = %self.name, "still alive"),
        }
    }
}

async fn stop_requested(flag: &ShutdownFlag) {
    flag.notify.notified().await;
}

async fn command_ready(commands: Option<&mut SubEndpoint>) {
    match commands {
        Some(endpoint) => endpoint.ready().await,
        None => std::future::pending().await,
    }
}

async fn maybe_accept(
    listener: Option<&TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn maybe_read(session: Option<&mut Session>, buf: &mut [u8]) -> std::io::Result<usize> {
    match session {
        Some(session) => session.read_chunk(buf).await,
        None => std::future::pending().await,
    }
}

async fn maybe_recv(
    udp: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match udp {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeSection, ChannelsConfig};
    use crate::netbus::SubEndpoint;
    use crate::protocol::{CcuKind, CcuReply, CcuRequest};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    fn serial_test_config() -> BridgeConfig {
        BridgeConfig {
            bridge: BridgeSection {
                name: "ccu".into(),
                family: ProtocolFamily::Control,
                // The byte-stream link is attached directly in the test; the
                // configured transport only has to bind something harmless.
                transport: TransportConfig::Udp { bind: "127.0.0.1:0".parse().unwrap() },
                channels: ChannelsConfig {
                    command: "127.0.0.1:0".parse().unwrap(),
                    telemetry: "127.0.0.1:0".parse().unwrap(),
                },
            },
        }
    }

    async fn recv_envelope(feed: &mut SubEndpoint) -> Envelope {
        timeout(Duration::from_secs(2), async {
            feed.ready().await;
            feed.try_next().unwrap()
        })
        .await
        .expect("telemetry within deadline")
    }

    #[tokio::test]
    async fn serial_bridge_decodes_and_replies() {
        let mut dispatcher = Dispatcher::new(serial_test_config());
        dispatcher.create_sessions().await.unwrap();

        let (link, mut obis) = tokio::io::duplex(1024);
        dispatcher.attach_byte_stream(Box::new(link), "duplex", 57_600);

        let telemetry_addr = dispatcher.telemetry_addr().unwrap();
        let command_addr = dispatcher.command_addr().unwrap();
        let handle = dispatcher.handle();
        let bridge = tokio::spawn(async move { dispatcher.run().await });

        let mut feed = SubEndpoint::connect(telemetry_addr).await.unwrap();
        let commander = PubEndpoint::connect(command_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // OBIS asks for status, dripped in two chunks within the inter-byte
        // window; the quiet gap afterwards closes the frame.
        let request = CcuRequest::new(CcuKind::Status);
        let blob = request.encode().unwrap();
        obis.write_all(&blob[..2]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        obis.write_all(&blob[2..]).await.unwrap();

        let envelope = recv_envelope(&mut feed).await;
        assert_eq!(envelope.topic, "ccu/tlm");
        assert_eq!(envelope.message, Message::CcuRequest(request));

        // The scenario side answers; the reply appears on the link encoded.
        let reply = CcuReply::new(12, CcuKind::Status, vec![0; 16]);
        commander
            .publish(&Envelope::new("ccu/cmd", Message::CcuReply(reply.clone())))
            .unwrap();
        let expected = reply.encode().unwrap();
        let mut wire = vec![0u8; expected.len()];
        timeout(Duration::from_secs(2), obis.read_exact(&mut wire))
            .await
            .expect("reply within deadline")
            .unwrap();
        assert_eq!(wire, expected);

        handle.stop();
        assert!(bridge.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn bad_frame_is_dropped_without_killing_the_session() {
        let mut dispatcher = Dispatcher::new(serial_test_config());
        dispatcher.create_sessions().await.unwrap();

        let (link, mut obis) = tokio::io::duplex(1024);
        dispatcher.attach_byte_stream(Box::new(link), "duplex", 57_600);

        let telemetry_addr = dispatcher.telemetry_addr().unwrap();
        let handle = dispatcher.handle();
        let bridge = tokio::spawn(async move { dispatcher.run().await });

        let mut feed = SubEndpoint::connect(telemetry_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A corrupted frame first, then silence, then a valid one.
        let mut bad = CcuRequest::new(CcuKind::Time).encode().unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        obis.write_all(&bad).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let good = CcuRequest::new(CcuKind::Events);
        obis.write_all(&good.encode().unwrap()).await.unwrap();

        let envelope = recv_envelope(&mut feed).await;
        assert_eq!(envelope.message, Message::CcuRequest(good));

        handle.stop();
        assert!(bridge.await.unwrap().is_ok());
    }
}
