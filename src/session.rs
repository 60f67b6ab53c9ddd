//! One open link to the system under test.
//!
//! A session is owned by exactly one dispatcher. Its lifecycle is
//!
//! ```text
//! LISTENING --accept--> CONNECTED --empty read | I/O error--> CLOSED
//! ```
//!
//! `Closed` is terminal: the session's partial-frame buffer is cleared and its
//! registration dropped exactly once; a later accept creates a fresh session.

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::framing::{Frame, FrameAssembler};

/// Identity of a session within one dispatcher, carried on every [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Connected,
    Closed,
}

/// Any byte-stream link a session can own: a TCP stream, a serial device
/// node opened as a file, or an in-memory duplex in tests.
pub trait ByteLink: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteLink for T {}

/// A connected byte-stream link plus its frame reassembly state.
pub struct Session {
    id: SessionId,
    state: SessionState,
    peer: String,
    stream: Box<dyn ByteLink>,
    assembler: FrameAssembler,
}

impl Session {
    pub fn connected(
        id: SessionId,
        stream: Box<dyn ByteLink>,
        peer: String,
        assembler: FrameAssembler,
    ) -> Self {
        info!(%id, peer = %peer, "session connected");
        Self { id, state: SessionState::Connected, peer, stream, assembler }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn assembler_mut(&mut self) -> &mut FrameAssembler {
        &mut self.assembler
    }

    pub fn assembler(&self) -> &FrameAssembler {
        &self.assembler
    }

    /// Read whatever the link has. `Ok(0)` means the peer closed.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf).await
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Feed freshly read bytes through the assembler, tagging completed blobs
    /// with this session's identity.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Vec<Frame> {
        let id = self.id;
        self.assembler
            .feed(bytes, now)
            .into_iter()
            .map(|blob| Frame { bytes: blob, session: id, received_at: now })
            .collect()
    }

    /// Terminal transition. Clears the partial-frame buffer; the caller drops
    /// the session afterwards.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            info!(id = %self.id, peer = %self.peer, "session closed");
            self.state = SessionState::Closed;
            self.assembler.clear();
        }
    }
}
