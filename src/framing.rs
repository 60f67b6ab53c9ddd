//! Frame boundary detection for the bridged transports.
//!
//! Record transports (TCP in the deployments we bridge, UDP) deliver one
//! candidate frame per read. The serial byte-stream has no out-of-band
//! delimiter and the length field sits inside the blob, unusable until the
//! blob is complete, so inter-character silence is the only boundary signal:
//! while bytes keep arriving within one character period (rounded up) the
//! frame is still open; a longer gap closes it.
//!
//! The assembler is a pure state machine. Time is passed in by the caller, so
//! the gap logic is testable without a clock.

use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use tracing::warn;

use crate::session::SessionId;

/// Upper bound on one reassembled frame, matching the largest read the
/// bridged systems perform.
pub const MAX_FRAME_LEN: usize = 2048;

/// Poll timeout while no frame is being accumulated.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// One complete message blob as read off a link, before decode. Consumed
/// immediately by the codec, never retained.
#[derive(Debug)]
pub struct Frame {
    pub bytes: Vec<u8>,
    pub session: SessionId,
    pub received_at: Instant,
}

/// How a transport marks frame boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// One read yields one candidate frame (stream/datagram records).
    Delimited,
    /// No delimiter; frames close on inter-byte silence.
    ByteStream { inter_byte: Duration },
}

/// Compute the inter-byte timeout for a serial link: one 10-bit character
/// period at `baud`, rounded up to the next 10 ms step.
pub fn inter_byte_timeout(baud: u32) -> Duration {
    let char_period_us = 10_000_000u64 / u64::from(baud.max(1));
    let steps = char_period_us / 10_000 + 1;
    Duration::from_millis(steps * 10)
}

#[derive(Debug)]
enum AssemblyState {
    Idle,
    Accumulating {
        buf: ArrayVec<u8, MAX_FRAME_LEN>,
        deadline: Instant,
    },
}

/// Reassembles complete frames from the bytes a transport delivers.
#[derive(Debug)]
pub struct FrameAssembler {
    discipline: Discipline,
    state: AssemblyState,
}

impl FrameAssembler {
    pub fn delimited() -> Self {
        Self { discipline: Discipline::Delimited, state: AssemblyState::Idle }
    }

    pub fn byte_stream(baud: u32) -> Self {
        Self {
            discipline: Discipline::ByteStream { inter_byte: inter_byte_timeout(baud) },
            state: AssemblyState::Idle,
        }
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Feed bytes read from the link at time `now`. Returns any frames that
    /// completed: for a delimited transport the chunk itself; for a byte
    /// stream, a previously buffered frame whose gap elapsed before this read,
    /// or a frame closed early because the buffer reached capacity.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Vec<Vec<u8>> {
        match self.discipline {
            Discipline::Delimited => vec![bytes.to_vec()],
            Discipline::ByteStream { inter_byte } => {
                let mut complete = Vec::new();
                if let AssemblyState::Accumulating { deadline, .. } = &self.state {
                    if now >= *deadline {
                        // The quiet gap passed before this read was seen.
                        if let Some(frame) = self.take_buffer() {
                            complete.push(frame);
                        }
                    }
                }
                let mut rest = bytes;
                while !rest.is_empty() {
                    if matches!(self.state, AssemblyState::Idle) {
                        self.state = AssemblyState::Accumulating {
                            buf: ArrayVec::new(),
                            deadline: now + inter_byte,
                        };
                    }
                    if let AssemblyState::Accumulating { buf, .. } = &mut self.state {
                        let take = buf.remaining_capacity().min(rest.len());
                        let _ = buf.try_extend_from_slice(&rest[..take]);
                        rest = &rest[take..];
                    }
                    if !rest.is_empty() {
                        warn!(len = MAX_FRAME_LEN, "frame buffer full, closing frame early");
                        if let Some(frame) = self.take_buffer() {
                            complete.push(frame);
                        }
                    }
                }
                if let AssemblyState::Accumulating { deadline, .. } = &mut self.state {
                    *deadline = now + inter_byte;
                }
                complete
            }
        }
    }

    /// The wait budget for the next multiplexer pass: the remaining inter-byte
    /// window while a frame is open, the long idle timeout otherwise.
    pub fn poll_timeout(&self, now: Instant) -> Duration {
        match &self.state {
            AssemblyState::Idle => IDLE_TIMEOUT,
            AssemblyState::Accumulating { deadline, .. } => {
                deadline.saturating_duration_since(now)
            }
        }
    }

    /// Called when the multiplexer wait expired with no new bytes. Emits the
    /// buffered blob as one frame if its quiet gap has elapsed.
    pub fn on_timeout(&mut self, now: Instant) -> Option<Vec<u8>> {
        match &self.state {
            AssemblyState::Accumulating { deadline, .. } if now >= *deadline => {
                self.take_buffer()
            }
            _ => None,
        }
    }

    /// Discard any partial frame (session teardown).
    pub fn clear(&mut self) {
        self.state = AssemblyState::Idle;
    }

    fn take_buffer(&mut self) -> Option<Vec<u8>> {
        match std::mem::replace(&mut self.state, AssemblyState::Idle) {
            AssemblyState::Accumulating { buf, .. } if !buf.is_empty() => {
                Some(buf.to_vec())
            }
            _ => None,
        }
    }
}
