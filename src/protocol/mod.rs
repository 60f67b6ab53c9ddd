//! Typed wire messages and their binary codecs.
//!
//! Two message families are bridged by the harness: the CCU control dialogue
//! ([`control`]) and PIAES telegrams ([`telegram`]). Both share the trailing
//! CRC-16 of [`crc`]. Which family a link speaks is fixed once at startup by
//! [`ProtocolFamily`]; decode dispatches on the closed tag set of that family.
//!
//! A checksum-valid blob with a tag outside the family's set is not a decode
//! failure. It becomes [`Message::Unsupported`] so one unknown message never
//! takes the bridge down.

pub mod control;
pub mod crc;
pub mod telegram;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::control::{CcuErrorCode, CcuKind, CcuReply, CcuRequest};
pub use self::telegram::{NodeAddr, Telegram, TelegramId};

use self::crc::{crc16, split_crc16};

/// A frame failed validation and was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("checksum mismatch: computed {computed:#06x}, received {received:#06x}")]
    ChecksumMismatch { computed: u16, received: u16 },
    #[error("declared {declared} payload bytes but only {available} present")]
    PayloadOverrun { declared: usize, available: usize },
    #[error("{len} bytes is too short for a {family} message")]
    ShortHeader { family: &'static str, len: usize },
}

/// A message could not be turned into wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("{family:?} link cannot carry message tag {tag:#06x}")]
    WrongFamily { family: ProtocolFamily, tag: u16 },
    #[error("unsupported sentinel cannot be re-encoded")]
    Unsupported,
    #[error("payload exceeds the {limit}-byte wire limit")]
    Oversize { limit: usize },
}

/// One message crossing the bridge, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    CcuRequest(CcuRequest),
    CcuReply(CcuReply),
    Telegram(Telegram),
    Unsupported(Unsupported),
}

/// Checksum-valid bytes carrying a tag no variant claims. The raw blob is kept
/// so consumers can record exactly what the system under test emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsupported {
    pub tag: u16,
    #[serde(with = "serde_bytes")]
    pub raw: Vec<u8>,
}

impl Message {
    pub(crate) fn unsupported(tag: u16, raw: &[u8]) -> Self {
        Message::Unsupported(Unsupported { tag, raw: raw.to_vec() })
    }

    /// The numeric tag callbacks key on. Unambiguous within one link's family
    /// and direction.
    pub fn tag(&self) -> u16 {
        match self {
            Message::CcuRequest(request) => u16::from(request.kind.tag()),
            Message::CcuReply(reply) => u16::from(reply.kind.tag()),
            Message::Telegram(telegram) => telegram.id.tag(),
            Message::Unsupported(unsupported) => unsupported.tag,
        }
    }
}

/// The wire dialect a bridged link speaks. Selected once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /// CCU control dialogue: inbound requests, outbound replies.
    Control,
    /// PIAES telegrams in both directions.
    Telegram,
}

impl ProtocolFamily {
    /// Decode one complete frame arriving from the system under test.
    pub fn decode(self, blob: &[u8]) -> Result<Message, FramingError> {
        match self {
            ProtocolFamily::Control => CcuRequest::decode(blob),
            ProtocolFamily::Telegram => Telegram::decode(blob),
        }
    }

    /// Encode a message for transmission to the system under test. The
    /// message must belong to this family.
    pub fn encode(self, message: &Message) -> Result<Vec<u8>, CodecError> {
        match (self, message) {
            (ProtocolFamily::Control, Message::CcuRequest(request)) => request.encode(),
            (ProtocolFamily::Control, Message::CcuReply(reply)) => reply.encode(),
            (ProtocolFamily::Telegram, Message::Telegram(telegram)) => telegram.encode(),
            (_, Message::Unsupported(_)) => Err(CodecError::Unsupported),
            (family, other) => Err(CodecError::WrongFamily { family, tag: other.tag() }),
        }
    }
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolFamily::Control => write!(f, "control"),
            ProtocolFamily::Telegram => write!(f, "telegram"),
        }
    }
}

/// Verify the trailing checksum and peel it off, leaving header+payload.
/// `min_header` is the family's fixed header size.
pub(crate) fn checked_body<'a>(
    family: &'static str,
    blob: &'a [u8],
    min_header: usize,
) -> Result<&'a [u8], FramingError> {
    let (body, received) =
        split_crc16(blob).ok_or(FramingError::ShortHeader { family, len: blob.len() })?;
    if body.len() < min_header {
        return Err(FramingError::ShortHeader { family, len: blob.len() });
    }
    let computed = crc16(body);
    if computed != received {
        return Err(FramingError::ChecksumMismatch { computed, received });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_dispatch_round_trip() {
        let reply = Message::CcuReply(CcuReply::new(4, CcuKind::Events, vec![0x05]));
        let blob = ProtocolFamily::Control.encode(&reply).unwrap();
        assert_eq!(CcuReply::decode(&blob).unwrap(), reply);

        let telegram = Message::Telegram(Telegram::request_dva());
        let blob = ProtocolFamily::Telegram.encode(&telegram).unwrap();
        assert_eq!(ProtocolFamily::Telegram.decode(&blob).unwrap(), telegram);
    }

    #[test]
    fn wrong_family_refused() {
        let telegram = Message::Telegram(Telegram::request_status());
        assert!(matches!(
            ProtocolFamily::Control.encode(&telegram),
            Err(CodecError::WrongFamily { family: ProtocolFamily::Control, tag: 17 })
        ));
    }

    #[test]
    fn unsupported_sentinel_never_reencodes() {
        let sentinel = Message::unsupported(0x99, &[0x99, 0x00]);
        assert!(matches!(
            ProtocolFamily::Control.encode(&sentinel),
            Err(CodecError::Unsupported)
        ));
    }

    #[test]
    fn envelope_json_round_trip() {
        // Messages travel the bus as JSON; payload bytes must survive.
        let message = Message::Telegram(Telegram::esd_text("Utrecht"));
        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}
