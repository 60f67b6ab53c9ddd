//! PIAES telegram family.
//!
//! Routed telegrams exchanged between OBIS and the passenger-information
//! system (PIAES) over the stream link. Every telegram carries explicit
//! source/destination node addresses and an optional via-node.
//!
//! Wire layout:
//!
//! ```text
//! | src (2) | via (2) | dst (2) | data_length (2, BE) | id (2, BE) | body | CRC-16 (2) |
//! ```

use bytes::Buf;
use serde::{Deserialize, Serialize};

use super::crc::append_crc16;
use super::{checked_body, CodecError, FramingError, Message};

/// Two-character node address used in telegram routing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub [u8; 2]);

impl NodeAddr {
    /// The onboard control system.
    pub const OBIS: NodeAddr = NodeAddr(*b"OB");
    /// The passenger-information system.
    pub const PIAES: NodeAddr = NodeAddr(*b"PI");
    /// Placeholder for the unused via-node field.
    pub const NONE: NodeAddr = NodeAddr(*b"NO");
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// The closed set of telegram ids in use on the PIAES link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelegramId {
    RequestDva,
    EndOfDva,
    RequestEsdObis,
    EsdText,
    ResponseDva,
    ResponseEsdObis,
    ResponseEndOfDva,
    ResponseEsdText,
    RequestStatus,
    ResponseStatus,
    RequestVersion,
    ResponseVersion,
}

impl TelegramId {
    pub fn tag(self) -> u16 {
        match self {
            TelegramId::RequestDva => 3,
            TelegramId::EndOfDva => 4,
            TelegramId::RequestEsdObis => 5,
            TelegramId::EsdText => 6,
            TelegramId::ResponseDva => 13,
            TelegramId::ResponseEsdObis => 14,
            TelegramId::ResponseEndOfDva => 15,
            TelegramId::ResponseEsdText => 16,
            TelegramId::RequestStatus => 17,
            TelegramId::ResponseStatus => 18,
            TelegramId::RequestVersion => 19,
            TelegramId::ResponseVersion => 20,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            3 => Some(TelegramId::RequestDva),
            4 => Some(TelegramId::EndOfDva),
            5 => Some(TelegramId::RequestEsdObis),
            6 => Some(TelegramId::EsdText),
            13 => Some(TelegramId::ResponseDva),
            14 => Some(TelegramId::ResponseEsdObis),
            15 => Some(TelegramId::ResponseEndOfDva),
            16 => Some(TelegramId::ResponseEsdText),
            17 => Some(TelegramId::RequestStatus),
            18 => Some(TelegramId::ResponseStatus),
            19 => Some(TelegramId::RequestVersion),
            20 => Some(TelegramId::ResponseVersion),
            _ => None,
        }
    }
}

/// A routed telegram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telegram {
    pub source: NodeAddr,
    pub through: NodeAddr,
    pub destination: NodeAddr,
    pub id: TelegramId,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Telegram {
    /// A telegram from OBIS to PIAES.
    pub fn from_obis(id: TelegramId, body: Vec<u8>) -> Self {
        Self {
            source: NodeAddr::OBIS,
            through: NodeAddr::NONE,
            destination: NodeAddr::PIAES,
            id,
            body,
        }
    }

    /// A telegram from PIAES to OBIS.
    pub fn from_piaes(id: TelegramId, body: Vec<u8>) -> Self {
        Self {
            source: NodeAddr::PIAES,
            through: NodeAddr::NONE,
            destination: NodeAddr::OBIS,
            id,
            body,
        }
    }

    /// OBIS asks for use of the voice announcement channel.
    pub fn request_dva() -> Self {
        Self::from_obis(TelegramId::RequestDva, b"<request_DVA>1</request_DVA>".to_vec())
    }

    /// Grant or deny the voice announcement channel.
    pub fn response_dva(available: bool) -> Self {
        let body = if available {
            b"<response_DVA>1</response_DVA>".to_vec()
        } else {
            b"<response_DVA>0</response_DVA>".to_vec()
        };
        Self::from_piaes(TelegramId::ResponseDva, body)
    }

    /// OBIS releases the voice announcement channel.
    pub fn end_of_dva() -> Self {
        Self::from_obis(TelegramId::EndOfDva, b"<end_of_DVA>1</end_of_DVA>".to_vec())
    }

    /// Acknowledge the voice announcement release.
    pub fn response_end_of_dva() -> Self {
        Self::from_piaes(TelegramId::ResponseEndOfDva, Vec::new())
    }

    /// OBIS asks for control over the text display.
    pub fn request_esd_obis() -> Self {
        Self::from_obis(TelegramId::RequestEsdObis, Vec::new())
    }

    /// Grant or deny control over the text display.
    pub fn response_esd_obis(available: bool) -> Self {
        let body = if available {
            b"<response_ESD_OBIS>1</response_ESD_OBIS>".to_vec()
        } else {
            b"<response_ESD_OBIS>0</response_ESD_OBIS>".to_vec()
        };
        Self::from_piaes(TelegramId::ResponseEsdObis, body)
    }

    /// OBIS sets the destination text.
    pub fn esd_text(text: &str) -> Self {
        Self::from_obis(TelegramId::EsdText, text.as_bytes().to_vec())
    }

    /// Acknowledge the destination text.
    pub fn response_esd_text() -> Self {
        Self::from_piaes(TelegramId::ResponseEsdText, Vec::new())
    }

    pub fn request_status() -> Self {
        Self::from_obis(TelegramId::RequestStatus, Vec::new())
    }

    pub fn response_status(body: Vec<u8>) -> Self {
        Self::from_piaes(TelegramId::ResponseStatus, body)
    }

    pub fn request_version() -> Self {
        Self::from_obis(TelegramId::RequestVersion, Vec::new())
    }

    pub fn response_version(version: &str) -> Self {
        Self::from_piaes(TelegramId::ResponseVersion, version.as_bytes().to_vec())
    }

    /// Encode to wire bytes; length and checksum derived from the current
    /// body.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.body.len() > u16::MAX as usize {
            return Err(CodecError::Oversize { limit: u16::MAX as usize });
        }
        let mut blob = Vec::with_capacity(12 + self.body.len());
        blob.extend_from_slice(&self.source.0);
        blob.extend_from_slice(&self.through.0);
        blob.extend_from_slice(&self.destination.0);
        blob.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        blob.extend_from_slice(&self.id.tag().to_be_bytes());
        blob.extend_from_slice(&self.body);
        append_crc16(&mut blob);
        Ok(blob)
    }

    /// Decode a telegram blob. An unrecognized id on a checksum-valid blob
    /// decodes to [`Message::Unsupported`].
    pub fn decode(blob: &[u8]) -> Result<Message, FramingError> {
        let body = checked_body("telegram", blob, 10)?;
        let mut buf = body;
        let mut source = [0u8; 2];
        let mut through = [0u8; 2];
        let mut destination = [0u8; 2];
        buf.copy_to_slice(&mut source);
        buf.copy_to_slice(&mut through);
        buf.copy_to_slice(&mut destination);
        let data_length = buf.get_u16() as usize;
        let tag = buf.get_u16();
        if data_length > buf.remaining() {
            return Err(FramingError::PayloadOverrun {
                declared: data_length,
                available: buf.remaining(),
            });
        }
        let Some(id) = TelegramId::from_tag(tag) else {
            return Ok(Message::unsupported(tag, blob));
        };
        Ok(Message::Telegram(Telegram {
            source: NodeAddr(source),
            through: NodeAddr(through),
            destination: NodeAddr(destination),
            id,
            body: buf[..data_length].to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::crc::append_crc16;

    #[test]
    fn round_trip_with_body() {
        let telegram = Telegram::response_dva(true);
        let blob = telegram.encode().unwrap();
        assert_eq!(&blob[0..2], b"PI");
        assert_eq!(&blob[2..4], b"NO");
        assert_eq!(&blob[4..6], b"OB");
        assert_eq!(&blob[6..8], &[0x00, 30][..]);
        assert_eq!(&blob[8..10], &[0x00, 13][..]);
        assert_eq!(Telegram::decode(&blob).unwrap(), Message::Telegram(telegram));
    }

    #[test]
    fn round_trip_empty_body() {
        let telegram = Telegram::request_esd_obis();
        let blob = telegram.encode().unwrap();
        assert_eq!(blob.len(), 12);
        assert_eq!(Telegram::decode(&blob).unwrap(), Message::Telegram(telegram));
    }

    #[test]
    fn corruption_anywhere_is_rejected() {
        let blob = Telegram::esd_text("Amsterdam Centraal").encode().unwrap();
        for i in 0..blob.len() {
            let mut bad = blob.clone();
            bad[i] ^= 0x01;
            match Telegram::decode(&bad) {
                Err(FramingError::ChecksumMismatch { .. })
                | Err(FramingError::PayloadOverrun { .. }) => {}
                other => panic!("byte {} corruption not caught: {:?}", i, other),
            }
        }
    }

    #[test]
    fn unknown_id_decodes_to_unsupported() {
        let mut blob = Vec::new();
        blob.extend_from_slice(b"OBNOPI");
        blob.extend_from_slice(&0u16.to_be_bytes());
        blob.extend_from_slice(&9u16.to_be_bytes()); // id 9 is not implemented
        append_crc16(&mut blob);
        match Telegram::decode(&blob).unwrap() {
            Message::Unsupported(unsupported) => assert_eq!(unsupported.tag, 9),
            other => panic!("expected unsupported sentinel, got {:?}", other),
        }
    }

    #[test]
    fn declared_length_beyond_blob_is_rejected() {
        let mut blob = Vec::new();
        blob.extend_from_slice(b"OBNOPI");
        blob.extend_from_slice(&64u16.to_be_bytes());
        blob.extend_from_slice(&17u16.to_be_bytes());
        append_crc16(&mut blob);
        assert!(matches!(
            Telegram::decode(&blob),
            Err(FramingError::PayloadOverrun { declared: 64, available: 0 })
        ));
    }
}
