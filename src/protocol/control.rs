//! Control-port message family.
//!
//! The dialogue between the OBIS diagnostic box and the central control unit
//! (CCU) over the serial link. OBIS sends short tagged requests; the harness
//! answers with train-addressed replies.
//!
//! Request wire layout:
//!
//! ```text
//! | kind (1) | par_len (1) | params (par_len) | CRC-16 (2, lo first) |
//! ```
//!
//! Reply wire layout:
//!
//! ```text
//! | train_no (2, BE) | kind (1) | data_len (2, BE) | data | CRC-16 (2) |
//! ```

use bytes::Buf;
use serde::{Deserialize, Serialize};

use super::crc::append_crc16;
use super::{checked_body, CodecError, FramingError, Message};

/// Maximum request parameter block (length field is one byte).
pub const MAX_REQUEST_PARAMS: usize = u8::MAX as usize;

/// The closed set of request/reply kinds the CCU dialogue defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CcuKind {
    Status,
    Time,
    Counters,
    Fault,
    MonitorMcn,
    MonitorMt,
    Events,
    SetDestination,
    SwitchDiag,
    Error,
}

impl CcuKind {
    pub fn tag(self) -> u8 {
        match self {
            CcuKind::Status => 0x01,
            CcuKind::Time => 0x02,
            CcuKind::Counters => 0x03,
            CcuKind::Fault => 0x04,
            CcuKind::MonitorMcn => 0x05,
            CcuKind::MonitorMt => 0x06,
            CcuKind::Events => 0x07,
            CcuKind::SetDestination => 0x08,
            CcuKind::SwitchDiag => 0x09,
            CcuKind::Error => 0xFF,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(CcuKind::Status),
            0x02 => Some(CcuKind::Time),
            0x03 => Some(CcuKind::Counters),
            0x04 => Some(CcuKind::Fault),
            0x05 => Some(CcuKind::MonitorMcn),
            0x06 => Some(CcuKind::MonitorMt),
            0x07 => Some(CcuKind::Events),
            0x08 => Some(CcuKind::SetDestination),
            0x09 => Some(CcuKind::SwitchDiag),
            0xFF => Some(CcuKind::Error),
            _ => None,
        }
    }
}

/// Error codes carried in the data field of a [`CcuKind::Error`] reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CcuErrorCode {
    BadMessage,
    BadParams,
    BadMeasuringPoint,
    NotMaster,
    CcuFailure,
    BadTime,
}

impl CcuErrorCode {
    pub fn code(self) -> u8 {
        match self {
            CcuErrorCode::BadMessage => 0x01,
            CcuErrorCode::BadParams => 0x02,
            CcuErrorCode::BadMeasuringPoint => 0x03,
            CcuErrorCode::NotMaster => 0x04,
            CcuErrorCode::CcuFailure => 0x05,
            CcuErrorCode::BadTime => 0x06,
        }
    }
}

/// A request from OBIS to the CCU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcuRequest {
    pub kind: CcuKind,
    #[serde(with = "serde_bytes")]
    pub params: Vec<u8>,
}

impl CcuRequest {
    pub fn new(kind: CcuKind) -> Self {
        Self { kind, params: Vec::new() }
    }

    /// Encode to wire bytes. The length field and checksum are derived from
    /// the parameter block as it is now.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.params.len() > MAX_REQUEST_PARAMS {
            return Err(CodecError::Oversize { limit: MAX_REQUEST_PARAMS });
        }
        let mut blob = Vec::with_capacity(4 + self.params.len());
        blob.push(self.kind.tag());
        blob.push(self.params.len() as u8);
        blob.extend_from_slice(&self.params);
        append_crc16(&mut blob);
        Ok(blob)
    }

    /// Decode a request blob. An unrecognized kind tag on a checksum-valid
    /// blob is not an error; it decodes to [`Message::Unsupported`].
    pub fn decode(blob: &[u8]) -> Result<Message, FramingError> {
        let body = checked_body("ccu-request", blob, 2)?;
        let mut buf = body;
        let tag = buf.get_u8();
        let par_len = buf.get_u8() as usize;
        if par_len > buf.remaining() {
            return Err(FramingError::PayloadOverrun {
                declared: par_len,
                available: buf.remaining(),
            });
        }
        let params = buf[..par_len].to_vec();
        match CcuKind::from_tag(tag) {
            Some(kind) => Ok(Message::CcuRequest(CcuRequest { kind, params })),
            None => Ok(Message::unsupported(u16::from(tag), blob)),
        }
    }
}

/// A reply from the CCU to OBIS, addressed by train number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcuReply {
    pub train_no: u16,
    pub kind: CcuKind,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl CcuReply {
    pub fn new(train_no: u16, kind: CcuKind, data: Vec<u8>) -> Self {
        Self { train_no, kind, data }
    }

    /// The standard error reply for an unknown or malformed request.
    pub fn error(train_no: u16, code: CcuErrorCode) -> Self {
        Self::new(train_no, CcuKind::Error, vec![code.code()])
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.data.len() > u16::MAX as usize {
            return Err(CodecError::Oversize { limit: u16::MAX as usize });
        }
        let mut blob = Vec::with_capacity(7 + self.data.len());
        blob.extend_from_slice(&self.train_no.to_be_bytes());
        blob.push(self.kind.tag());
        blob.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        blob.extend_from_slice(&self.data);
        append_crc16(&mut blob);
        Ok(blob)
    }

    pub fn decode(blob: &[u8]) -> Result<Message, FramingError> {
        let body = checked_body("ccu-reply", blob, 5)?;
        let mut buf = body;
        let train_no = buf.get_u16();
        let tag = buf.get_u8();
        let data_len = buf.get_u16() as usize;
        if data_len > buf.remaining() {
            return Err(FramingError::PayloadOverrun {
                declared: data_len,
                available: buf.remaining(),
            });
        }
        let data = buf[..data_len].to_vec();
        match CcuKind::from_tag(tag) {
            Some(kind) => Ok(Message::CcuReply(CcuReply { train_no, kind, data })),
            None => Ok(Message::unsupported(u16::from(tag), blob)),
        }
    }

    /// Failure count reported by a Status reply.
    pub fn status_error_count(&self) -> Option<u16> {
        self.status_field(6)
    }

    /// Pending event count reported by a Status reply.
    pub fn status_event_count(&self) -> Option<u16> {
        self.status_field(8)
    }

    /// Software version reported by a Status reply.
    pub fn status_software_version(&self) -> Option<u16> {
        self.status_field(10)
    }

    fn status_field(&self, offset: usize) -> Option<u16> {
        if self.kind != CcuKind::Status || self.data.len() < offset + 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.data[offset], self.data[offset + 1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let request = CcuRequest { kind: CcuKind::MonitorMt, params: vec![0x10, 0x22] };
        let blob = request.encode().unwrap();
        assert_eq!(blob[0], 0x06);
        assert_eq!(blob[1], 2);
        assert_eq!(CcuRequest::decode(&blob).unwrap(), Message::CcuRequest(request));
    }

    #[test]
    fn reply_round_trip() {
        let reply = CcuReply::new(0x2304, CcuKind::Time, vec![26, 8, 6, 12, 30, 0]);
        let blob = reply.encode().unwrap();
        assert_eq!(&blob[0..2], &[0x23, 0x04]);
        assert_eq!(blob[2], 0x02);
        assert_eq!(&blob[3..5], &[0x00, 0x06]);
        assert_eq!(CcuReply::decode(&blob).unwrap(), Message::CcuReply(reply));
    }

    #[test]
    fn encode_derives_length_from_params() {
        // A stale length byte cannot exist in the typed form; the wire length
        // always tracks the actual parameter block.
        let mut request = CcuRequest::new(CcuKind::SetDestination);
        request.params = vec![b'A'; 17];
        let blob = request.encode().unwrap();
        assert_eq!(blob[1], 17);
        assert_eq!(blob.len(), 2 + 17 + 2);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let blob = CcuRequest::new(CcuKind::Status).encode().unwrap();
        for i in 0..blob.len() {
            let mut bad = blob.clone();
            bad[i] ^= 0x40;
            match CcuRequest::decode(&bad) {
                Err(FramingError::ChecksumMismatch { .. }) => {}
                Err(FramingError::PayloadOverrun { .. }) if i == 1 => {
                    // Flipping the length byte may also overrun the payload.
                }
                other => panic!("byte {} corruption not caught: {:?}", i, other),
            }
        }
    }

    #[test]
    fn declared_length_beyond_blob_is_rejected() {
        let mut blob = vec![0x01, 0x09, 0xAA];
        append_crc16(&mut blob);
        assert!(matches!(
            CcuRequest::decode(&blob),
            Err(FramingError::PayloadOverrun { declared: 9, available: 1 })
        ));
    }

    #[test]
    fn unknown_tag_decodes_to_unsupported() {
        let mut blob = vec![0x7E, 0x00];
        append_crc16(&mut blob);
        match CcuRequest::decode(&blob).unwrap() {
            Message::Unsupported(unsupported) => {
                assert_eq!(unsupported.tag, 0x7E);
                assert_eq!(unsupported.raw, blob);
            }
            other => panic!("expected unsupported sentinel, got {:?}", other),
        }
    }

    #[test]
    fn oversize_params_refused() {
        let request = CcuRequest { kind: CcuKind::Events, params: vec![0; 256] };
        assert!(matches!(request.encode(), Err(CodecError::Oversize { limit: 255 })));
    }

    #[test]
    fn status_reply_accessors() {
        let mut data = vec![0u8; 16];
        data[6] = 0x00;
        data[7] = 0x03; // three failures
        data[8] = 0x00;
        data[9] = 0x28; // forty events
        data[10] = 0x01;
        data[11] = 0x42; // version 0x0142
        let reply = CcuReply::new(12, CcuKind::Status, data);
        assert_eq!(reply.status_error_count(), Some(3));
        assert_eq!(reply.status_event_count(), Some(40));
        assert_eq!(reply.status_software_version(), Some(0x0142));

        let time = CcuReply::new(12, CcuKind::Time, vec![0; 16]);
        assert_eq!(time.status_error_count(), None);
    }

    #[test]
    fn error_reply_carries_code() {
        let reply = CcuReply::error(7, CcuErrorCode::BadParams);
        assert_eq!(reply.kind, CcuKind::Error);
        assert_eq!(reply.data, vec![0x02]);
    }
}
