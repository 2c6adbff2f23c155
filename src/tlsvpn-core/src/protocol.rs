//! Framed message protocol spoken over the TLS tunnel.
//!
//! Wire format, big-endian:
//!
//! ```text
//! kind:u8 | length:u32 | sequence:u32 | checksum:u32 | payload[length]
//! ```
//!
//! A checksum of 0 means "not checked"; it is legal for empty payloads and
//! for Heartbeat/IpAssignment frames. Everything else carries CRC-32/IEEE of
//! the payload. Heartbeat and IpAssignment always travel with sequence 0 and
//! bypass the receive-sequence discipline: heartbeats must stay valid after
//! the data stream has advanced, and IpAssignment is the first frame on the
//! wire with no prior baseline.

use std::sync::Mutex;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 13;

/// Largest accepted payload.
pub const MAX_PAYLOAD: u32 = 65535;

/// Protocol faults. All of these are session-fatal for the connection that
/// produced them; none are fatal for the server as a whole.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("short read: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch: computed {computed}, received {received}")]
    ChecksumMismatch { computed: u32, received: u32 },

    #[error("replay detected: expected sequence >= {expected}, received {received}")]
    Replay { expected: u32, received: u32 },
}

/// Message kinds. Kind 3 (`Auth`) is reserved: it is decoded without error
/// but never produced, and receivers treat it as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Data,
    Heartbeat,
    IpAssignment,
    Auth,
    Control,
    Unknown(u8),
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => MessageKind::Data,
            1 => MessageKind::Heartbeat,
            2 => MessageKind::IpAssignment,
            3 => MessageKind::Auth,
            4 => MessageKind::Control,
            other => MessageKind::Unknown(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            MessageKind::Data => 0,
            MessageKind::Heartbeat => 1,
            MessageKind::IpAssignment => 2,
            MessageKind::Auth => 3,
            MessageKind::Control => 4,
            MessageKind::Unknown(b) => *b,
        }
    }

    /// Heartbeat and IpAssignment bypass sequence checking.
    pub fn bypasses_sequence(&self) -> bool {
        matches!(self, MessageKind::Heartbeat | MessageKind::IpAssignment)
    }
}

/// One framed message.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub sequence: u32,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a Data frame. Non-empty payloads get a CRC.
    pub fn data(sequence: u32, payload: Vec<u8>) -> Self {
        let checksum = payload_checksum(&payload);
        Self {
            kind: MessageKind::Data,
            sequence,
            checksum,
            payload,
        }
    }

    /// Build a Control frame carrying a JSON payload. Non-empty payloads get
    /// a CRC.
    pub fn control(sequence: u32, payload: Vec<u8>) -> Self {
        let checksum = payload_checksum(&payload);
        Self {
            kind: MessageKind::Control,
            sequence,
            checksum,
            payload,
        }
    }

    /// Build a zero-payload Heartbeat frame (sequence 0, checksum 0).
    pub fn heartbeat() -> Self {
        Self {
            kind: MessageKind::Heartbeat,
            sequence: 0,
            checksum: 0,
            payload: Vec::new(),
        }
    }

    /// Build the IpAssignment frame: sequence 0, payload = 4-byte IPv4.
    pub fn ip_assignment(ip: std::net::Ipv4Addr) -> Self {
        Self {
            kind: MessageKind::IpAssignment,
            sequence: 0,
            checksum: 0,
            payload: ip.octets().to_vec(),
        }
    }

    /// Serialize into the 13-byte-header wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Verify the carried CRC when one is present. A zero checksum is
    /// "not checked" and always passes.
    pub fn verify_checksum(&self) -> Result<(), ProtocolError> {
        if self.checksum == 0 || self.payload.is_empty() {
            return Ok(());
        }
        let computed = crc32fast::hash(&self.payload);
        if computed != self.checksum {
            return Err(ProtocolError::ChecksumMismatch {
                computed,
                received: self.checksum,
            });
        }
        Ok(())
    }
}

/// CRC-32/IEEE of a payload; zero (unchecked) for empty payloads.
pub fn payload_checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        0
    } else {
        crc32fast::hash(payload)
    }
}

/// Read one message from the stream: exactly 13 header bytes, a length
/// check, then the payload. Sequence and CRC validation are the caller's
/// responsibility.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let kind = MessageKind::from_byte(header[0]);
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let sequence = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    let checksum = u32::from_be_bytes([header[9], header[10], header[11], header[12]]);

    if length > MAX_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length as usize];
    if length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok(Message {
        kind,
        sequence,
        checksum,
        payload,
    })
}

/// Monotonic send-sequence counter. The lock is held only across the
/// increment; the write itself happens outside it.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: Mutex<u32>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the new value: the first sequenced frame on a
    /// connection carries 1.
    pub fn next(&self) -> u32 {
        let mut guard = self.next.lock().expect("sequence counter poisoned");
        *guard = guard.wrapping_add(1);
        *guard
    }

    /// Restart from 0 for a fresh connection.
    pub fn reset(&self) {
        *self.next.lock().expect("sequence counter poisoned") = 0;
    }
}

/// Receive-sequence discipline shared by both endpoints.
///
/// Regressions are replays and abort the session. Jumps forward are logged
/// as message loss but accepted, and the counter snaps to the received
/// value.
#[derive(Debug, Default)]
pub struct RecvSequence {
    last: Mutex<u32>,
}

impl RecvSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self, kind: MessageKind, sequence: u32) -> Result<(), ProtocolError> {
        if kind.bypasses_sequence() {
            return Ok(());
        }
        let mut last = self.last.lock().expect("recv sequence poisoned");
        if sequence < *last {
            return Err(ProtocolError::Replay {
                expected: *last,
                received: sequence,
            });
        }
        if sequence > last.wrapping_add(1) && *last > 0 {
            warn!(
                expected = *last + 1,
                received = sequence,
                "sequence gap, messages lost"
            );
        }
        *last = sequence;
        Ok(())
    }

    pub fn last(&self) -> u32 {
        *self.last.lock().expect("recv sequence poisoned")
    }

    /// Restart from 0 for a fresh connection.
    pub fn reset(&self) {
        *self.last.lock().expect("recv sequence poisoned") = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(msg: Message) -> Message {
        let encoded = msg.encode();
        let mut cursor = std::io::Cursor::new(encoded);
        read_message(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn data_roundtrip_carries_crc() {
        let decoded = roundtrip(Message::data(7, b"ip packet bytes".to_vec())).await;
        assert_eq!(decoded.kind, MessageKind::Data);
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.checksum, crc32fast::hash(b"ip packet bytes"));
        assert_eq!(decoded.payload, b"ip packet bytes");
        decoded.verify_checksum().unwrap();
    }

    #[tokio::test]
    async fn heartbeat_roundtrip_is_unchecked() {
        let decoded = roundtrip(Message::heartbeat()).await;
        assert_eq!(decoded.kind, MessageKind::Heartbeat);
        assert_eq!(decoded.sequence, 0);
        assert_eq!(decoded.checksum, 0);
        assert!(decoded.payload.is_empty());
    }

    #[tokio::test]
    async fn ip_assignment_payload_is_four_octets() {
        let decoded = roundtrip(Message::ip_assignment("10.8.0.5".parse().unwrap())).await;
        assert_eq!(decoded.kind, MessageKind::IpAssignment);
        assert_eq!(decoded.payload, vec![10, 8, 0, 5]);
    }

    #[tokio::test]
    async fn control_empty_payload_has_zero_checksum() {
        let decoded = roundtrip(Message::control(3, Vec::new())).await;
        assert_eq!(decoded.checksum, 0);
        decoded.verify_checksum().unwrap();
    }

    #[tokio::test]
    async fn reserved_auth_kind_decodes() {
        let msg = Message {
            kind: MessageKind::Auth,
            sequence: 1,
            checksum: 0,
            payload: Vec::new(),
        };
        let decoded = roundtrip(msg).await;
        assert_eq!(decoded.kind, MessageKind::Auth);
    }

    #[tokio::test]
    async fn unknown_kind_roundtrips_raw_byte() {
        let msg = Message {
            kind: MessageKind::Unknown(0x7f),
            sequence: 0,
            checksum: 0,
            payload: Vec::new(),
        };
        let decoded = roundtrip(msg).await;
        assert_eq!(decoded.kind, MessageKind::Unknown(0x7f));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let mut header = [0u8; HEADER_LEN];
        header[0] = 0;
        header[1..5].copy_from_slice(&(MAX_PAYLOAD + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(header.to_vec());
        match read_message(&mut cursor).await {
            Err(ProtocolError::FrameTooLarge(n)) => assert_eq!(n, MAX_PAYLOAD + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_header_is_short_read() {
        let mut cursor = std::io::Cursor::new(vec![0u8; 5]);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[tokio::test]
    async fn truncated_payload_is_short_read() {
        let mut encoded = Message::data(0, vec![1, 2, 3, 4]).encode();
        encoded.truncate(encoded.len() - 2);
        let mut cursor = std::io::Cursor::new(encoded);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut msg = Message::data(0, b"original".to_vec());
        msg.payload[0] ^= 0xff;
        assert!(matches!(
            msg.verify_checksum(),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn sequence_counter_is_monotonic_from_one() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.next(), 3);
        counter.reset();
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn recv_rejects_regress_accepts_equal_and_forward() {
        let recv = RecvSequence::new();
        recv.validate(MessageKind::Data, 5).unwrap();
        assert_eq!(recv.last(), 5);

        // Equal does not advance but succeeds.
        recv.validate(MessageKind::Data, 5).unwrap();
        assert_eq!(recv.last(), 5);

        // Forward jump is accepted and snaps the counter.
        recv.validate(MessageKind::Control, 9).unwrap();
        assert_eq!(recv.last(), 9);

        // Regress is a replay.
        assert!(matches!(
            recv.validate(MessageKind::Data, 4),
            Err(ProtocolError::Replay {
                expected: 9,
                received: 4
            })
        ));
    }

    #[test]
    fn heartbeat_bypasses_sequence_check() {
        let recv = RecvSequence::new();
        recv.validate(MessageKind::Data, 100).unwrap();
        // A heartbeat with sequence 0 after the stream advanced is fine.
        recv.validate(MessageKind::Heartbeat, 0).unwrap();
        recv.validate(MessageKind::IpAssignment, 0).unwrap();
        assert_eq!(recv.last(), 100);
    }
}
