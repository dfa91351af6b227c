//! Message envelope, system tags, and the user-tag registry.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{CommError, Result};

/// Fixed envelope prepended to every message, little-endian packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Per-class tag from the registry; high byte is the schema version.
    pub user_tag: u64,
    /// One of the [`SystemTag`] values.
    pub system_tag: u64,
    /// Payload length in bytes.
    pub user_msg_size: u64,
    /// Destination rank.
    pub dst: i64,
    /// Source rank.
    pub src: i64,
}

/// Serialized size of [`Envelope`].
pub const ENVELOPE_SIZE: usize = 40;

/// High-level message classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SystemTag {
    /// Used internally by the tracing framework (commands).
    ControlSystem = 0x8,
    /// Application-level payload (ray batches).
    ControlUser = 0x9,
    /// Termination-vote traffic, dispatched straight into the voter.
    ControlVote = 0xA,
}

impl SystemTag {
    fn from_u64(v: u64) -> Result<Self> {
        match v {
            0x8 => Ok(SystemTag::ControlSystem),
            0x9 => Ok(SystemTag::ControlUser),
            0xA => Ok(SystemTag::ControlVote),
            other => Err(CommError::Malformed(format!("unknown system tag {other:#x}"))),
        }
    }
}

/// Wire schema version for the packed ray struct, carried in the high
/// byte of every user tag so peers can detect drift.
pub const RAY_SCHEMA_VERSION: u8 = 1;

static NEXT_USER_TAG: AtomicU64 = AtomicU64::new(1);

/// Allocate a unique positive user tag for a message class.
///
/// Called once per class at first use (each class caches its tag in a
/// `OnceLock`); ids are process-wide and never reused.
pub fn register_message_class() -> u64 {
    let id = NEXT_USER_TAG.fetch_add(1, Ordering::Relaxed);
    ((RAY_SCHEMA_VERSION as u64) << 56) | id
}

/// A concrete message class: payload codec plus its tags.
pub trait Work: Sized {
    /// The class's registered user tag.
    fn user_tag() -> u64;
    /// System-level classification.
    fn system_tag() -> SystemTag;
    /// Serialize the payload, little-endian packed.
    fn encode_payload(&self) -> Vec<u8>;
    /// Deserialize the payload.
    fn decode_payload(bytes: &[u8]) -> Result<Self>;
}

/// An envelope with its payload, as read off or written to the wire.
#[derive(Debug, Clone)]
pub struct Message {
    /// The header.
    pub envelope: Envelope,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Wrap a work item for the wire.
    pub fn pack<W: Work>(work: &W, src: i32, dst: i32) -> Self {
        let payload = work.encode_payload();
        Self {
            envelope: Envelope {
                user_tag: W::user_tag(),
                system_tag: W::system_tag() as u64,
                user_msg_size: payload.len() as u64,
                dst: dst as i64,
                src: src as i64,
            },
            payload,
        }
    }

    /// Decode the payload back into a work item.
    ///
    /// Fails when the message belongs to a different class (tag
    /// mismatch) or the payload is corrupt.
    pub fn unpack<W: Work>(&self) -> Result<W> {
        if self.envelope.user_tag != W::user_tag() {
            return Err(CommError::Malformed(format!(
                "user tag mismatch: got {:#x}, want {:#x}",
                self.envelope.user_tag,
                W::user_tag()
            )));
        }
        W::decode_payload(&self.payload)
    }

    /// The system tag, validated.
    pub fn system_tag(&self) -> Result<SystemTag> {
        SystemTag::from_u64(self.envelope.system_tag)
    }

    /// Serialize envelope + payload into one frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_SIZE + self.payload.len());
        out.extend_from_slice(&self.envelope.user_tag.to_le_bytes());
        out.extend_from_slice(&self.envelope.system_tag.to_le_bytes());
        out.extend_from_slice(&self.envelope.user_msg_size.to_le_bytes());
        out.extend_from_slice(&self.envelope.dst.to_le_bytes());
        out.extend_from_slice(&self.envelope.src.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse one frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENVELOPE_SIZE {
            return Err(CommError::Malformed(format!(
                "frame shorter than envelope: {} bytes",
                bytes.len()
            )));
        }
        let u64_at = |off: usize| {
            u64::from_le_bytes(bytes[off..off + 8].try_into().expect("8-byte slice"))
        };
        let envelope = Envelope {
            user_tag: u64_at(0),
            system_tag: u64_at(8),
            user_msg_size: u64_at(16),
            dst: u64_at(24) as i64,
            src: u64_at(32) as i64,
        };
        let payload = bytes[ENVELOPE_SIZE..].to_vec();
        if payload.len() as u64 != envelope.user_msg_size {
            return Err(CommError::Malformed(format!(
                "payload size {} does not match header {}",
                payload.len(),
                envelope.user_msg_size
            )));
        }
        Ok(Self { envelope, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(u32);

    impl Work for Ping {
        fn user_tag() -> u64 {
            static TAG: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
            *TAG.get_or_init(register_message_class)
        }
        fn system_tag() -> SystemTag {
            SystemTag::ControlUser
        }
        fn encode_payload(&self) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }
        fn decode_payload(bytes: &[u8]) -> Result<Self> {
            let raw = bytes
                .try_into()
                .map_err(|_| CommError::Malformed("ping payload".into()))?;
            Ok(Ping(u32::from_le_bytes(raw)))
        }
    }

    #[test]
    fn test_registry_tags_are_unique_and_versioned() {
        let a = register_message_class();
        let b = register_message_class();
        assert_ne!(a, b);
        assert_eq!(a >> 56, RAY_SCHEMA_VERSION as u64);
        assert_eq!(b >> 56, RAY_SCHEMA_VERSION as u64);
    }

    #[test]
    fn test_frame_round_trip() {
        let msg = Message::pack(&Ping(0xDEAD), 2, 5);
        let frame = msg.encode();
        assert_eq!(frame.len(), ENVELOPE_SIZE + 4);
        let back = Message::decode(&frame).unwrap();
        assert_eq!(back.envelope, msg.envelope);
        assert_eq!(back.envelope.src, 2);
        assert_eq!(back.envelope.dst, 5);
        let ping: Ping = back.unpack().unwrap();
        assert_eq!(ping.0, 0xDEAD);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let msg = Message::pack(&Ping(1), 0, 1);
        let mut frame = msg.encode();
        frame.pop();
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn test_short_envelope_rejected() {
        assert!(Message::decode(&[0u8; 10]).is_err());
    }
}
