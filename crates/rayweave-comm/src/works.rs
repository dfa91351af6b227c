//! Concrete message classes: ray batches, votes, commands.

use std::sync::OnceLock;

use rayweave_core::{Ray, RayVector, RAY_WIRE_SIZE};

use crate::message::{register_message_class, SystemTag, Work};
use crate::{CommError, Result};

/// Direction of a ray-batch exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferType {
    /// Batch of rays for the receiver's queues.
    Request = 0,
    /// Acknowledgement for a previously received batch.
    Grant = 1,
}

/// A batch of rays moving to the rank that owns their next instance,
/// or the acknowledgement flowing back.
///
/// Wire layout: `transfer_type: u8, sender: i32, instance: i32,
/// num_rays: u32`, then `num_rays` packed ray structs (`Request` only).
#[derive(Debug, Clone)]
pub struct RemoteRays {
    /// Request or grant.
    pub transfer_type: TransferType,
    /// Originating rank.
    pub sender: i32,
    /// Destination instance for the rays.
    pub instance: i32,
    /// Ray count (kept on grants, whose payload carries no rays).
    pub num_rays: u32,
    /// The rays themselves; empty on grants.
    pub rays: RayVector,
}

impl RemoteRays {
    /// Build a request carrying `rays` for `instance`.
    pub fn request(sender: i32, instance: i32, rays: RayVector) -> Self {
        Self {
            transfer_type: TransferType::Request,
            sender,
            instance,
            num_rays: rays.len() as u32,
            rays,
        }
    }

    /// Build the grant acknowledging `num_rays` rays for `instance`.
    pub fn grant(sender: i32, instance: i32, num_rays: u32) -> Self {
        Self {
            transfer_type: TransferType::Grant,
            sender,
            instance,
            num_rays,
            rays: RayVector::new(),
        }
    }
}

impl Work for RemoteRays {
    fn user_tag() -> u64 {
        static TAG: OnceLock<u64> = OnceLock::new();
        *TAG.get_or_init(register_message_class)
    }

    fn system_tag() -> SystemTag {
        SystemTag::ControlUser
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(13 + self.rays.len() * RAY_WIRE_SIZE);
        out.push(self.transfer_type as u8);
        out.extend_from_slice(&self.sender.to_le_bytes());
        out.extend_from_slice(&self.instance.to_le_bytes());
        out.extend_from_slice(&self.num_rays.to_le_bytes());
        if self.transfer_type == TransferType::Request {
            out.extend_from_slice(bytemuck::cast_slice(&self.rays));
        }
        out
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 13 {
            return Err(CommError::Malformed("remote-rays header truncated".into()));
        }
        let transfer_type = match bytes[0] {
            0 => TransferType::Request,
            1 => TransferType::Grant,
            other => {
                return Err(CommError::Malformed(format!("bad transfer type {other}")));
            }
        };
        let i32_at = |off: usize| {
            i32::from_le_bytes(bytes[off..off + 4].try_into().expect("4-byte slice"))
        };
        let sender = i32_at(1);
        let instance = i32_at(5);
        let num_rays = i32_at(9) as u32;

        let mut rays = RayVector::new();
        if transfer_type == TransferType::Request {
            let expected = num_rays as usize * RAY_WIRE_SIZE;
            let body = &bytes[13..];
            if body.len() != expected {
                return Err(CommError::Malformed(format!(
                    "ray payload {} bytes, header says {}",
                    body.len(),
                    expected
                )));
            }
            rays.reserve(num_rays as usize);
            for chunk in body.chunks_exact(RAY_WIRE_SIZE) {
                // The buffer alignment is arbitrary, so copy each struct out.
                rays.push(bytemuck::pod_read_unaligned::<Ray>(chunk));
            }
        }

        Ok(Self {
            transfer_type,
            sender,
            instance,
            num_rays,
            rays,
        })
    }
}

/// Discriminants of the two-phase-commit traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VoteKind {
    /// Coordinator asks the cohorts whether they are quiescent.
    Propose = 0,
    /// Coordinator confirms global termination.
    DoCommit = 1,
    /// Coordinator cancels the round.
    DoAbort = 2,
    /// Cohort has no work.
    VoteCommit = 3,
    /// Cohort still has work.
    VoteAbort = 4,
}

/// One vote-protocol message. Empty payload beyond kind and sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vote {
    /// Protocol step.
    pub kind: VoteKind,
    /// Originating rank.
    pub sender: i32,
}

impl Vote {
    /// Build a vote message.
    pub fn new(kind: VoteKind, sender: i32) -> Self {
        Self { kind, sender }
    }
}

impl Work for Vote {
    fn user_tag() -> u64 {
        static TAG: OnceLock<u64> = OnceLock::new();
        *TAG.get_or_init(register_message_class)
    }

    fn system_tag() -> SystemTag {
        SystemTag::ControlVote
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.sender.to_le_bytes());
        out
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 5 {
            return Err(CommError::Malformed("vote payload size".into()));
        }
        let kind = match bytes[0] {
            0 => VoteKind::Propose,
            1 => VoteKind::DoCommit,
            2 => VoteKind::DoAbort,
            3 => VoteKind::VoteCommit,
            4 => VoteKind::VoteAbort,
            other => return Err(CommError::Malformed(format!("bad vote kind {other}"))),
        };
        let sender = i32::from_le_bytes(bytes[1..5].try_into().expect("4-byte slice"));
        Ok(Self { kind, sender })
    }
}

/// Top-level worker command from rank 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// End of render: workers terminate.
    Quit = 0,
}

impl Work for Command {
    fn user_tag() -> u64 {
        static TAG: OnceLock<u64> = OnceLock::new();
        *TAG.get_or_init(register_message_class)
    }

    fn system_tag() -> SystemTag {
        SystemTag::ControlSystem
    }

    fn encode_payload(&self) -> Vec<u8> {
        vec![*self as u8]
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [0] => Ok(Command::Quit),
            _ => Err(CommError::Malformed("bad command".into())),
        }
    }
}
