//! Wire protocol between engine instances.
//!
//! Every message travels inside an [`Envelope`] carrying the sender, its
//! current election term and a freshly ticked vector clock. Envelopes are
//! bincode encoded and framed as:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     payload length (big-endian)
//! 4       4     crc32c of payload (big-endian)
//! 8       N     bincode payload
//! ```
//!
//! The variant order of [`Message`] is part of the wire format; new variants
//! are only ever appended.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::cluster::byzantine::SuspicionReport;
use crate::cluster::checkpoint::Checkpoint;
use crate::cluster::membership::MembershipSnapshot;
use crate::cluster::suzuki_kasami::Token;
use crate::cluster::vector_clock::VectorClock;
use crate::constants::{FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
use crate::error::{CoordError, Result};
use crate::types::{CheckpointSeq, MembershipVersion, NodeId, Term};

// CRC-32C (Castagnoli)
const CRC32C_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x82F63B78;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Compute the CRC-32C checksum of `data`.
///
/// Used both for frame integrity and as the checkpoint digest.
pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32C_TABLE[index];
    }
    !crc
}

/// A coordination message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    VoteRequest {
        term: Term,
        membership_version: MembershipVersion,
    },
    VoteReply {
        term: Term,
        granted: bool,
    },
    Heartbeat {
        term: Term,
        membership_version: MembershipVersion,
    },
    HeartbeatAck {
        term: Term,
    },
    /// Liveness ping from a non-leader, answered with nothing; receipt alone
    /// counts as contact.
    Ping {
        membership_version: MembershipVersion,
    },
    MembershipSync {
        snapshot: MembershipSnapshot,
    },
    ResourceRequest {
        resource: String,
        timestamp: VectorClock,
        sequence: u64,
    },
    ResourceReply {
        resource: String,
        sequence: u64,
    },
    /// Release of a held resource or withdrawal of a pending request.
    ResourceRelease {
        resource: String,
        sequence: u64,
    },
    TokenTransfer {
        token: Token,
    },
    SuspicionReport(SuspicionReport),
    /// Pushed down the replica chain; `route` is the live chain at creation.
    CheckpointReplicate {
        origin: NodeId,
        checkpoint: Checkpoint,
        route: Vec<NodeId>,
    },
    CheckpointAck {
        sequence: CheckpointSeq,
        replica: NodeId,
    },
    /// Ask a replica for its newest copy of the sender's checkpoint at or
    /// below `sequence`.
    CheckpointFetch {
        sequence: CheckpointSeq,
    },
    /// Answer to a fetch; `sequence` echoes the request.
    CheckpointCopy {
        sequence: CheckpointSeq,
        checkpoint: Option<Checkpoint>,
    },
}

impl Message {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::VoteRequest { .. } => "vote_request",
            Message::VoteReply { .. } => "vote_reply",
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatAck { .. } => "heartbeat_ack",
            Message::Ping { .. } => "ping",
            Message::MembershipSync { .. } => "membership_sync",
            Message::ResourceRequest { .. } => "resource_request",
            Message::ResourceReply { .. } => "resource_reply",
            Message::ResourceRelease { .. } => "resource_release",
            Message::TokenTransfer { .. } => "token_transfer",
            Message::SuspicionReport(_) => "suspicion_report",
            Message::CheckpointReplicate { .. } => "checkpoint_replicate",
            Message::CheckpointAck { .. } => "checkpoint_ack",
            Message::CheckpointFetch { .. } => "checkpoint_fetch",
            Message::CheckpointCopy { .. } => "checkpoint_copy",
        }
    }
}

/// A message produced by a protocol core, addressed to one peer.
///
/// Cores never stamp or send; the engine wraps each outbound message in an
/// [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub message: Message,
}

impl Outbound {
    pub fn new(to: NodeId, message: Message) -> Self {
        Self { to, message }
    }

    /// One copy of `message` per recipient.
    pub fn broadcast<I>(recipients: I, message: Message) -> Vec<Outbound>
    where
        I: IntoIterator<Item = NodeId>,
    {
        recipients
            .into_iter()
            .map(|to| Outbound::new(to, message.clone()))
            .collect()
    }
}

/// A stamped message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub term: Term,
    pub clock: VectorClock,
    pub message: Message,
}

/// Encode an envelope into a single frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Bytes> {
    let payload = bincode::serialize(envelope)?;
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(CoordError::Malformed(format!(
            "payload of {} bytes exceeds frame limit",
            payload.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc32c(&payload));
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode exactly one frame.
pub fn decode_frame(frame: &[u8]) -> Result<Envelope> {
    let mut buf = BytesMut::from(frame);
    match try_decode(&mut buf)? {
        Some(envelope) if buf.is_empty() => Ok(envelope),
        Some(_) => Err(CoordError::Malformed(format!(
            "{} trailing bytes after frame",
            buf.len()
        ))),
        None => Err(CoordError::Malformed("truncated frame".to_string())),
    }
}

/// Decode the next frame from a stream buffer, if a complete one is present.
///
/// Consumed bytes are removed from `buf`. A corrupt frame is consumed and
/// reported as an error so the caller can drop it and keep reading.
pub fn try_decode(buf: &mut BytesMut) -> Result<Option<Envelope>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        buf.clear();
        return Err(CoordError::Malformed(format!(
            "declared payload of {} bytes exceeds frame limit",
            len
        )));
    }
    if buf.len() < FRAME_HEADER_SIZE + len {
        return Ok(None);
    }

    buf.advance(4);
    let expected = buf.get_u32();
    let payload = buf.split_to(len);
    let actual = crc32c(&payload);
    if actual != expected {
        return Err(CoordError::Malformed(format!(
            "crc mismatch: expected {:#010x}, got {:#010x}",
            expected, actual
        )));
    }
    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(message: Message) -> Envelope {
        let mut clock = VectorClock::new();
        clock.increment(NodeId(1));
        Envelope {
            from: NodeId(1),
            term: Term(3),
            clock,
            message,
        }
    }

    #[test]
    fn test_crc32c_known_vector() {
        // RFC 3720 test vector: 32 bytes of zeros
        assert_eq!(crc32c(&[0u8; 32]), 0x8A9136AA);
        assert_eq!(crc32c(b"123456789"), 0xE3069283);
    }

    #[test]
    fn test_frame_round_trip() {
        let env = envelope(Message::ResourceRequest {
            resource: "printer".into(),
            timestamp: VectorClock::new(),
            sequence: 4,
        });
        let frame = encode_frame(&env).unwrap();
        assert_eq!(decode_frame(&frame).unwrap(), env);
    }

    #[test]
    fn test_corrupted_payload_is_rejected() {
        let env = envelope(Message::HeartbeatAck { term: Term(3) });
        let mut frame = encode_frame(&env).unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            decode_frame(&frame),
            Err(CoordError::Malformed(_))
        ));
    }

    #[test]
    fn test_streaming_decode_handles_partial_frames() {
        let a = encode_frame(&envelope(Message::HeartbeatAck { term: Term(1) })).unwrap();
        let b = encode_frame(&envelope(Message::Ping {
            membership_version: MembershipVersion(2),
        }))
        .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a[..5]);
        assert!(try_decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&a[5..]);
        buf.extend_from_slice(&b);

        let first = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.message.kind(), "heartbeat_ack");
        let second = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.message.kind(), "ping");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u32(0);
        assert!(try_decode(&mut buf).is_err());
    }

    #[test]
    fn test_broadcast_addresses_each_peer() {
        let out = Outbound::broadcast(
            [NodeId(2), NodeId(3)],
            Message::HeartbeatAck { term: Term(1) },
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].to, NodeId(3));
    }
}
