use byteorder::{ByteOrder, LittleEndian};
use rkyv::{from_bytes, to_bytes, AlignedVec, Archive, Deserialize, Serialize};

use super::error::TransportError::{self, *};
use crate::{
    codec::Blob,
    identity::NodeIdentity,
    work::{ContextFrame, Contribution},
};

/// Frame prefix: `len: u32 LE | flags: u8`, followed by `len` body bytes.
pub const HEADER_LEN: usize = 4 + 1;
/// Bodies larger than this are zstd compressed.
pub const COMPRESS_THRESHOLD: usize = 1024;
pub const MAX_FRAME_LEN: usize = 16 << 20;

const FLAG_ZSTD: u8 = 0b0000_0001;
const ZSTD_LEVEL: i32 = 3;

/// Every operation a node answers to.
#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[archive(check_bytes)]
pub enum Request {
    Info,
    QueueDepth,
    /// Address of the node's outbound ring neighbor.
    Neighbor,
    /// Sum of queue depths over the node's local ring. Regional nodes only.
    RegionalQueueDepth,
    ReceiveBlob(Blob),
    Balance(Blob),
    SetNext(String),
    SetRegionalNext(String),
    Run {
        context: ContextFrame,
        selector: Vec<String>,
    },
    /// Executes like `Run` but never forwards.
    Contribute {
        context: ContextFrame,
        selector: Vec<String>,
    },
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug)]
#[archive(check_bytes)]
pub enum Response {
    Info(NodeIdentity),
    Depth(u64),
    Neighbor(String),
    Ack,
    /// `None` when the round had already been processed.
    Ran(Option<ContextFrame>),
    Contribution(Option<Vec<Contribution>>),
    Rejected(String),
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Info => "info",
            Request::QueueDepth => "queue_depth",
            Request::Neighbor => "neighbor",
            Request::RegionalQueueDepth => "regional_queue_depth",
            Request::ReceiveBlob(_) => "receive_blob",
            Request::Balance(_) => "balance",
            Request::SetNext(_) => "set_next",
            Request::SetRegionalNext(_) => "set_regional_next",
            Request::Run { .. } => "run",
            Request::Contribute { .. } => "contribute",
        }
    }
}

macro_rules! wire_message {
    ($ty:ty) => {
        impl $ty {
            /// Serializes the message into a complete frame.
            pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
                let body = to_bytes::<_, 1024>(self).map_err(|_| CouldNotEncodeMessage)?;
                frame(&body)
            }

            /// Parses a frame body given the flags from its header.
            pub fn decode(flags: u8, body: &[u8]) -> Result<Self, TransportError> {
                let mut aligned = AlignedVec::new();
                if flags & FLAG_ZSTD != 0 {
                    let raw = zstd::bulk::decompress(body, MAX_FRAME_LEN)
                        .map_err(|_| CouldNotDecodeMessage)?;
                    aligned.extend_from_slice(&raw);
                } else {
                    aligned.extend_from_slice(body);
                }
                from_bytes::<Self>(&aligned).map_err(|_| CouldNotDecodeMessage)
            }

            /// Parses a complete frame held in memory.
            pub fn decode_frame(buf: &[u8]) -> Result<Self, TransportError> {
                let (flags, len) = parse_header(buf)?;
                let body = buf
                    .get(HEADER_LEN..HEADER_LEN + len)
                    .ok_or(CouldNotDecodeMessage)?;
                Self::decode(flags, body)
            }
        }
    };
}

wire_message!(Request);
wire_message!(Response);

fn frame(body: &[u8]) -> Result<Vec<u8>, TransportError> {
    // the receiver caps decompression at the same limit
    if body.len() > MAX_FRAME_LEN {
        return Err(MessageLengthOverflowed);
    }
    let (flags, body) = if body.len() > COMPRESS_THRESHOLD {
        let packed = zstd::bulk::compress(body, ZSTD_LEVEL).map_err(|_| CouldNotEncodeMessage)?;
        (FLAG_ZSTD, packed)
    } else {
        (0, body.to_vec())
    };
    if body.len() > MAX_FRAME_LEN {
        return Err(MessageLengthOverflowed);
    }
    let mut buf = vec![0u8; HEADER_LEN];
    LittleEndian::write_u32(&mut buf[..4], body.len() as u32);
    buf[4] = flags;
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Reads `(flags, body length)` out of a frame header.
pub fn parse_header(header: &[u8]) -> Result<(u8, usize), TransportError> {
    if header.len() < HEADER_LEN {
        return Err(CouldNotDecodeMessage);
    }
    let len = LittleEndian::read_u32(&header[..4]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(MessageLengthOverflowed);
    }
    Ok((header[4], len))
}
