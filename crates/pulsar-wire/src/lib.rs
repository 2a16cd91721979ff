// Pulsar binary protocol framing.
//
// Wire layout of a "simple" command frame:
//
//   totalSize (u32 BE) | cmdSize (u32 BE) | BaseCommand (protobuf)
//
// totalSize counts every byte that follows it. A "payload" command carries
// the same leading fields plus:
//
//   magic 0x0E01 | checksum (CRC32-C, u32 BE) | metadataSize (u32 BE)
//   | MessageMetadata (protobuf) | payload bytes
//
// The magic + checksum prefix is optional on decode (legacy frames) and
// always written on encode. The checksum covers
// metadataSize || metadata || payload.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message as _;

pub mod batch;
pub mod proto;

pub use proto::{BaseCommand, CommandType, MessageMetadata};

/// The maximum allowable size of a single frame, per the Pulsar protocol.
pub const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

/// Two-byte marker announcing that a CRC32-C checksum follows.
const MAGIC: [u8; 2] = [0x0e, 0x01];

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("frame size {0} exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),
    #[error("checksum mismatch: computed {computed:#010x}, frame carries {expected:#010x}")]
    ChecksumMismatch { computed: u32, expected: u32 },
    #[error("truncated frame")]
    Truncated,
    #[error("protobuf decode: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Metadata header plus opaque payload bytes. Present on MESSAGE and SEND
/// frames, absent on control frames; the two travel together.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub metadata: MessageMetadata,
    pub data: Bytes,
}

/// One Pulsar protocol frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub command: BaseCommand,
    pub payload: Option<Payload>,
}

impl Frame {
    pub fn simple(command: BaseCommand) -> Self {
        Self {
            command,
            payload: None,
        }
    }

    pub fn with_payload(command: BaseCommand, metadata: MessageMetadata, data: Bytes) -> Self {
        Self {
            command,
            payload: Some(Payload { metadata, data }),
        }
    }

    /// Encode the frame into `buf`. Fails with `FrameTooLarge` before
    /// writing anything if the encoded frame would exceed `MAX_FRAME_SIZE`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let cmd = self.command.encode_to_vec();
        let cmd_size = cmd.len();

        let mut total_size = 4 + cmd_size;
        let payload_fields = self.payload.as_ref().map(|payload| {
            let metadata = payload.metadata.encode_to_vec();
            (metadata, &payload.data)
        });
        if let Some((metadata, data)) = &payload_fields {
            // magic (2) + checksum (4) + metadataSize (4)
            total_size += 6 + 4 + metadata.len() + data.len();
        }
        if total_size + 4 > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(total_size + 4));
        }

        buf.reserve(total_size + 4);
        buf.put_u32(total_size as u32);
        buf.put_u32(cmd_size as u32);
        buf.put_slice(&cmd);

        if let Some((metadata, data)) = payload_fields {
            buf.put_slice(&MAGIC);
            let metadata_size = (metadata.len() as u32).to_be_bytes();
            let mut crc = crc32c::crc32c(&metadata_size);
            crc = crc32c::crc32c_append(crc, &metadata);
            crc = crc32c::crc32c_append(crc, data);
            buf.put_u32(crc);
            buf.put_slice(&metadata_size);
            buf.put_slice(&metadata);
            buf.put_slice(data);
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of a receive buffer. Returns
    /// `Ok(None)` when the buffer does not yet hold a complete frame;
    /// callers read more bytes and retry. Consumes the frame's bytes on
    /// success.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let total_size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        // Reject oversized frames before buffering their bytes.
        if total_size + 4 > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(total_size + 4));
        }
        if buf.len() < 4 + total_size {
            return Ok(None);
        }
        let mut body = buf.split_to(4 + total_size).freeze();
        body.advance(4);
        Self::parse(body).map(Some)
    }

    // Parses the bytes counted by totalSize: cmdSize onward.
    fn parse(mut body: Bytes) -> Result<Frame> {
        if body.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let cmd_size = body.get_u32() as usize;
        if cmd_size > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(cmd_size));
        }
        if body.remaining() < cmd_size {
            return Err(WireError::Truncated);
        }
        let command = BaseCommand::decode(body.split_to(cmd_size))?;

        if !body.has_remaining() {
            return Ok(Frame {
                command,
                payload: None,
            });
        }

        // The next word is either the magic + checksum prefix or, on legacy
        // frames, directly the metadataSize.
        let mut expected = None;
        if body.remaining() >= 2 && body[0] == MAGIC[0] && body[1] == MAGIC[1] {
            if body.remaining() < 6 {
                return Err(WireError::Truncated);
            }
            body.advance(2);
            expected = Some(body.get_u32());
        }
        if let Some(expected) = expected {
            let computed = crc32c::crc32c(&body);
            if computed != expected {
                return Err(WireError::ChecksumMismatch { computed, expected });
            }
        }

        if body.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let metadata_size = body.get_u32() as usize;
        if metadata_size > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(metadata_size));
        }
        if body.remaining() < metadata_size {
            return Err(WireError::Truncated);
        }
        let metadata = MessageMetadata::decode(body.split_to(metadata_size))?;

        Ok(Frame {
            command,
            payload: Some(Payload {
                metadata,
                data: body,
            }),
        })
    }
}
