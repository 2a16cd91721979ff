// Batch container decoding.
//
// When `MessageMetadata.num_messages_in_batch` is set, the frame payload is
// a sequence of records:
//
//   entrySize (u32 BE) | SingleMessageMetadata (protobuf) | entry payload
//
// where the entry payload length comes from `SingleMessageMetadata.
// payload_size`. Entries appear in publish order; the consumer assigns
// batch indexes 0..n in iteration order.
use bytes::{Buf, Bytes};
use prost::Message as _;

use crate::proto::SingleMessageMetadata;
use crate::{Result, WireError};

/// One logical message unpacked from a batch container.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub metadata: SingleMessageMetadata,
    pub data: Bytes,
}

/// Iterator over the entries of a batch payload. Yields exactly
/// `num_messages` entries unless the container is malformed.
pub struct BatchEntries {
    buf: Bytes,
    remaining: u32,
}

/// Split a batch payload into its entries.
pub fn entries(payload: Bytes, num_messages: u32) -> BatchEntries {
    BatchEntries {
        buf: payload,
        remaining: num_messages,
    }
}

impl Iterator for BatchEntries {
    type Item = Result<BatchEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.next_entry())
    }
}

impl BatchEntries {
    fn next_entry(&mut self) -> Result<BatchEntry> {
        if self.buf.remaining() < 4 {
            return Err(WireError::Truncated);
        }
        let metadata_size = self.buf.get_u32() as usize;
        if self.buf.remaining() < metadata_size {
            return Err(WireError::Truncated);
        }
        let metadata = SingleMessageMetadata::decode(self.buf.split_to(metadata_size))?;
        let payload_size = metadata.payload_size.unwrap_or(0).max(0) as usize;
        if self.buf.remaining() < payload_size {
            return Err(WireError::Truncated);
        }
        let data = self.buf.split_to(payload_size);
        Ok(BatchEntry { metadata, data })
    }
}
