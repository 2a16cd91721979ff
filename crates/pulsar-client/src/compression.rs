// Payload decompression.
//
// Applied to the whole frame payload before any batch splitting. This
// client always publishes uncompressed, so only the decode direction
// exists here.
use bytes::Bytes;
use std::io::Read;

use pulsar_wire::proto::CompressionType;

use crate::errors::{ClientError, Result};

pub(crate) fn decompress(
    codec: CompressionType,
    data: &[u8],
    uncompressed_size: usize,
) -> Result<Bytes> {
    let out = match codec {
        CompressionType::None => return Ok(Bytes::copy_from_slice(data)),
        CompressionType::Lz4 => {
            // Pulsar uses raw LZ4 blocks; the expected size comes from the
            // metadata header.
            lz4::block::decompress(data, Some(uncompressed_size as i32))
                .map_err(|e| ClientError::Decompress(e.to_string()))?
        }
        CompressionType::Zlib => {
            let mut decoder = libflate::zlib::Decoder::new(data)
                .map_err(|e| ClientError::Decompress(e.to_string()))?;
            let mut out = Vec::with_capacity(uncompressed_size);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ClientError::Decompress(e.to_string()))?;
            out
        }
        CompressionType::Zstd => {
            zstd::decode_all(data).map_err(|e| ClientError::Decompress(e.to_string()))?
        }
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| ClientError::Decompress(e.to_string()))?,
    };
    Ok(Bytes::from(out))
}
