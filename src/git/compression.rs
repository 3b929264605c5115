use crate::git::error::PackfileError;
use flate2::{bufread::ZlibDecoder, write::ZlibEncoder, Compression};
use std::io::{Read, Write};

/// Upper bound on the buffer reserved up front from an untrusted size header.
const MAX_PREALLOCATION: u64 = 1 << 20;

pub fn compress(input: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input)?;
    encoder.finish()
}

/// Inflates one zlib stream from the front of `input`, which may be followed
/// by unrelated bytes. Returns the inflated data and the number of compressed
/// bytes consumed. Never inflates more than `expected_size + 1` bytes.
pub fn decompress_slice(
    input: &[u8],
    expected_size: u64,
) -> Result<(Vec<u8>, usize), PackfileError> {
    let mut decoder = ZlibDecoder::new(input);
    let mut output = Vec::with_capacity(expected_size.min(MAX_PREALLOCATION) as usize);

    decoder
        .by_ref()
        .take(expected_size.saturating_add(1))
        .read_to_end(&mut output)
        .map_err(|err| PackfileError::CorruptStream(err.to_string()))?;

    if output.len() as u64 != expected_size {
        return Err(PackfileError::SizeMismatch {
            expected: expected_size,
            actual: output.len() as u64,
        });
    }

    let consumed = decoder.total_in() as usize;
    Ok((output, consumed))
}
