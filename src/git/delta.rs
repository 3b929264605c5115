use crate::git::error::DeltaError;

const VARINT_ENCODING_BITS: u32 = 7;
const VARINT_CONTINUE_FLAG: u8 = 1 << VARINT_ENCODING_BITS;
const COPY_OFFSET_BYTES: u32 = 4;
const COPY_SIZE_BYTES: u32 = 3;
/// Copy size used when an instruction carries no size bytes.
const DEFAULT_COPY_SIZE: u64 = 0x10000;
const MAX_PREALLOCATION: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaInstruction<'a> {
    Copy { offset: u64, length: u64 },
    Insert(&'a [u8]),
}

/// Reads the little-endian base-128 size headers at the start of a delta.
fn read_size(delta: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        if shift >= u64::BITS {
            return Err(DeltaError::SizeOverflow);
        }
        value |= u64::from(byte & !VARINT_CONTINUE_FLAG) << shift;
        if byte & VARINT_CONTINUE_FLAG == 0 {
            return Ok(value);
        }
        shift += VARINT_ENCODING_BITS;
    }
}

impl<'a> DeltaInstruction<'a> {
    fn read(delta: &'a [u8], pos: &mut usize) -> Result<Self, DeltaError> {
        let first_byte = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;

        if first_byte & VARINT_CONTINUE_FLAG == 0 {
            if first_byte == 0 {
                return Err(DeltaError::InvalidOpcode);
            }
            let end = *pos + usize::from(first_byte);
            let data = delta.get(*pos..end).ok_or(DeltaError::Truncated)?;
            *pos = end;
            return Ok(Self::Insert(data));
        }

        let flags = first_byte & !VARINT_CONTINUE_FLAG;
        let mut read_le = |first_bit: u32, count: u32| -> Result<u64, DeltaError> {
            let mut value: u64 = 0;
            for i in 0..count {
                if flags & (1 << (first_bit + i)) != 0 {
                    let byte = *delta.get(*pos).ok_or(DeltaError::Truncated)?;
                    *pos += 1;
                    value |= u64::from(byte) << (i * 8);
                }
            }
            Ok(value)
        };
        let offset = read_le(0, COPY_OFFSET_BYTES)?;
        let length = match read_le(COPY_OFFSET_BYTES, COPY_SIZE_BYTES)? {
            0 => DEFAULT_COPY_SIZE,
            length => length,
        };
        Ok(Self::Copy { offset, length })
    }

    /// Appends the wire form of this instruction to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Self::Insert(data) => {
                for chunk in data.chunks(0x7f) {
                    out.push(chunk.len() as u8);
                    out.extend_from_slice(chunk);
                }
            }
            Self::Copy { offset, length } => {
                let opcode_at = out.len();
                let mut opcode = VARINT_CONTINUE_FLAG;
                out.push(0);
                for i in 0..COPY_OFFSET_BYTES {
                    let byte = (offset >> (i * 8)) as u8;
                    if byte != 0 {
                        opcode |= 1 << i;
                        out.push(byte);
                    }
                }
                let length = if *length == DEFAULT_COPY_SIZE { 0 } else { *length };
                for i in 0..COPY_SIZE_BYTES {
                    let byte = (length >> (i * 8)) as u8;
                    if byte != 0 {
                        opcode |= 1 << (COPY_OFFSET_BYTES + i);
                        out.push(byte);
                    }
                }
                out[opcode_at] = opcode;
            }
        }
    }
}

fn write_size(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= VARINT_ENCODING_BITS;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | VARINT_CONTINUE_FLAG);
    }
}

/// Serializes a delta turning a `source_size`-byte base into a `target_size`-byte result.
pub fn encode_delta(source_size: u64, target_size: u64, instructions: &[DeltaInstruction]) -> Vec<u8> {
    let mut out = vec![];
    write_size(source_size, &mut out);
    write_size(target_size, &mut out);
    for instruction in instructions {
        instruction.encode(&mut out);
    }
    out
}

/// The source and target sizes declared at the head of `delta`.
pub fn delta_sizes(delta: &[u8]) -> Result<(u64, u64), DeltaError> {
    let mut pos = 0;
    let source_size = read_size(delta, &mut pos)?;
    let target_size = read_size(delta, &mut pos)?;
    Ok((source_size, target_size))
}

/// Rebuilds an object from its `base` and a delta patch.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut pos = 0;
    let source_size = read_size(delta, &mut pos)?;
    if source_size != base.len() as u64 {
        return Err(DeltaError::SourceSizeMismatch {
            expected: source_size,
            actual: base.len() as u64,
        });
    }
    let target_size = read_size(delta, &mut pos)?;

    let mut output = Vec::with_capacity(target_size.min(MAX_PREALLOCATION) as usize);
    let mut remaining = target_size;
    while remaining > 0 {
        match DeltaInstruction::read(delta, &mut pos)? {
            DeltaInstruction::Copy { offset, length } => {
                let in_range = offset
                    .checked_add(length)
                    .is_some_and(|end| end <= base.len() as u64);
                if !in_range || length > remaining {
                    return Err(DeltaError::InvalidCopyRange {
                        offset,
                        size: length,
                        base_len: base.len(),
                        remaining,
                    });
                }
                output.extend_from_slice(&base[offset as usize..(offset + length) as usize]);
                remaining -= length;
            }
            DeltaInstruction::Insert(data) => {
                let size = data.len() as u64;
                if size > remaining {
                    return Err(DeltaError::TargetSizeExceeded { size, remaining });
                }
                output.extend_from_slice(data);
                remaining -= size;
            }
        }
    }

    if pos != delta.len() {
        return Err(DeltaError::TrailingData(delta.len() - pos));
    }
    Ok(output)
}
