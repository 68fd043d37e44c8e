//! Intel-hex (`.ihx`) image decoding.
//!
//! Each line is `:LLAAAATT[DD...]CC`: byte count, 16-bit offset, record
//! type, data and a checksum making the byte sum of the line zero mod 256.
//! Only the record types emitted by legacy radio firmware builds are
//! accepted: data, end of file and extended segment address.

use thiserror::Error;
use tracing::debug;

/// Fixed bytes of a record: count, offset (2), type, checksum.
const RECORD_OVERHEAD: usize = 5;

/// Data bytes per record written by [`encode`].
const ENCODE_RECORD_LEN: usize = 16;

/// End of what extended segment addressing can reach.
const SEGMENT_SPACE: u64 = 0x10_0000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    #[error("Line {line}: too short ({length} characters)")]
    LineTooShort { line: usize, length: usize },

    #[error("Line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Line {line}: unsupported record type 0x{record_type:02X}")]
    UnsupportedRecordType { line: usize, record_type: u8 },

    #[error("Line {line}: checksum 0x{actual:02X}, expected 0x{expected:02X}")]
    Checksum { line: usize, expected: u8, actual: u8 },

    #[error("Block {index} out of range ({count} blocks)")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Block at 0x{address:08X} ({length} bytes) extends past the 1 MiB segment space")]
    AddressOutOfRange { address: u32, length: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Data,
    EndOfFile,
    ExtendedSegmentAddress,
}

impl RecordType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(RecordType::Data),
            0x01 => Some(RecordType::EndOfFile),
            0x02 => Some(RecordType::ExtendedSegmentAddress),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            RecordType::Data => 0x00,
            RecordType::EndOfFile => 0x01,
            RecordType::ExtendedSegmentAddress => 0x02,
        }
    }
}

/// One parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub record_type: RecordType,
    pub address: u16,
    pub payload: Vec<u8>,
}

impl HexRecord {
    /// Parse one non-blank line. `line` is the 1-based line number used in
    /// errors.
    pub fn parse(text: &str, line: usize) -> Result<Self, HexError> {
        let Some(digits) = text.strip_prefix(':') else {
            return Err(HexError::Malformed {
                line,
                reason: "missing ':' start code".to_string(),
            });
        };
        if digits.len() < RECORD_OVERHEAD * 2 {
            return Err(HexError::LineTooShort {
                line,
                length: text.len(),
            });
        }
        let bytes = hex::decode(digits).map_err(|e| HexError::Malformed {
            line,
            reason: e.to_string(),
        })?;

        let count = bytes[0] as usize;
        let expected_len = count + RECORD_OVERHEAD;
        if bytes.len() < expected_len {
            return Err(HexError::LineTooShort {
                line,
                length: text.len(),
            });
        }
        if bytes.len() > expected_len {
            return Err(HexError::Malformed {
                line,
                reason: format!("{} bytes after the checksum", bytes.len() - expected_len),
            });
        }

        let stored = bytes[expected_len - 1];
        let computed = record_checksum(&bytes[..expected_len - 1]);
        if stored != computed {
            return Err(HexError::Checksum {
                line,
                expected: computed,
                actual: stored,
            });
        }

        let record_type =
            RecordType::from_byte(bytes[3]).ok_or(HexError::UnsupportedRecordType {
                line,
                record_type: bytes[3],
            })?;
        let payload = bytes[4..4 + count].to_vec();
        if record_type == RecordType::ExtendedSegmentAddress && payload.len() != 2 {
            return Err(HexError::Malformed {
                line,
                reason: format!("segment record with {} data bytes", payload.len()),
            });
        }

        Ok(Self {
            record_type,
            address: u16::from_be_bytes([bytes[1], bytes[2]]),
            payload,
        })
    }

    /// Render as a `:`-prefixed line with checksum.
    pub fn to_line(&self) -> String {
        let mut bytes = Vec::with_capacity(self.payload.len() + RECORD_OVERHEAD);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.address.to_be_bytes());
        bytes.push(self.record_type.as_byte());
        bytes.extend_from_slice(&self.payload);
        bytes.push(record_checksum(&bytes));
        format!(":{}", hex::encode_upper(bytes))
    }
}

/// Two's-complement of the byte sum, mod 256.
pub fn record_checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

/// Contiguous run of bytes at an absolute address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexBlock {
    pub address: u32,
    pub data: Vec<u8>,
}

impl HexBlock {
    pub fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

/// Decoded image: blocks in record order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseImage {
    blocks: Vec<HexBlock>,
}

impl SparseImage {
    pub fn from_blocks(blocks: Vec<HexBlock>) -> Self {
        Self { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Sum of all block lengths.
    pub fn total_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }

    pub fn blocks(&self) -> &[HexBlock] {
        &self.blocks
    }

    /// The `index`-th block in record order.
    pub fn block_at(&self, index: usize) -> Result<&HexBlock, HexError> {
        self.blocks.get(index).ok_or(HexError::IndexOutOfRange {
            index,
            count: self.blocks.len(),
        })
    }

    /// Consume the image, yielding each block once.
    pub fn into_blocks(self) -> std::vec::IntoIter<HexBlock> {
        self.blocks.into_iter()
    }
}

/// Decode hex lines into a sparse image.
///
/// Blank lines are skipped and anything after the end-of-file record is
/// ignored. The first bad line aborts the whole decode.
pub fn decode<I, S>(lines: I) -> Result<SparseImage, HexError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut blocks: Vec<HexBlock> = Vec::new();
    let mut segment_base = 0u32;
    // Segment base of the last block, for merging.
    let mut last_base = None;

    for (index, text) in lines.into_iter().enumerate() {
        let text = text.as_ref().trim();
        if text.is_empty() {
            continue;
        }
        let record = HexRecord::parse(text, index + 1)?;
        match record.record_type {
            RecordType::EndOfFile => {
                debug!(line = index + 1, "End of file record");
                break;
            }
            RecordType::ExtendedSegmentAddress => {
                let segment = u16::from_be_bytes([record.payload[0], record.payload[1]]);
                segment_base = (segment as u32) << 4;
            }
            RecordType::Data => {
                if record.payload.is_empty() {
                    continue;
                }
                let address = segment_base + record.address as u32;
                match blocks.last_mut() {
                    Some(last) if last_base == Some(segment_base) && last.end() == address => {
                        last.data.extend_from_slice(&record.payload);
                    }
                    _ => {
                        blocks.push(HexBlock {
                            address,
                            data: record.payload,
                        });
                        last_base = Some(segment_base);
                    }
                }
            }
        }
    }

    debug!(blocks = blocks.len(), "Hex image decoded");
    Ok(SparseImage { blocks })
}

/// Decode a whole `.ihx` text.
pub fn decode_str(text: &str) -> Result<SparseImage, HexError> {
    decode(text.lines())
}

/// Encode an image as hex lines: 16-byte data records, a segment record
/// whenever the 64 KiB window changes, and a final end-of-file record.
///
/// Segment records only reach the first MiB; blocks beyond it are rejected.
pub fn encode(image: &SparseImage) -> Result<Vec<String>, HexError> {
    if let Some(block) = image
        .blocks()
        .iter()
        .find(|b| b.address as u64 + b.data.len() as u64 > SEGMENT_SPACE)
    {
        return Err(HexError::AddressOutOfRange {
            address: block.address,
            length: block.data.len(),
        });
    }

    let mut lines = Vec::new();
    let mut segment_base = 0u32;

    for block in image.blocks() {
        let mut address = block.address;
        let mut rest = block.data.as_slice();
        while !rest.is_empty() {
            let base = address & 0xF_0000;
            if base != segment_base {
                segment_base = base;
                let segment = (base >> 4) as u16;
                lines.push(
                    HexRecord {
                        record_type: RecordType::ExtendedSegmentAddress,
                        address: 0,
                        payload: segment.to_be_bytes().to_vec(),
                    }
                    .to_line(),
                );
            }
            let offset = address & 0xFFFF;
            let room = (0x1_0000 - offset) as usize;
            let n = rest.len().min(ENCODE_RECORD_LEN).min(room);
            lines.push(
                HexRecord {
                    record_type: RecordType::Data,
                    address: offset as u16,
                    payload: rest[..n].to_vec(),
                }
                .to_line(),
            );
            rest = &rest[n..];
            address += n as u32;
        }
    }

    lines.push(
        HexRecord {
            record_type: RecordType::EndOfFile,
            address: 0,
            payload: Vec::new(),
        }
        .to_line(),
    );
    Ok(lines)
}

/// Encode one contiguous run of bytes.
pub fn encode_bytes(address: u32, data: &[u8]) -> Result<Vec<String>, HexError> {
    encode(&SparseImage::from_blocks(vec![HexBlock {
        address,
        data: data.to_vec(),
    }]))
}
