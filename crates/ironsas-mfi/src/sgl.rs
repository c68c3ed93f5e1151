//! Scatter-gather list decoding.
//!
//! A frame carries its data-transfer map as a table of descriptors in one of
//! three wire formats, selected once per frame by the header flags. The
//! descriptor addresses and lengths are guest-controlled; decoding is bounded
//! both by the declared entry count and by the mapped frame window, so a
//! frame lying about `sge_count` can never walk past its own bytes.

use thiserror::Error;

use crate::FrameFlags;

/// Wire format of one scatter-gather descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SglFormat {
    /// 32-bit address + 32-bit length, 8 bytes.
    Sgl32,
    /// 64-bit address + 32-bit length, 12 bytes.
    Sgl64,
    /// IEEE "skinny": 64-bit address, 32-bit length, 32-bit flags, 16 bytes.
    Skinny,
}

impl SglFormat {
    /// The format is chosen once from the frame's flags and applies to every
    /// descriptor in that frame.
    pub fn from_flags(flags: FrameFlags) -> SglFormat {
        if flags.contains(FrameFlags::IEEE_SGL) {
            SglFormat::Skinny
        } else if flags.contains(FrameFlags::SGL64) {
            SglFormat::Sgl64
        } else {
            SglFormat::Sgl32
        }
    }

    pub fn entry_size(self) -> usize {
        match self {
            SglFormat::Sgl32 => 8,
            SglFormat::Sgl64 => 12,
            SglFormat::Skinny => 16,
        }
    }
}

/// One normalized (address, length) segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SglSegment {
    pub addr: u64,
    pub len: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SglError {
    #[error("scatter-gather list declares {count} entries, limit is {max}")]
    TooManyEntries { count: usize, max: usize },
    #[error("scatter-gather descriptor {index} extends past the mapped frame window")]
    Truncated { index: usize },
    #[error("scatter-gather descriptor {index} has a zero address or length")]
    InvalidEntry { index: usize },
}

/// Decode `count` descriptors starting at `offset` within a mapped frame
/// window. The walk never reads past `frame`; running out of window before
/// `count` descriptors are consumed reports the failing index.
pub fn decode(
    frame: &[u8],
    offset: usize,
    count: usize,
    format: SglFormat,
    max: usize,
) -> Result<Vec<SglSegment>, SglError> {
    if count > max {
        return Err(SglError::TooManyEntries { count, max });
    }
    let entry_size = format.entry_size();
    let mut segments = Vec::with_capacity(count);
    let mut pos = offset;
    for index in 0..count {
        let end = match pos.checked_add(entry_size) {
            Some(end) if end <= frame.len() => end,
            _ => return Err(SglError::Truncated { index }),
        };
        let bytes = &frame[pos..end];
        let (addr, len) = match format {
            SglFormat::Sgl32 => (
                u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as u64,
                u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            ),
            SglFormat::Sgl64 | SglFormat::Skinny => (
                u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
                u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            ),
        };
        if addr == 0 || len == 0 {
            return Err(SglError::InvalidEntry { index });
        }
        segments.push(SglSegment { addr, len });
        pos = end;
    }
    Ok(segments)
}

/// Total byte length described by a decoded list.
pub fn total_len(segments: &[SglSegment]) -> u64 {
    segments.iter().map(|seg| seg.len as u64).sum()
}

/// Encode descriptors in the given format. This is the driver's half of the
/// protocol; the adapter only decodes, but round-tripping keeps both
/// directions honest and gives tests a builder.
pub fn encode(segments: &[SglSegment], format: SglFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(segments.len() * format.entry_size());
    for seg in segments {
        match format {
            SglFormat::Sgl32 => {
                out.extend_from_slice(&(seg.addr as u32).to_le_bytes());
                out.extend_from_slice(&seg.len.to_le_bytes());
            }
            SglFormat::Sgl64 => {
                out.extend_from_slice(&seg.addr.to_le_bytes());
                out.extend_from_slice(&seg.len.to_le_bytes());
            }
            SglFormat::Skinny => {
                out.extend_from_slice(&seg.addr.to_le_bytes());
                out.extend_from_slice(&seg.len.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
            }
        }
    }
    out
}
