//! The operational modes bitfield negotiated once per connection via `DefineOperationalModes`.
//!  It is immutable afterwards - renegotiation requires a new connection - so every component
//!  that needs it holds a plain copy.

use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const VERSION_MASK: u32 = 0x0000_001F;
pub const COMPRESSION_MODE_MASK: u32 = 0x0000_00E0;
pub const ENCODING_MASK: u32 = 0x0000_0300;

pub const COMPRESS_GZIP: u32 = 0x0000_0020;
pub const USE_COMMON_SERIALIZATION_FORMAT: u32 = 0x0100_0000;
pub const COMPRESS_SIGNAL_INDEX_CACHE: u32 = 0x4000_0000;
pub const COMPRESS_METADATA: u32 = 0x8000_0000;

/// String encoding for everything textual on the wire (connection strings, source names,
///  status messages), selected by bits 8-9 of the operational modes.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum OperationalEncoding {
    Utf16Le = 0x0000_0000,
    Utf16Be = 0x0000_0100,
    Utf8 = 0x0000_0200,
    Ansi = 0x0000_0300,
}

impl OperationalEncoding {
    pub fn encode_str(&self, s: &str) -> Vec<u8> {
        match self {
            OperationalEncoding::Utf16Le => s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect(),
            OperationalEncoding::Utf16Be => s.encode_utf16().flat_map(|c| c.to_be_bytes()).collect(),
            OperationalEncoding::Utf8 => s.as_bytes().to_vec(),
            // ANSI is lossy for anything outside Latin-1
            OperationalEncoding::Ansi => s.chars()
                .map(|c| if (c as u32) < 256 { c as u8 } else { b'?' })
                .collect(),
        }
    }

    pub fn decode_str(&self, bytes: &[u8]) -> anyhow::Result<String> {
        match self {
            OperationalEncoding::Utf16Le | OperationalEncoding::Utf16Be => {
                if bytes.len() % 2 != 0 {
                    bail!("UTF-16 string has odd byte length {}", bytes.len());
                }
                let units: Vec<u16> = bytes.chunks_exact(2)
                    .map(|c| match self {
                        OperationalEncoding::Utf16Le => u16::from_le_bytes([c[0], c[1]]),
                        _ => u16::from_be_bytes([c[0], c[1]]),
                    })
                    .collect();
                Ok(String::from_utf16(&units)?)
            }
            OperationalEncoding::Utf8 => Ok(std::str::from_utf8(bytes)?.to_string()),
            OperationalEncoding::Ansi => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

/// Thin wrapper around the raw u32 so call sites read as queries rather than mask arithmetic.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OperationalModes(pub u32);

impl Default for OperationalModes {
    /// Version 0, UTF-8, common serialization format - what this implementation's subscriber
    ///  sends if not configured otherwise.
    fn default() -> Self {
        OperationalModes(OperationalEncoding::Utf8 as u32 | USE_COMMON_SERIALIZATION_FORMAT)
    }
}

impl OperationalModes {
    pub fn version(&self) -> u32 {
        self.0 & VERSION_MASK
    }

    pub fn encoding(&self) -> OperationalEncoding {
        // infallible: the mask covers exactly the four defined values
        OperationalEncoding::try_from(self.0 & ENCODING_MASK)
            .unwrap_or(OperationalEncoding::Utf8)
    }

    pub fn gzip_compression(&self) -> bool {
        self.0 & COMPRESSION_MODE_MASK & COMPRESS_GZIP != 0
    }

    pub fn use_common_serialization_format(&self) -> bool {
        self.0 & USE_COMMON_SERIALIZATION_FORMAT != 0
    }

    pub fn compress_signal_index_cache(&self) -> bool {
        self.0 & COMPRESS_SIGNAL_INDEX_CACHE != 0
    }

    pub fn compress_metadata(&self) -> bool {
        self.0 & COMPRESS_METADATA != 0
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.version() != 0 {
            bail!("unsupported protocol version {}", self.version());
        }
        if !self.use_common_serialization_format() {
            bail!("only the common serialization format is supported");
        }
        Ok(())
    }
}
