//! Journal record compression.
//!
//! The journal can run its record payloads through a pluggable codec;
//! the chosen kind is recorded in the environment header so a foreign
//! file is detected at open. Only the identity codec ships in-core;
//! real codecs are external collaborators registered under the stable
//! kind ids below.

use crate::errors::{HamError, Result};

/// Stable codec ids, persisted in the environment header.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum CompressorKind {
    #[default]
    None = 0,
    Lzf = 1,
    Snappy = 2,
    Zlib = 3,
    Lzo = 4,
}

impl CompressorKind {
    pub(crate) fn from_u8(v: u8) -> Option<CompressorKind> {
        match v {
            0 => Some(CompressorKind::None),
            1 => Some(CompressorKind::Lzf),
            2 => Some(CompressorKind::Snappy),
            3 => Some(CompressorKind::Zlib),
            4 => Some(CompressorKind::Lzo),
            _ => None,
        }
    }

    /// True when an implementation is linked into this build.
    pub(crate) fn is_available(self) -> bool {
        self == CompressorKind::None
    }
}

/// Record payload codec.
pub trait Compressor: Send {
    fn kind(&self) -> CompressorKind;

    fn compress(&self, data: &[u8]) -> Vec<u8>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// The identity codec.
pub(crate) struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn kind(&self) -> CompressorKind {
        CompressorKind::None
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Instantiates the codec registered under `kind`.
pub(crate) fn for_kind(kind: CompressorKind) -> Result<Box<dyn Compressor>> {
    match kind {
        CompressorKind::None => Ok(Box::new(IdentityCompressor)),
        _ => Err(HamError::NotImplemented),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            CompressorKind::None,
            CompressorKind::Lzf,
            CompressorKind::Snappy,
            CompressorKind::Zlib,
            CompressorKind::Lzo,
        ] {
            assert_eq!(CompressorKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(CompressorKind::from_u8(99), None);
    }

    #[test]
    fn test_only_identity_is_available() {
        assert!(CompressorKind::None.is_available());
        assert!(!CompressorKind::Zlib.is_available());
        assert!(for_kind(CompressorKind::Snappy).is_err());

        let codec = for_kind(CompressorKind::None).unwrap();
        let data = b"payload".to_vec();
        assert_eq!(codec.decompress(&codec.compress(&data)).unwrap(), data);
    }
}
