//! Compression boundary for world and partition blobs
//!
//! The session layer never looks inside these blobs; it only runs them
//! through whatever codec the embedding application supplies.

use std::fmt::Debug;

pub trait Codec: Send + Sync + Debug {
    fn compress(&self, data: &[u8]) -> Vec<u8>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("codec failure: {0}")]
pub struct CodecError(pub String);

/// Passes bytes through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}
