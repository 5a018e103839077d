//! Document codecs.
//!
//! Tiers store opaque bytes; a [`DocumentCodec`] converts between those bytes
//! and [`Document`]s. The codec is injected configuration and is never
//! consulted by the tier layer itself.

use crate::{Document, StorageError, StratumResult};
use std::fmt::Debug;

/// Two-way conversion between documents and stored bytes.
pub trait DocumentCodec: Debug + Send + Sync {
    /// Encode a document into bytes.
    fn encode(&self, document: &Document) -> StratumResult<Vec<u8>>;

    /// Decode bytes into a document.
    fn decode(&self, bytes: &[u8]) -> StratumResult<Document>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl DocumentCodec for JsonCodec {
    fn encode(&self, document: &Document) -> StratumResult<Vec<u8>> {
        serde_json::to_vec(document).map_err(|e| {
            StorageError::Codec {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn decode(&self, bytes: &[u8]) -> StratumResult<Document> {
        serde_json::from_slice(bytes).map_err(|e| {
            StorageError::Codec {
                reason: e.to_string(),
            }
            .into()
        })
    }
}
