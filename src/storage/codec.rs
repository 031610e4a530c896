//! Document codec: one JSON object per entity file.

use crate::core::{Document, Result, StateError};

/// Decodes a stored document. Empty (or whitespace-only) input is an empty
/// document, not an error.
pub fn decode(bytes: &[u8]) -> Result<Document> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Document::new());
    }
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|err| StateError::DecodeError(format!("malformed document: {}", err)))?;
    Document::from_value(value)
}

/// Encodes a document for write-through. Pretty-printed so the files stay
/// editable by hand; byte stability across versions is not promised.
pub fn encode(document: &Document) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(document)
        .map_err(|err| StateError::DecodeError(format!("failed to encode document: {}", err)))
}
