//! JSON decoding for the traffic feed payload.

use crate::error::PipelineError;
use crate::record::RawRecord;

/// Decodes a feed body into its rows.
///
/// # Errors
///
/// Returns [`PipelineError::Network`] if the bytes are not a JSON array of
/// objects; a malformed body is treated like any other failed download.
pub fn parse_records(bytes: &[u8]) -> Result<Vec<RawRecord>, PipelineError> {
    serde_json::from_slice(bytes)
        .map_err(|e| PipelineError::Network(format!("unexpected feed payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_array() {
        let records = parse_records(b"[]").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_parse_invalid_bytes() {
        let invalid_bytes = vec![0xFF, 0xFE, 0x00, 0x01];
        assert!(parse_records(&invalid_bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_array_of_scalars() {
        assert!(parse_records(b"[1, 2, 3]").is_err());
    }

    #[test]
    fn test_parse_keeps_loosely_typed_values() {
        let records = parse_records(br#"[{"id": "4", "speed": "12.5", "borough": null}]"#).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["speed"], "12.5");
        assert!(records[0]["borough"].is_null());
    }
}
