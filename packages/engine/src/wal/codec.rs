use std::io::{Read, Write};

use crate::event::Event;
use crate::ParqueError;

/// Gzip stream magic; used to detect compressed batches on disk.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0..2] == GZIP_MAGIC
}

/// Serializes an event batch canonically and gzip-compresses it.
pub fn encode_batch(events: &[Event]) -> Result<Vec<u8>, ParqueError> {
    let raw = serde_json::to_vec(events)?;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// Inverse of `encode_batch`. Uncompressed JSON batches (from older
/// segments) are accepted as-is.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Event>, ParqueError> {
    let raw = if is_compressed(bytes) {
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|error| ParqueError::fatal(format!("wal batch decompress: {error}")))?;
        out
    } else {
        bytes.to_vec()
    };
    serde_json::from_slice(&raw)
        .map_err(|error| ParqueError::fatal(format!("wal batch parse: {error}")))
}

#[cfg(test)]
mod tests {
    use super::{decode_batch, encode_batch, is_compressed};
    use crate::event::{Event, EventOp};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn event(seq: u64, title: &str) -> Event {
        Event {
            id: format!("evt-{seq}"),
            seq,
            ts: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            op: EventOp::Create,
            target: format!("posts:p-{seq}"),
            before: None,
            after: Some(json!({"title": title, "status": "published"})),
            actor: "writer".to_string(),
            metadata: None,
        }
    }

    #[test]
    fn batches_round_trip_exactly() {
        let events: Vec<Event> = (0..50).map(|i| event(i, "entry")).collect();
        let encoded = encode_batch(&events).unwrap();
        assert!(is_compressed(&encoded));
        assert_eq!(decode_batch(&encoded).unwrap(), events);
    }

    #[test]
    fn typical_batches_shrink_at_least_thirty_percent() {
        let events: Vec<Event> = (0..50)
            .map(|i| event(i, &format!("post number {i} with a descriptive title")))
            .collect();
        let raw = serde_json::to_vec(&events).unwrap();
        let encoded = encode_batch(&events).unwrap();
        assert!(
            (encoded.len() as f64) <= (raw.len() as f64) * 0.7,
            "expected >=30% reduction, got {} -> {}",
            raw.len(),
            encoded.len()
        );
    }

    #[test]
    fn repetitive_batches_shrink_at_least_forty_percent() {
        let events: Vec<Event> = (0..100).map(|i| event(i, "identical title")).collect();
        let raw = serde_json::to_vec(&events).unwrap();
        let encoded = encode_batch(&events).unwrap();
        assert!((encoded.len() as f64) <= (raw.len() as f64) * 0.6);
    }

    #[test]
    fn unicode_and_control_characters_survive() {
        let mut special = event(0, "snowman ☃, emoji 🎉, control \u{0001}\u{001f}, quote \"");
        special.after = Some(json!({"text": "línea\nnueva\ttab\u{0000}null"}));
        let encoded = encode_batch(std::slice::from_ref(&special)).unwrap();
        let decoded = decode_batch(&encoded).unwrap();
        assert_eq!(decoded, vec![special]);
    }

    #[test]
    fn plain_json_batches_still_decode() {
        let events = vec![event(1, "legacy")];
        let raw = serde_json::to_vec(&events).unwrap();
        assert!(!is_compressed(&raw));
        assert_eq!(decode_batch(&raw).unwrap(), events);
    }
}
