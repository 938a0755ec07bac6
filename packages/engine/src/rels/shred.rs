use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::ParqueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    Exact,
    Fuzzy,
}

impl MatchMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
        }
    }
}

/// Edge metadata split for storage: `match_mode` and `similarity` become
/// top-level columns (so match-quality predicates push down to row-group
/// statistics); everything else rides in the residual variant blob.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShreddedMetadata {
    pub match_mode: Option<MatchMode>,
    pub similarity: Option<f64>,
    pub residual: Map<String, JsonValue>,
}

/// Splits a metadata map into shredded columns and a residual, validating
/// the match-quality invariants:
/// - `exact` requires similarity absent or exactly 1.0
/// - `fuzzy` requires similarity present in [0, 1]
pub fn extract_metadata(metadata: &JsonValue) -> Result<ShreddedMetadata, ParqueError> {
    let Some(map) = metadata.as_object() else {
        return Err(ParqueError::invariant("relationship metadata must be an object"));
    };

    let mut residual = map.clone();
    let match_mode = match residual.remove("matchMode") {
        None => None,
        Some(JsonValue::String(mode)) => match mode.as_str() {
            "exact" => Some(MatchMode::Exact),
            "fuzzy" => Some(MatchMode::Fuzzy),
            other => {
                return Err(ParqueError::invariant(format!(
                    "unknown matchMode '{other}'"
                )))
            }
        },
        Some(other) => {
            return Err(ParqueError::invariant(format!(
                "matchMode must be a string, got {other}"
            )))
        }
    };
    let similarity = match residual.remove("similarity") {
        None => None,
        Some(value) => Some(value.as_f64().ok_or_else(|| {
            ParqueError::invariant(format!("similarity must be a number, got {value}"))
        })?),
    };

    validate_match_quality(match_mode, similarity)?;
    Ok(ShreddedMetadata {
        match_mode,
        similarity,
        residual,
    })
}

pub fn validate_match_quality(
    match_mode: Option<MatchMode>,
    similarity: Option<f64>,
) -> Result<(), ParqueError> {
    match match_mode {
        Some(MatchMode::Exact) => {
            if let Some(similarity) = similarity {
                if similarity != 1.0 {
                    return Err(ParqueError::invariant(format!(
                        "exact match requires similarity 1.0, got {similarity}"
                    )));
                }
            }
        }
        Some(MatchMode::Fuzzy) => {
            let Some(similarity) = similarity else {
                return Err(ParqueError::invariant(
                    "fuzzy match requires a similarity score",
                ));
            };
            if !(0.0..=1.0).contains(&similarity) {
                return Err(ParqueError::invariant(format!(
                    "fuzzy similarity must be in [0, 1], got {similarity}"
                )));
            }
        }
        None => {
            if similarity.is_some() {
                return Err(ParqueError::invariant(
                    "similarity requires a matchMode",
                ));
            }
        }
    }
    Ok(())
}

/// Inverse of `extract_metadata`: `merge_shredded(extract(m)) == m`.
pub fn merge_shredded(shredded: &ShreddedMetadata) -> JsonValue {
    let mut map = shredded.residual.clone();
    if let Some(mode) = shredded.match_mode {
        map.insert(
            "matchMode".to_string(),
            JsonValue::String(mode.as_str().to_string()),
        );
    }
    if let Some(similarity) = shredded.similarity {
        if let Some(number) = serde_json::Number::from_f64(similarity) {
            map.insert("similarity".to_string(), JsonValue::Number(number));
        }
    }
    JsonValue::Object(map)
}
