//! Deterministic fingerprints for compiled engine stages.

use std::fmt;

use sha1::{Digest, Sha1};

use super::settings::{stem_of, AuxiliaryWeight, AuxiliaryWeights};
use super::variant::Stage;

/// Hex digest naming one compiled stage directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_stage(stage: Stage, size: u32, weights: &AuxiliaryWeights) -> Self {
        if stage.carries_weights() {
            Self::digest(&canonical_string(size, weights))
        } else {
            Self::digest(&size.to_string())
        }
    }

    fn digest(input: &str) -> Self {
        let digest = Sha1::digest(input.as_bytes());
        CacheKey(format!("{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn join_weights(weights: &[AuxiliaryWeight]) -> String {
    let mut parts: Vec<(String, f32)> = weights.iter().map(|w| (w.key_name(), w.weight)).collect();
    parts.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
    parts
        .iter()
        .map(|(name, weight)| format!("{name}={weight}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// `size-lora-lycoris-inversion`, every list sorted so input order never matters.
pub fn canonical_string(size: u32, weights: &AuxiliaryWeights) -> String {
    let mut inversion: Vec<String> = weights.inversion.iter().map(String::as_str).map(stem_of).collect();
    inversion.sort();

    [
        size.to_string(),
        join_weights(&weights.lora),
        join_weights(&weights.lycoris),
        inversion.join(":"),
    ]
    .join("-")
}
