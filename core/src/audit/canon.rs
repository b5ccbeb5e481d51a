//! Canonical byte encoding for the forensic digests.
//!
//! Layout: entries are `key 0x1F value 0x1E` with keys sorted; strings are
//! UTF-8 with trailing whitespace stripped; integers are big-endian
//! fixed-width; booleans are one byte. Fractional settings are scaled to
//! integer micro-units before encoding so no float formatting ever reaches
//! the digest. Re-serialising the same inputs always yields the same bytes.

use sha2::{Digest, Sha256};

use crate::config::RunOptions;

const UNIT_SEP: u8 = 0x1f;
const RECORD_SEP: u8 = 0x1e;

/// Separator between source ids inside the context digest.
pub const CONTEXT_ID_SEPARATOR: &str = "|";

#[derive(Default)]
pub struct CanonicalWriter {
    entries: Vec<(String, Vec<u8>)>,
}

impl CanonicalWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn str_field(&mut self, key: &str, value: &str) -> &mut Self {
        self.entries
            .push((key.to_string(), value.trim_end().as_bytes().to_vec()));
        self
    }

    pub fn u64_field(&mut self, key: &str, value: u64) -> &mut Self {
        self.entries
            .push((key.to_string(), value.to_be_bytes().to_vec()));
        self
    }

    pub fn bool_field(&mut self, key: &str, value: bool) -> &mut Self {
        self.entries.push((key.to_string(), vec![u8::from(value)]));
        self
    }

    pub fn bytes_field(&mut self, key: &str, value: Vec<u8>) -> &mut Self {
        self.entries.push((key.to_string(), value));
        self
    }

    /// Serialise with keys sorted. Duplicate keys keep insertion order
    /// between themselves, but canonical callers never produce duplicates.
    pub fn finish(mut self) -> Vec<u8> {
        self.entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        let mut out = Vec::new();
        for (key, value) in self.entries {
            out.extend_from_slice(key.as_bytes());
            out.push(UNIT_SEP);
            out.extend_from_slice(&value);
            out.push(RECORD_SEP);
        }
        out
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whitespace-normalised form of the user query: trimmed, internal runs
/// collapsed to single spaces.
pub fn normalise_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical bytes of the configuration bundle, cost ceiling resolved.
pub fn canonical_options(options: &RunOptions, cost_ceiling_micros: u64) -> Vec<u8> {
    let mut writer = CanonicalWriter::new();
    writer
        .bool_field("use_internal_rag", options.use_internal_rag)
        .u64_field("k_total", options.k_total as u64)
        .bool_field("enable_personalisation", options.enable_personalisation)
        .u64_field(
            "personalisation_alpha_micros",
            (f64::from(options.personalisation_alpha) * 1_000_000.0).round() as u64,
        )
        .u64_field("max_iterations", u64::from(options.max_iterations))
        .u64_field("deadline_ms", options.deadline_ms)
        .u64_field("cost_ceiling_micros", cost_ceiling_micros)
        .str_field(
            "pii_strategy",
            match options.pii_strategy {
                crate::pii::RedactionStrategy::Typed => "typed",
                crate::pii::RedactionStrategy::Hashed => "hashed",
                crate::pii::RedactionStrategy::Masked => "masked",
            },
        )
        .str_field("document_type", &options.document_type);

    // BTreeMap iteration is already key-sorted.
    let prefs = options
        .model_preferences
        .iter()
        .map(|(kind, model)| format!("{}={}", kind.as_str(), model))
        .collect::<Vec<_>>()
        .join(",");
    writer.str_field("model_preferences", &prefs);

    writer.finish()
}

/// Input digest over (normalised query ∥ sorted principal ids ∥ canonical
/// configuration bundle).
pub fn input_hash(
    query: &str,
    tenant_id: &str,
    user_id: Option<&str>,
    options: &RunOptions,
    cost_ceiling_micros: u64,
) -> String {
    let mut principals: Vec<&str> = vec![tenant_id];
    if let Some(user) = user_id {
        principals.push(user);
    }
    principals.sort_unstable();

    let mut writer = CanonicalWriter::new();
    writer
        .str_field("query", &normalise_query(query))
        .str_field("principals", &principals.join(CONTEXT_ID_SEPARATOR))
        .bytes_field("config", canonical_options(options, cost_ceiling_micros));
    sha256_hex(&writer.finish())
}

/// Output digest over the final text.
pub fn output_hash(final_text: &str) -> String {
    sha256_hex(final_text.as_bytes())
}

/// Context digest over the sorted, deduplicated consumed source ids.
pub fn context_hash<I, S>(source_ids: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ids: Vec<String> = source_ids
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    sha256_hex(ids.join(CONTEXT_ID_SEPARATOR).as_bytes())
}
