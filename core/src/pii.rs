//! PII detection and redaction.
//!
//! Eight kinds of sensitive spans are recognised, tuned for Brazilian legal
//! documents (CPF, CNPJ, RG, CEP and bank-branch notation). Tax and
//! corporate ids are gated by verifier-digit arithmetic: a match whose check
//! digits fail is downgraded to low confidence and left out of strict
//! redaction. Confidence for the remaining kinds is the pattern's base
//! specificity scaled by proximity to a kind-specific keyword.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Detections below this confidence are reported but never redacted.
pub const STRICT_REDACTION_MIN_CONFIDENCE: f32 = 0.5;

/// How many characters before a span are searched for a context keyword.
const KEYWORD_WINDOW: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    TaxId,
    CorporateId,
    Email,
    Phone,
    NationalId,
    Address,
    CardNumber,
    BankAccount,
}

impl PiiKind {
    /// Label used inside redaction tokens, e.g. `[CPF_REDACTED]`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TaxId => "CPF",
            Self::CorporateId => "CNPJ",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::NationalId => "RG",
            Self::Address => "ADDRESS",
            Self::CardNumber => "CARD",
            Self::BankAccount => "BANK_ACCOUNT",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::TaxId => &["cpf"],
            Self::CorporateId => &["cnpj"],
            Self::Email => &["email", "e-mail", "contato"],
            Self::Phone => &["tel", "telefone", "fone", "celular"],
            Self::NationalId => &["rg", "identidade"],
            Self::Address => &["endereço", "endereco", "residente", "cep"],
            Self::CardNumber => &["cartão", "cartao", "card"],
            Self::BankAccount => &["conta", "agência", "agencia", "banco"],
        }
    }

    fn base_confidence(&self) -> f32 {
        match self {
            // Check-digit kinds are scored separately.
            Self::TaxId | Self::CorporateId => 0.95,
            Self::Email => 0.90,
            Self::CardNumber => 0.85,
            Self::Phone => 0.80,
            Self::NationalId | Self::BankAccount => 0.75,
            Self::Address => 0.70,
        }
    }
}

/// How a detected span is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedactionStrategy {
    /// `[<KIND>_REDACTED]`
    #[default]
    Typed,
    /// `[<KIND>_<first 8 hex of SHA-256>]`; stable for equal inputs.
    Hashed,
    /// One `*` per character, length preserving.
    Masked,
}

/// One sensitive span found in a processed string.
///
/// Offsets are byte positions into the scanned string. `redaction` is filled
/// once a strategy has been applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiDetection {
    pub kind: PiiKind,
    pub start: usize,
    pub end: usize,
    pub confidence: f32,
    pub check_digits_valid: Option<bool>,
    pub redaction: Option<String>,
}

/// All detections observed over the course of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PiiReport {
    pub detections: Vec<PiiDetection>,
}

impl PiiReport {
    pub fn extend(&mut self, detections: Vec<PiiDetection>) {
        self.detections.extend(detections);
    }

    pub fn total(&self) -> usize {
        self.detections.len()
    }

    pub fn of_kind(&self, kind: PiiKind) -> impl Iterator<Item = &PiiDetection> {
        self.detections.iter().filter(move |d| d.kind == kind)
    }
}

pub struct PiiDetector {
    patterns: Vec<(PiiKind, Regex)>,
}

impl Default for PiiDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiDetector {
    pub fn new() -> Self {
        let table: &[(PiiKind, &str)] = &[
            (PiiKind::TaxId, r"\b\d{3}\.\d{3}\.\d{3}-\d{2}\b"),
            (PiiKind::TaxId, r"\b\d{11}\b"),
            (PiiKind::CorporateId, r"\b\d{2}\.\d{3}\.\d{3}/\d{4}-\d{2}\b"),
            (PiiKind::CorporateId, r"\b\d{14}\b"),
            (
                PiiKind::Email,
                r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
            ),
            (PiiKind::Phone, r"\(\d{2}\)\s?\d{4,5}-?\d{4}\b"),
            (PiiKind::Phone, r"\b\d{2}\s\d{4,5}-\d{4}\b"),
            (
                PiiKind::NationalId,
                r"(?i)\bRG\s*:?\s*\d{1,2}\.\d{3}\.\d{3}-?\d{1,2}\b",
            ),
            (
                PiiKind::Address,
                r"(?i)\b(?:Rua|Av\.?|Avenida|Travessa|Alameda)\s+[^,\n]{10,50}",
            ),
            (PiiKind::Address, r"(?i)\bCEP\s*:?\s*\d{5}-?\d{3}\b"),
            (PiiKind::CardNumber, r"\b(?:\d{4}[ -]){3}\d{4}\b"),
            (PiiKind::CardNumber, r"\b\d{16}\b"),
            (
                PiiKind::BankAccount,
                r"(?i)\bAg(?:ência|encia)?\s*\.?\s*:?\s*\d{3,4}-?\d?\s*,?\s*C/C\s*:?\s*\d{4,}-?\d\b",
            ),
            (PiiKind::BankAccount, r"(?i)\bConta\s*:?\s*\d{4,}-?\d\b"),
        ];
        let patterns = table
            .iter()
            .map(|(kind, pat)| (*kind, Regex::new(pat).expect("static PII pattern")))
            .collect();
        Self { patterns }
    }

    /// Scan a string and return all detections, deduplicated and ordered by
    /// position. Overlapping spans collapse to the higher-confidence match.
    pub fn scan(&self, text: &str) -> Vec<PiiDetection> {
        if text.is_empty() {
            return Vec::new();
        }
        let lower = text.to_lowercase();

        let mut raw: Vec<PiiDetection> = Vec::new();
        for (kind, pattern) in &self.patterns {
            for m in pattern.find_iter(text) {
                raw.push(self.score(*kind, m.as_str(), m.start(), m.end(), &lower));
            }
        }

        raw.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(b.end.cmp(&a.end))
                .then(b.confidence.total_cmp(&a.confidence))
        });

        let mut out: Vec<PiiDetection> = Vec::new();
        for det in raw {
            match out.last_mut() {
                Some(last) if det.start < last.end => {
                    if det.confidence > last.confidence {
                        *last = det;
                    }
                }
                _ => out.push(det),
            }
        }
        out
    }

    fn score(
        &self,
        kind: PiiKind,
        value: &str,
        start: usize,
        end: usize,
        lower_text: &str,
    ) -> PiiDetection {
        let (confidence, check_digits_valid) = match kind {
            PiiKind::TaxId => {
                let valid = validate_cpf(value);
                (if valid { 0.95 } else { 0.40 }, Some(valid))
            }
            PiiKind::CorporateId => {
                let valid = validate_cnpj(value);
                (if valid { 0.95 } else { 0.40 }, Some(valid))
            }
            _ => {
                // Lowercasing can shift byte offsets on multi-byte text, so
                // both window bounds are clamped to char boundaries.
                let window_end = floor_char_boundary(lower_text, start);
                let window_start =
                    floor_char_boundary(lower_text, window_end.saturating_sub(KEYWORD_WINDOW));
                let window = &lower_text[window_start..window_end];
                let near_keyword = kind.keywords().iter().any(|k| window.contains(k));
                let factor = if near_keyword { 1.0 } else { 0.85 };
                (kind.base_confidence() * factor, None)
            }
        };
        PiiDetection {
            kind,
            start,
            end,
            confidence,
            check_digits_valid,
            redaction: None,
        }
    }
}

/// Produce a redacted view of `text` under the given strategy.
///
/// Only detections at or above [`STRICT_REDACTION_MIN_CONFIDENCE`] are
/// rewritten; the returned detections carry the applied replacement. Spans
/// are substituted back-to-front so earlier offsets stay valid.
pub fn redact(
    detector: &PiiDetector,
    text: &str,
    strategy: RedactionStrategy,
) -> (String, Vec<PiiDetection>) {
    let mut detections = detector.scan(text);
    let mut redacted = text.to_string();

    for det in detections.iter_mut().rev() {
        if det.confidence < STRICT_REDACTION_MIN_CONFIDENCE {
            continue;
        }
        let original = &text[det.start..det.end];
        let replacement = replacement_for(det.kind, original, strategy);
        redacted.replace_range(det.start..det.end, &replacement);
        det.redaction = Some(replacement);
    }

    (redacted, detections)
}

fn replacement_for(kind: PiiKind, original: &str, strategy: RedactionStrategy) -> String {
    match strategy {
        RedactionStrategy::Typed => format!("[{}_REDACTED]", kind.label()),
        RedactionStrategy::Hashed => {
            let digest = Sha256::digest(original.as_bytes());
            format!("[{}_{}]", kind.label(), &hex::encode(digest)[..8])
        }
        RedactionStrategy::Masked => "*".repeat(original.chars().count()),
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut i = index.min(text.len());
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn digits_of(value: &str) -> Vec<u32> {
    value.chars().filter_map(|c| c.to_digit(10)).collect()
}

fn mod11_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let total: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    let remainder = total % 11;
    if remainder < 2 {
        0
    } else {
        11 - remainder
    }
}

/// CPF verifier-digit arithmetic (two mod-11 check digits).
pub fn validate_cpf(value: &str) -> bool {
    let d = digits_of(value);
    if d.len() != 11 || d.iter().all(|&x| x == d[0]) {
        return false;
    }
    let first_weights: Vec<u32> = (2..=10).rev().collect();
    let second_weights: Vec<u32> = (2..=11).rev().collect();
    d[9] == mod11_digit(&d[..9], &first_weights) && d[10] == mod11_digit(&d[..10], &second_weights)
}

/// CNPJ verifier-digit arithmetic.
pub fn validate_cnpj(value: &str) -> bool {
    let d = digits_of(value);
    if d.len() != 14 {
        return false;
    }
    const FIRST: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    const SECOND: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
    d[12] == mod11_digit(&d[..12], &FIRST) && d[13] == mod11_digit(&d[..13], &SECOND)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_cpf_passes_check_digits() {
        assert!(validate_cpf("123.456.789-09"));
        assert!(validate_cpf("12345678909"));
        assert!(!validate_cpf("123.456.789-00"));
        assert!(!validate_cpf("111.111.111-11"));
    }

    #[test]
    fn valid_cnpj_passes_check_digits() {
        assert!(validate_cnpj("11.222.333/0001-81"));
        assert!(!validate_cnpj("11.222.333/0001-80"));
    }

    #[test]
    fn valid_tax_id_scores_high_invalid_scores_low() {
        let detector = PiiDetector::new();
        let hits = detector.scan("CPF 123.456.789-09 e CPF 123.456.789-00");
        assert_eq!(hits.len(), 2);
        assert!(hits[0].confidence >= 0.9);
        assert_eq!(hits[0].check_digits_valid, Some(true));
        assert!(hits[1].confidence < 0.5);
        assert_eq!(hits[1].check_digits_valid, Some(false));
    }

    #[test]
    fn keyword_proximity_raises_confidence() {
        let detector = PiiDetector::new();
        let near = detector.scan("email: joao@exemplo.com.br");
        let far = detector.scan("escreva para joao@exemplo.com.br");
        assert_eq!(near[0].kind, PiiKind::Email);
        assert!(near[0].confidence > far[0].confidence);
    }

    #[test]
    fn typed_redaction_replaces_span() {
        let detector = PiiDetector::new();
        let (redacted, detections) = redact(
            &detector,
            "Contratante: CPF 123.456.789-09, fim.",
            RedactionStrategy::Typed,
        );
        assert!(redacted.contains("[CPF_REDACTED]"));
        assert!(!redacted.contains("123.456.789-09"));
        assert_eq!(
            detections[0].redaction.as_deref(),
            Some("[CPF_REDACTED]")
        );
    }

    #[test]
    fn hashed_redaction_is_stable_within_a_run() {
        let detector = PiiDetector::new();
        let text = "CPF 123.456.789-09 citado; novamente CPF 123.456.789-09.";
        let (redacted, _) = redact(&detector, text, RedactionStrategy::Hashed);
        let tokens: Vec<&str> = redacted
            .split_whitespace()
            .filter(|t| t.starts_with("[CPF_"))
            .collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].trim_end_matches(|c: char| !c.is_ascii_hexdigit() && c != ']'),
                   tokens[1].trim_end_matches(|c: char| !c.is_ascii_hexdigit() && c != ']'));
    }

    #[test]
    fn masked_redaction_preserves_length() {
        let detector = PiiDetector::new();
        let (redacted, _) = redact(
            &detector,
            "tel (11) 99999-9999",
            RedactionStrategy::Masked,
        );
        assert_eq!(redacted.len(), "tel (11) 99999-9999".len());
        assert!(redacted.contains("**"));
    }

    #[test]
    fn invalid_check_digits_escape_strict_redaction() {
        let detector = PiiDetector::new();
        let (redacted, _) = redact(
            &detector,
            "protocolo 123.456.789-00 segue",
            RedactionStrategy::Typed,
        );
        // Downgraded match stays in the text.
        assert!(redacted.contains("123.456.789-00"));
    }

    #[test]
    fn overlapping_matches_collapse_to_strongest() {
        let detector = PiiDetector::new();
        // An 11-digit run is both a bare CPF candidate and phone-shaped.
        let hits = detector.scan("contato 12345678909");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn bank_account_and_card_detected() {
        let detector = PiiDetector::new();
        let hits = detector.scan("Ag: 1234-5 C/C: 67890-1 e cartão 4111 1111 1111 1111");
        let kinds: Vec<PiiKind> = hits.iter().map(|h| h.kind).collect();
        assert!(kinds.contains(&PiiKind::BankAccount));
        assert!(kinds.contains(&PiiKind::CardNumber));
    }
}
