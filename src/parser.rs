//! Hybrid parser: robust extraction of structured data from raw LLM text.
//!
//! Input is raw LLM text. Steps, in order (§4.4):
//! 1. Strip thinking tokens.
//! 2. Strip markdown fences.
//! 3. Extract a leading `PATIENT\t<name>` line, if present.
//! 4. Attempt JSON parse.
//! 5. On JSON failure, attempt TSV parse.
//! 6. If neither succeeds, return [`ParsedOutput::Raw`].
//!
//! The parser is lossless with respect to the raw text: callers retain a
//! copy of the original for `raw_extraction` regardless of parse outcome.

use serde::{Deserialize, Serialize};

/// Document modality, as classified by C2+C3.1 and consumed by the
/// extractor/parser/firewall stages. Modeled as a tagged variant rather
/// than runtime subclassing (§9 "Dynamic dispatch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    /// Laboratory report.
    Lab,
    /// Radiology report.
    Radiology,
    /// Medication prescription.
    Prescription,
    /// Vitals sheet.
    Vitals,
    /// Classification failed or returned an unrecognized token.
    Unknown,
}

impl Modality {
    /// Parse the classifier's single-token response.
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_uppercase().as_str() {
            "LAB" => Self::Lab,
            "RADIOLOGY" => Self::Radiology,
            "PRESCRIPTION" => Self::Prescription,
            "VITALS" => Self::Vitals,
            _ => Self::Unknown,
        }
    }
}

/// The result of classifying a document's modality (§3 ClassificationResult).
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    /// Detected modality.
    pub modality: Modality,
    /// Model-reported confidence, or `1.0` when a single label is returned.
    pub confidence: f32,
}

/// A single extracted measurement or structured entry (§3 ExtractedRow).
///
/// For non-LAB/VITALS modalities (radiology narrative, prescription
/// entries) the same shape is reused with `unit`/`reference_range`/`flag`
/// left `None` and the semantics carried in `value`/`test_name`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRow {
    /// Canonicalized or raw test/field name.
    pub test_name: String,
    /// Extracted value, numeric or textual.
    pub value: RowValue,
    /// Unit, if any.
    pub unit: Option<String>,
    /// Reference range, if any.
    pub reference_range: Option<ReferenceRange>,
    /// Abnormal-value flag.
    pub flag: Option<Flag>,
    /// Row index in the raw table, for audit.
    pub source_span: Option<usize>,
}

/// A row's value: numeric or free text.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    /// Numeric measurement.
    Number(f64),
    /// Free-text value.
    Text(String),
}

impl RowValue {
    /// The numeric value, if this is a [`RowValue::Number`].
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

/// Low/high reference range, or free text when not decomposable.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceRange {
    /// Numeric low/high bounds.
    Bounds {
        /// Lower bound.
        low: f64,
        /// Upper bound.
        high: f64,
    },
    /// Free-text range (e.g. "negative").
    Text(String),
}

/// Abnormal-value flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// High.
    H,
    /// Low.
    L,
    /// Normal.
    N,
}

/// Patient identity extracted from the document, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientIdentity {
    /// Given name.
    pub given: Option<String>,
    /// Family name.
    pub family: Option<String>,
}

/// A prescription entry (PRESCRIPTION modality).
#[derive(Debug, Clone, Deserialize)]
pub struct MedicationEntry {
    /// Medication name.
    pub medication: String,
    /// Dosage text.
    pub dosage: String,
    /// Frequency, preserved verbatim (e.g. "bid").
    pub frequency: String,
    /// Duration text.
    pub duration: String,
}

/// A radiology narrative (RADIOLOGY modality).
#[derive(Debug, Clone, Deserialize)]
pub struct RadiologyNarrative {
    /// Findings section.
    pub finding: String,
    /// Impression/conclusion section.
    pub impression: String,
}

/// The structured outcome of parsing one extraction response.
///
/// Every variant but [`ParsedOutput::Raw`] carries the raw patient name
/// line (§4.4 step 3.5), if the extractor emitted one -- see
/// [`extract_patient_line`]. It is passed through uncleaned; honorific
/// stripping and the given/family split happen downstream in
/// `firewall::strip_patient_identity` (§4.5 step 8).
#[derive(Clone)]
pub enum ParsedOutput {
    /// Tabular rows (LAB/VITALS).
    Rows(Vec<ExtractedRow>, Option<String>),
    /// Prescription entries (PRESCRIPTION).
    Medications(Vec<MedicationEntry>, Option<String>),
    /// Radiology narrative (RADIOLOGY).
    Radiology(RadiologyNarrative, Option<String>),
    /// Neither JSON nor TSV parse succeeded.
    Raw(String),
}

/// A machine-readable validation/parse error entry (§4.5, §4.7).
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Path to the offending field/row.
    pub path: String,
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Default thinking-token delimiter pair (§4.4 step 1).
const DEFAULT_THINK_OPEN: &str = "<unused94>";
const DEFAULT_THINK_CLOSE: &str = "<unused95>";

/// Strip chain-of-thought delimited substrings, non-greedily, across line
/// boundaries.
pub fn strip_thinking_tokens(text: &str) -> String {
    strip_thinking_tokens_with(text, DEFAULT_THINK_OPEN, DEFAULT_THINK_CLOSE)
}

/// Strip thinking tokens using a configurable delimiter pair.
pub fn strip_thinking_tokens_with(text: &str, open: &str, close: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find(open) {
            Some(start) => {
                result.push_str(&rest[..start]);
                let after_open = &rest[start + open.len()..];
                match after_open.find(close) {
                    Some(end) => {
                        rest = &after_open[end + close.len()..];
                    }
                    None => {
                        // unterminated: drop to end of string
                        rest = "";
                    }
                }
            }
            None => {
                result.push_str(rest);
                break;
            }
        }
    }
    result
}

/// Strip surrounding markdown code fences, tolerating a `json` language hint.
pub fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest
            .strip_prefix("json")
            .or_else(|| rest.strip_prefix("JSON"))
            .unwrap_or(rest);
        let rest = rest.strip_prefix('\n').unwrap_or(rest);
        let rest = rest.strip_suffix("```").unwrap_or(rest);
        return rest.trim().to_owned();
    }
    trimmed.to_owned()
}

const LAB_HEADER: &[&str] = &["TEST", "VALUE", "UNIT", "RANGE", "FLAG"];
const VITALS_HEADER: &[&str] = LAB_HEADER;

/// Pull a leading `PATIENT\t<name>` (or `PATIENT: <name>`) line off `text`,
/// per the convention every extractor prompt is instructed to emit (§4.4
/// step 3.5). Returns the raw name (empty after the tab/colon means "no
/// name visible", reported as `None`) and the remaining text with that
/// line removed.
fn extract_patient_line(text: &str) -> (Option<String>, String) {
    let mut lines = text.lines();
    match lines.next() {
        Some(first) if first.trim_start().to_uppercase().starts_with("PATIENT") => {
            let rest = first.trim_start()[7..].trim_start_matches([':', '\t']).trim();
            let name = if rest.is_empty() { None } else { Some(rest.to_owned()) };
            (name, lines.collect::<Vec<_>>().join("\n"))
        }
        _ => (None, text.to_owned()),
    }
}

/// Parse raw LLM text for the given modality, applying steps 1-6 of §4.4.
pub fn parse(raw: &str, modality: Modality) -> ParsedOutput {
    let stripped = strip_thinking_tokens(raw);
    let unfenced = strip_markdown_fences(&stripped);
    let (patient_name, body) = extract_patient_line(&unfenced);

    match modality {
        Modality::Prescription => {
            if let Ok(meds) = serde_json::from_str::<Vec<MedicationEntry>>(&body) {
                return ParsedOutput::Medications(meds, patient_name);
            }
        }
        Modality::Radiology => {
            if let Ok(narrative) = serde_json::from_str::<RadiologyNarrative>(&body) {
                return ParsedOutput::Radiology(narrative, patient_name);
            }
        }
        Modality::Lab | Modality::Vitals | Modality::Unknown => {
            if let Some(rows) = parse_tsv(&body, header_for(modality)) {
                return ParsedOutput::Rows(rows, patient_name);
            }
        }
    }

    // Modality-mismatched fallback: try the other shape before giving up.
    if let Some(rows) = parse_tsv(&body, header_for(modality)) {
        return ParsedOutput::Rows(rows, patient_name);
    }

    ParsedOutput::Raw(raw.to_owned())
}

fn header_for(modality: Modality) -> &'static [&'static str] {
    match modality {
        Modality::Vitals => VITALS_HEADER,
        _ => LAB_HEADER,
    }
}

/// Parse a TSV-ish table per §4.4 step 4.
fn parse_tsv(text: &str, expected_header: &[&str]) -> Option<Vec<ExtractedRow>> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !is_section_banner(l))
        .collect();

    let header_idx = lines.iter().position(|l| is_header_line(l, expected_header))?;

    let mut rows = Vec::new();
    for (i, line) in lines.iter().enumerate().skip(header_idx + 1) {
        if is_section_banner(line) {
            continue;
        }
        let cells = split_row(line);
        if cells.is_empty() {
            continue;
        }
        rows.push(row_from_cells(&cells, i));
    }

    if rows.is_empty() {
        None
    } else {
        Some(rows)
    }
}

fn is_header_line(line: &str, expected: &[&str]) -> bool {
    let cells = split_row(line);
    let upper: Vec<String> = cells.iter().map(|c| c.to_uppercase()).collect();
    let matches = expected.iter().filter(|e| upper.iter().any(|c| c == *e)).count();
    matches >= 3
}

fn is_section_banner(line: &str) -> bool {
    let cells = split_row(line);
    !cells.is_empty()
        && cells
            .iter()
            .all(|c| !c.is_empty() && c.chars().all(|ch| ch.is_uppercase() || ch.is_whitespace() || !ch.is_alphabetic()))
        && cells.len() <= 2
}

fn split_row(line: &str) -> Vec<String> {
    if line.contains('\t') {
        line.split('\t').map(|c| c.trim().to_owned()).collect()
    } else {
        // fallback: runs of >=2 spaces
        let re = regex::Regex::new(r" {2,}").expect("valid regex");
        re.split(line).map(|c| c.trim().to_owned()).filter(|c| !c.is_empty()).collect()
    }
}

fn row_from_cells(cells: &[String], index: usize) -> ExtractedRow {
    let test_name = cells.first().cloned().unwrap_or_default();
    let raw_value = cells.get(1).cloned().unwrap_or_default();
    let unit = cells.get(2).filter(|s| !s.is_empty()).cloned();
    let range = cells.get(3).filter(|s| !s.is_empty()).map(|s| parse_range(s));
    let flag = cells
        .get(4)
        .and_then(|s| match s.trim().to_uppercase().as_str() {
            "H" => Some(Flag::H),
            "L" => Some(Flag::L),
            "N" => Some(Flag::N),
            _ => None,
        });

    let value = raw_value
        .trim()
        .parse::<f64>()
        .map(RowValue::Number)
        .unwrap_or(RowValue::Text(raw_value));

    ExtractedRow {
        test_name,
        value,
        unit,
        reference_range: range,
        flag,
        source_span: Some(index),
    }
}

fn parse_range(s: &str) -> ReferenceRange {
    if let Some((low, high)) = s.split_once('-') {
        if let (Ok(low), Ok(high)) = (low.trim().parse::<f64>(), high.trim().parse::<f64>()) {
            return ReferenceRange::Bounds { low, high };
        }
    }
    ReferenceRange::Text(s.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_thinking_tokens_across_lines() {
        let text = "before<unused94>\nhidden\nreasoning<unused95>after";
        assert_eq!(strip_thinking_tokens(text), "beforeafter");
    }

    #[test]
    fn strips_markdown_json_fence() {
        let text = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_markdown_fences(text), "{\"a\":1}");
    }

    #[test]
    fn parses_lab_tsv() {
        let text = "TEST\tVALUE\tUNIT\tRANGE\tFLAG\nHemoglobin\t13.2\tg/dL\t13.0-17.0\t";
        match parse(text, Modality::Lab) {
            ParsedOutput::Rows(rows, patient_name) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].test_name, "Hemoglobin");
                assert_eq!(rows[0].value, RowValue::Number(13.2));
                assert_eq!(patient_name, None);
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn extracts_leading_patient_line_before_table() {
        let text = "PATIENT\tDr. Jane A. Smith MD\nTEST\tVALUE\tUNIT\tRANGE\tFLAG\nHemoglobin\t13.2\tg/dL\t13.0-17.0\t";
        match parse(text, Modality::Lab) {
            ParsedOutput::Rows(rows, patient_name) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(patient_name.as_deref(), Some("Dr. Jane A. Smith MD"));
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn drops_section_banner_rows() {
        let text = "TEST\tVALUE\tUNIT\tRANGE\tFLAG\nDIFFERENTIAL COUNT\nNeutrophils\t62\t%\t40-70\t";
        match parse(text, Modality::Lab) {
            ParsedOutput::Rows(rows, _) => assert_eq!(rows.len(), 1),
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn parses_prescription_json() {
        let text = r#"[{"medication":"Amoxicillin 500mg","dosage":"1 tab","frequency":"bid","duration":"7 days"}]"#;
        match parse(text, Modality::Prescription) {
            ParsedOutput::Medications(meds, _) => {
                assert_eq!(meds.len(), 1);
                assert_eq!(meds[0].frequency, "bid");
            }
            other => panic!("expected medications, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_text_falls_back_to_raw() {
        let text = "not json and not a table at all";
        match parse(text, Modality::Prescription) {
            ParsedOutput::Raw(raw) => assert_eq!(raw, text),
            other => panic!("expected raw, got {other:?}"),
        }
    }
}

impl std::fmt::Debug for ParsedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rows(r, name) => write!(f, "Rows({} rows, patient_name={name:?})", r.len()),
            Self::Medications(m, name) => write!(f, "Medications({} entries, patient_name={name:?})", m.len()),
            Self::Radiology(_, name) => write!(f, "Radiology(.., patient_name={name:?})"),
            Self::Raw(s) => write!(f, "Raw({} chars)", s.len()),
        }
    }
}
