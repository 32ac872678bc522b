//! Semantic firewall: deterministic rewrite and completeness checks applied
//! to extracted rows before FHIR assembly (§4.5).
//!
//! Steps run in a fixed order and never consult the LLM. Each step may
//! mutate rows in place; the final two functions, [`check_completeness`]
//! and [`derive_flags`], are the boundary the pipeline calls after all
//! rewrites have run.
//!
//! Step 8, patient-identity cleanup, operates on a value [`rewrite_rows`]
//! never sees (the raw patient name line lives alongside the rows, not in
//! them) and is applied by the pipeline as a separate call to
//! [`strip_patient_identity`] before `rewrite_rows` runs.

use crate::parser::{ExtractedRow, Flag, PatientIdentity, ReferenceRange, RowValue, ValidationError};
use crate::terminology;

/// Apply the full ordered rewrite chain to a set of LAB/VITALS rows.
///
/// Steps, in order (§4.5):
/// 1. Normalize test names via the terminology map.
/// 2. Normalize units, coercing empty to `None`.
/// 3. Deduplicate rows with an identical canonical name (keep first).
/// 4. Drop section-banner rows that slipped through the parser.
/// 5. Repair platelet count scaling (values plausible only as `x1000`).
/// 6. Correct an off-by-10 `Absolute <cell>` count against its own
///    reference-range midpoint, when a WBC total is present.
/// 7. Detect and correct a Platelet Count / MPV column swap.
/// 8. Strip embedded patient-identity fragments from free-text cells.
/// 9. Prune non-report dates misread as the report date (handled by caller
///    with a single dedicated value, not a row list).
/// 10. Derive H/L/N flags from reference ranges when the source omitted
///     them (see [`derive_flags`]).
pub fn rewrite_rows(rows: Vec<ExtractedRow>) -> Vec<ExtractedRow> {
    let rows = normalize_names(rows);
    let rows = normalize_units(rows);
    let rows = deduplicate(rows);
    let rows = drop_banner_rows(rows);
    let rows = repair_platelet_scaling(rows);
    let rows = repair_absolute_count_scaling(rows);
    let rows = repair_platelet_mpv_swap(rows);
    derive_flags(rows)
}

fn normalize_names(rows: Vec<ExtractedRow>) -> Vec<ExtractedRow> {
    rows.into_iter()
        .map(|mut r| {
            r.test_name = terminology::resolve_canonical_name(&r.test_name);
            r
        })
        .collect()
}

fn normalize_units(rows: Vec<ExtractedRow>) -> Vec<ExtractedRow> {
    rows.into_iter()
        .map(|mut r| {
            r.unit = r
                .unit
                .as_deref()
                .and_then(terminology::canonical_unit);
            r
        })
        .collect()
}

fn deduplicate(rows: Vec<ExtractedRow>) -> Vec<ExtractedRow> {
    let mut seen = std::collections::HashSet::new();
    rows.into_iter()
        .filter(|r| seen.insert(r.test_name.clone()))
        .collect()
}

const BANNER_KEYWORDS: &[&str] = &[
    "differential count",
    "complete blood count",
    "blood count",
    "absolute counts",
];

fn drop_banner_rows(rows: Vec<ExtractedRow>) -> Vec<ExtractedRow> {
    rows.into_iter()
        .filter(|r| {
            let lowered = r.test_name.to_lowercase();
            !(BANNER_KEYWORDS.contains(&lowered.as_str()) && r.value.as_number().is_none())
        })
        .collect()
}

/// Platelet values below this, reported in `/uL`-ish units, are an OCR/model
/// artifact that dropped the x1000 scale (§4.5 step 5).
const PLATELET_SCALE_THRESHOLD: f64 = 1000.0;
const PLATELET_SCALE_FACTOR: f64 = 1000.0;

fn repair_platelet_scaling(rows: Vec<ExtractedRow>) -> Vec<ExtractedRow> {
    rows.into_iter()
        .map(|mut r| {
            if r.test_name == "platelet count" {
                let unit_eligible = matches!(r.unit.as_deref(), Some("/uL") | Some("uL") | None);
                if let Some(n) = r.value.as_number() {
                    if unit_eligible && n < PLATELET_SCALE_THRESHOLD {
                        r.value = RowValue::Number(n * PLATELET_SCALE_FACTOR);
                        r.unit = Some("/uL".to_owned());
                        // Invalidate any prior flag; derive_flags recomputes
                        // it against the (unscaled) reference range, or
                        // clears it when no range is present.
                        r.flag = None;
                    }
                }
            }
            r
        })
        .collect()
}

/// Differential test names eligible for the off-by-10 absolute-count repair.
const ABSOLUTE_DIFFERENTIAL_NAMES: &[&str] = &[
    "absolute neutrophils",
    "absolute lymphocytes",
    "absolute monocytes",
    "absolute eosinophils",
    "absolute basophils",
];

/// An existing `Absolute <cell>` row is corrected by x10 when its own
/// reference-range midpoint is at least this many times the extracted
/// value -- a common OCR artifact that drops a leading digit (§4.5 step 6).
/// Only applied when a WBC total is present in the same rowset.
const ABSOLUTE_COUNT_OFF_BY_FACTOR: f64 = 10.0;

fn repair_absolute_count_scaling(rows: Vec<ExtractedRow>) -> Vec<ExtractedRow> {
    let wbc_present = rows.iter().any(|r| r.test_name == "white blood cell count");
    if !wbc_present {
        return rows;
    }

    rows.into_iter()
        .map(|mut r| {
            if ABSOLUTE_DIFFERENTIAL_NAMES.contains(&r.test_name.as_str()) {
                if let (Some(value), Some(ReferenceRange::Bounds { low, high })) =
                    (r.value.as_number(), r.reference_range.as_ref())
                {
                    let midpoint = (low + high) / 2.0;
                    if value > 0.0 && midpoint >= ABSOLUTE_COUNT_OFF_BY_FACTOR * value {
                        r.value = RowValue::Number(value * ABSOLUTE_COUNT_OFF_BY_FACTOR);
                    }
                }
            }
            r
        })
        .collect()
}

/// MPV's plausible clinical range (§4.5 step 7).
const MPV_REFERENCE_LOW: f64 = 6.0;
const MPV_REFERENCE_HIGH: f64 = 12.0;

fn repair_platelet_mpv_swap(mut rows: Vec<ExtractedRow>) -> Vec<ExtractedRow> {
    let platelet_idx = rows.iter().position(|r| r.test_name == "platelet count");
    let mpv_idx = rows.iter().position(|r| r.test_name == "mean platelet volume");

    if let (Some(pi), Some(mi)) = (platelet_idx, mpv_idx) {
        let platelet_val = rows[pi].value.as_number();
        let mpv_val = rows[mi].value.as_number();
        if let (Some(pv), Some(mv)) = (platelet_val, mpv_val) {
            let platelet_in_mpv_range = pv >= MPV_REFERENCE_LOW && pv <= MPV_REFERENCE_HIGH;
            let mpv_in_platelet_range = mv < MPV_REFERENCE_LOW || mv > MPV_REFERENCE_HIGH;
            if platelet_in_mpv_range && mpv_in_platelet_range {
                let tmp = rows[pi].value.clone();
                rows[pi].value = rows[mi].value.clone();
                rows[mi].value = tmp;
            }
        }
    }
    rows
}

/// Honorific prefixes stripped from a raw patient name before splitting
/// (§4.5 step 8), compared case-insensitively with a trailing `.` ignored.
const HONORIFIC_PREFIXES: &[&str] = &["dr", "mr", "mrs", "ms", "miss", "prof"];

/// Credential suffixes stripped from the end of a raw patient name before
/// splitting (§4.5 step 8), compared the same way as the prefixes above.
const HONORIFIC_SUFFIXES: &[&str] = &["md", "phd", "rn", "do", "np", "pa"];

fn strip_honorific_token(token: &str, table: &[&str]) -> bool {
    let normalized = token.trim_matches(|c: char| c == '.' || c == ',').to_lowercase();
    table.contains(&normalized.as_str())
}

/// Strip honorifics and credential suffixes from a raw extracted patient
/// name, then split the remainder on the last whitespace into given/family
/// (§4.5 step 8). A name with no internal whitespace after stripping is
/// kept as the family name alone.
fn clean_patient_name(raw: &str) -> PatientIdentity {
    let mut tokens: Vec<&str> = raw.split_whitespace().collect();

    while tokens.first().is_some_and(|t| strip_honorific_token(t, HONORIFIC_PREFIXES)) {
        tokens.remove(0);
    }
    while tokens.last().is_some_and(|t| strip_honorific_token(t, HONORIFIC_SUFFIXES)) {
        tokens.pop();
    }

    if tokens.is_empty() {
        return PatientIdentity::default();
    }

    match tokens.split_last() {
        Some((family, given)) if !given.is_empty() => {
            PatientIdentity { given: Some(given.join(" ")), family: Some((*family).to_owned()) }
        }
        Some((family, _)) => PatientIdentity { given: None, family: Some((*family).to_owned()) },
        None => PatientIdentity::default(),
    }
}

/// Minimum family-name length eligible for redacting a matching free-text
/// row value (§4.5 step 8); guards against a short surname (e.g. "Li")
/// matching unrelated cell content.
const MIN_REDACTABLE_NAME_LEN: usize = 3;

/// Clean the raw patient name line into a [`PatientIdentity`] and redact
/// any row whose free-text value embeds the cleaned family name -- a guard
/// against the name leaking into an OCR'd table cell (§4.5 step 8).
pub fn strip_patient_identity(rows: Vec<ExtractedRow>, raw_name: Option<&str>) -> (Vec<ExtractedRow>, PatientIdentity) {
    let identity = match raw_name.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => clean_patient_name(raw),
        None => PatientIdentity::default(),
    };

    let rows = match identity.family.as_deref() {
        Some(family) if family.len() >= MIN_REDACTABLE_NAME_LEN => rows
            .into_iter()
            .map(|mut r| {
                if let RowValue::Text(t) = &r.value {
                    if t.to_lowercase().contains(&family.to_lowercase()) {
                        r.value = RowValue::Text(String::new());
                    }
                }
                r
            })
            .collect(),
        _ => rows,
    };

    (rows, identity)
}

/// Derive H/L/N flags from reference ranges for rows the source left
/// unflagged (§4.5 step 10).
pub fn derive_flags(rows: Vec<ExtractedRow>) -> Vec<ExtractedRow> {
    rows.into_iter()
        .map(|mut r| {
            if r.flag.is_none() {
                if let (Some(value), Some(ReferenceRange::Bounds { low, high })) =
                    (r.value.as_number(), r.reference_range.as_ref())
                {
                    r.flag = Some(if value < *low {
                        Flag::L
                    } else if value > *high {
                        Flag::H
                    } else {
                        Flag::N
                    });
                }
            }
            r
        })
        .collect()
}

/// Completeness check results, consumed by the pipeline to decide whether
/// a repair round is needed (§4.5 completeness rules).
pub fn check_completeness(
    rows: &[ExtractedRow],
    require_expected_tests: bool,
    min_observations: u32,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if rows.len() < min_observations as usize {
        errors.push(ValidationError {
            path: "rows".to_owned(),
            code: "too_few_observations".to_owned(),
            message: format!(
                "expected at least {min_observations} observations, found {}",
                rows.len()
            ),
        });
    }

    if require_expected_tests && looks_like_cbc(rows) {
        let present: std::collections::HashSet<&str> =
            rows.iter().map(|r| r.test_name.as_str()).collect();
        for expected in terminology::CBC_PANEL {
            if !present.contains(expected) {
                errors.push(ValidationError {
                    path: format!("rows[{expected}]"),
                    code: "missing_expected_test".to_owned(),
                    message: format!("CBC panel is missing expected test '{expected}'"),
                });
            }
        }
    }

    errors
}

fn looks_like_cbc(rows: &[ExtractedRow]) -> bool {
    let present: std::collections::HashSet<&str> =
        rows.iter().map(|r| r.test_name.as_str()).collect();
    present.contains("hemoglobin") || present.contains("white blood cell count")
}

/// Validate that at least one medication row is present (§4.5 PRESCRIPTION
/// completeness rule).
pub fn check_prescription_completeness(medication_count: usize) -> Vec<ValidationError> {
    if medication_count == 0 {
        vec![ValidationError {
            path: "medications".to_owned(),
            code: "no_medications_found".to_owned(),
            message: "no medication entries were extracted".to_owned(),
        }]
    } else {
        Vec::new()
    }
}

/// Validate patient identity presence when `require_patient` is enabled.
pub fn check_patient_identity(identity: &PatientIdentity, require_patient: bool) -> Vec<ValidationError> {
    if require_patient && identity.given.is_none() && identity.family.is_none() {
        vec![ValidationError {
            path: "patient".to_owned(),
            code: "patient_identity_missing".to_owned(),
            message: "no patient name could be extracted from the document".to_owned(),
        }]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, value: f64, unit: &str) -> ExtractedRow {
        ExtractedRow {
            test_name: name.to_owned(),
            value: RowValue::Number(value),
            unit: Some(unit.to_owned()),
            reference_range: None,
            flag: None,
            source_span: None,
        }
    }

    #[test]
    fn repairs_platelet_scaling_when_implausibly_small() {
        // Scenario A: 370 /uL is an off-by-1000 artifact.
        let mut r = row("platelet count", 370.0, "/uL");
        r.flag = Some(Flag::L);
        let fixed = repair_platelet_scaling(vec![r]);
        assert_eq!(fixed[0].value.as_number(), Some(370_000.0));
        assert_eq!(fixed[0].unit.as_deref(), Some("/uL"));
        assert_eq!(fixed[0].flag, None);
    }

    #[test]
    fn leaves_already_scaled_platelet_count_untouched() {
        let rows = vec![row("platelet count", 250.0, "10*3/uL")];
        let fixed = repair_platelet_scaling(rows);
        assert_eq!(fixed[0].value.as_number(), Some(250.0));
    }

    #[test]
    fn repairs_off_by_ten_absolute_count_against_its_own_range() {
        let mut absolute = row("absolute neutrophils", 0.5, "10*3/uL");
        absolute.reference_range = Some(ReferenceRange::Bounds { low: 2.0, high: 10.0 });
        let rows = vec![row("white blood cell count", 10.0, "10*3/uL"), absolute];
        let fixed = repair_absolute_count_scaling(rows);
        let repaired = fixed.iter().find(|r| r.test_name == "absolute neutrophils").unwrap();
        assert_eq!(repaired.value.as_number(), Some(5.0));
    }

    #[test]
    fn skips_absolute_count_repair_without_wbc_present() {
        let mut absolute = row("absolute neutrophils", 0.5, "10*3/uL");
        absolute.reference_range = Some(ReferenceRange::Bounds { low: 2.0, high: 10.0 });
        let fixed = repair_absolute_count_scaling(vec![absolute]);
        assert_eq!(fixed[0].value.as_number(), Some(0.5));
    }

    #[test]
    fn swaps_platelet_and_mpv_when_columns_are_reversed() {
        let rows = vec![row("platelet count", 9.5, "fL"), row("mean platelet volume", 250.0, "10*3/uL")];
        let fixed = repair_platelet_mpv_swap(rows);
        let plt = fixed.iter().find(|r| r.test_name == "platelet count").unwrap();
        let mpv = fixed.iter().find(|r| r.test_name == "mean platelet volume").unwrap();
        assert_eq!(plt.value.as_number(), Some(250.0));
        assert_eq!(mpv.value.as_number(), Some(9.5));
    }

    #[test]
    fn derives_flag_from_reference_range() {
        let mut r = row("hemoglobin", 9.0, "g/dL");
        r.reference_range = Some(ReferenceRange::Bounds { low: 13.0, high: 17.0 });
        let fixed = derive_flags(vec![r]);
        assert_eq!(fixed[0].flag, Some(Flag::L));
    }

    #[test]
    fn completeness_flags_missing_cbc_panel_entries() {
        let rows = vec![row("hemoglobin", 13.0, "g/dL")];
        let errors = check_completeness(&rows, true, 1);
        assert!(errors.iter().any(|e| e.code == "missing_expected_test"));
    }

    #[test]
    fn completeness_passes_when_min_observations_met_and_expected_tests_off() {
        let rows = vec![row("hemoglobin", 13.0, "g/dL")];
        let errors = check_completeness(&rows, false, 1);
        assert!(errors.is_empty());
    }

    #[test]
    fn strips_honorific_and_splits_given_family() {
        let (_, identity) = strip_patient_identity(vec![], Some("Dr. Jane A. Smith MD"));
        assert_eq!(identity.given.as_deref(), Some("Jane A."));
        assert_eq!(identity.family.as_deref(), Some("Smith"));
    }

    #[test]
    fn single_token_name_becomes_family_only() {
        let (_, identity) = strip_patient_identity(vec![], Some("Madonna"));
        assert_eq!(identity.given, None);
        assert_eq!(identity.family.as_deref(), Some("Madonna"));
    }

    #[test]
    fn missing_patient_line_yields_default_identity() {
        let (_, identity) = strip_patient_identity(vec![], None);
        assert_eq!(identity, PatientIdentity::default());
    }

    #[test]
    fn redacts_row_value_that_embeds_the_family_name() {
        let mut leaked = row("comment", 0.0, "");
        leaked.value = RowValue::Text("patient Smith doing well".to_owned());
        let (rows, _) = strip_patient_identity(vec![leaked], Some("Jane Smith"));
        assert_eq!(rows[0].value, RowValue::Text(String::new()));
    }

    #[test]
    fn check_patient_identity_fails_when_required_and_absent() {
        let errors = check_patient_identity(&PatientIdentity::default(), true);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "patient_identity_missing");
    }
}
