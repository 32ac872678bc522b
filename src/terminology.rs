//! Static terminology lookup tables: test-name synonyms to canonical names,
//! canonical names to LOINC codes, and unit variants to canonical units.
//!
//! Every lookup here is pure, branch-free with respect to I/O, and O(1)
//! after a cheap normalization pass. Missing entries return the input
//! unchanged (and `None` for LOINC) -- callers still emit an Observation
//! with `code.text` only.

/// A canonical test name paired with its LOINC code.
pub struct LoincEntry {
    /// Canonical, display-ready test name.
    pub canonical: &'static str,
    /// LOINC code for this test.
    pub loinc: &'static str,
}

/// `{canonical_test_name -> LOINC}`. Keys are already canonicalized
/// (see [`canonicalize_test_name`]).
const LOINC_TABLE: &[LoincEntry] = &[
    LoincEntry { canonical: "hemoglobin", loinc: "718-7" },
    LoincEntry { canonical: "hematocrit", loinc: "4544-3" },
    LoincEntry { canonical: "white blood cell count", loinc: "6690-2" },
    LoincEntry { canonical: "red blood cell count", loinc: "789-8" },
    LoincEntry { canonical: "platelet count", loinc: "777-3" },
    LoincEntry { canonical: "mean platelet volume", loinc: "32623-1" },
    LoincEntry { canonical: "mean corpuscular volume", loinc: "787-2" },
    LoincEntry { canonical: "mean corpuscular hemoglobin", loinc: "785-6" },
    LoincEntry { canonical: "mean corpuscular hemoglobin concentration", loinc: "786-4" },
    LoincEntry { canonical: "red cell distribution width", loinc: "788-0" },
    LoincEntry { canonical: "neutrophils percent", loinc: "770-8" },
    LoincEntry { canonical: "lymphocytes percent", loinc: "736-9" },
    LoincEntry { canonical: "monocytes percent", loinc: "5905-5" },
    LoincEntry { canonical: "eosinophils percent", loinc: "713-8" },
    LoincEntry { canonical: "basophils percent", loinc: "706-2" },
    LoincEntry { canonical: "absolute neutrophils", loinc: "751-8" },
    LoincEntry { canonical: "absolute lymphocytes", loinc: "731-0" },
    LoincEntry { canonical: "absolute monocytes", loinc: "742-7" },
    LoincEntry { canonical: "absolute eosinophils", loinc: "711-2" },
    LoincEntry { canonical: "absolute basophils", loinc: "704-7" },
    LoincEntry { canonical: "blood pressure systolic", loinc: "8480-6" },
    LoincEntry { canonical: "blood pressure diastolic", loinc: "8462-4" },
    LoincEntry { canonical: "heart rate", loinc: "8867-4" },
    LoincEntry { canonical: "body temperature", loinc: "8310-5" },
    LoincEntry { canonical: "respiratory rate", loinc: "9279-1" },
    LoincEntry { canonical: "oxygen saturation", loinc: "2708-6" },
    LoincEntry { canonical: "body weight", loinc: "29463-7" },
    LoincEntry { canonical: "body height", loinc: "8302-2" },
    LoincEntry { canonical: "body mass index", loinc: "39156-5" },
];

/// `{synonym -> canonical_test_name}`. Keys are case-insensitive and
/// punctuation-stripped (apply [`canonicalize_test_name`] before lookup).
const SYNONYM_TABLE: &[(&str, &str)] = &[
    ("hb", "hemoglobin"),
    ("hgb", "hemoglobin"),
    ("hct", "hematocrit"),
    ("wbc", "white blood cell count"),
    ("wbc count", "white blood cell count"),
    ("total leukocyte count", "white blood cell count"),
    ("rbc", "red blood cell count"),
    ("rbc count", "red blood cell count"),
    ("platelet count", "platelet count"),
    ("plt", "platelet count"),
    ("plt count", "platelet count"),
    ("mpv", "mean platelet volume"),
    ("mcv", "mean corpuscular volume"),
    ("mch", "mean corpuscular hemoglobin"),
    ("mchc", "mean corpuscular hemoglobin concentration"),
    ("rdw", "red cell distribution width"),
    ("neutrophils", "neutrophils percent"),
    ("neutrophils percent", "neutrophils percent"),
    ("lymphocytes", "lymphocytes percent"),
    ("lymphocytes percent", "lymphocytes percent"),
    ("monocytes", "monocytes percent"),
    ("monocytes percent", "monocytes percent"),
    ("eosinophils", "eosinophils percent"),
    ("eosinophils percent", "eosinophils percent"),
    ("basophils", "basophils percent"),
    ("basophils percent", "basophils percent"),
    ("absolute neutrophils", "absolute neutrophils"),
    ("anc", "absolute neutrophils"),
    ("absolute lymphocytes", "absolute lymphocytes"),
    ("alc", "absolute lymphocytes"),
    ("absolute monocytes", "absolute monocytes"),
    ("absolute eosinophils", "absolute eosinophils"),
    ("absolute basophils", "absolute basophils"),
    ("bp systolic", "blood pressure systolic"),
    ("systolic bp", "blood pressure systolic"),
    ("bp diastolic", "blood pressure diastolic"),
    ("diastolic bp", "blood pressure diastolic"),
    ("hr", "heart rate"),
    ("pulse", "heart rate"),
    ("temp", "body temperature"),
    ("rr", "respiratory rate"),
    ("spo2", "oxygen saturation"),
    ("o2 sat", "oxygen saturation"),
    ("weight", "body weight"),
    ("height", "body height"),
    ("bmi", "body mass index"),
];

/// `{unit_variant -> canonical_unit}`. Keys are lowercased before lookup.
const UNIT_TABLE: &[(&str, &str)] = &[
    ("mill/cumm", "10*6/uL"),
    ("million/mm3", "10*6/uL"),
    ("million/cumm", "10*6/uL"),
    ("x10^6/ul", "10*6/uL"),
    ("10^6/ul", "10*6/uL"),
    ("/cumm", "/uL"),
    ("cells/cumm", "/uL"),
    ("thou/cumm", "10*3/uL"),
    ("thousand/cumm", "10*3/uL"),
    ("x10^3/ul", "10*3/uL"),
    ("10^3/ul", "10*3/uL"),
    ("k/ul", "10*3/uL"),
    ("g/dl", "g/dL"),
    ("gm/dl", "g/dL"),
    ("%", "%"),
    ("percent", "%"),
    ("fl", "fL"),
    ("pg", "pg"),
    ("mmhg", "mm[Hg]"),
    ("bpm", "/min"),
    ("beats/min", "/min"),
    ("breaths/min", "/min"),
    ("celsius", "Cel"),
    ("c", "Cel"),
    ("fahrenheit", "[degF]"),
    ("f", "[degF]"),
    ("kg", "kg"),
    ("cm", "cm"),
    ("kg/m2", "kg/m2"),
];

/// The full set of CBC+Differential+Platelet test names required when
/// `require_expected_tests` is enabled and the panel is detected as CBC.
pub const CBC_PANEL: &[&str] = &[
    "hemoglobin",
    "hematocrit",
    "white blood cell count",
    "red blood cell count",
    "platelet count",
    "mean corpuscular volume",
    "neutrophils percent",
    "lymphocytes percent",
    "monocytes percent",
    "eosinophils percent",
    "basophils percent",
];

/// Casefold and strip punctuation from a test name, producing a lookup key.
pub fn canonicalize_test_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve a raw test name to its canonical form via the synonym table.
///
/// Unresolved names are returned verbatim (after canonicalization), per
/// §4.1: "unresolved names are retained verbatim."
pub fn resolve_canonical_name(raw: &str) -> String {
    let key = canonicalize_test_name(raw);
    SYNONYM_TABLE
        .iter()
        .find(|(syn, _)| *syn == key)
        .map(|(_, canonical)| (*canonical).to_owned())
        .unwrap_or(key)
}

/// Look up the LOINC code for an already-canonicalized test name.
///
/// Returns `None` when the name is not present in the bundled table --
/// the Observation is still emitted with `code.text` only.
pub fn lookup_loinc(canonical_name: &str) -> Option<&'static str> {
    LOINC_TABLE
        .iter()
        .find(|e| e.canonical == canonical_name)
        .map(|e| e.loinc)
}

/// Resolve a unit variant to its canonical UCUM-ish form.
///
/// Empty input coerces to `None` per §4.5 step 2 ("coerce empty unit to
/// null"). Unknown variants are returned unchanged.
pub fn canonical_unit(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let key = trimmed.to_lowercase();
    Some(
        UNIT_TABLE
            .iter()
            .find(|(variant, _)| *variant == key)
            .map(|(_, canonical)| (*canonical).to_owned())
            .unwrap_or_else(|| trimmed.to_owned()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_synonym() {
        assert_eq!(resolve_canonical_name("Hb"), "hemoglobin");
        assert_eq!(resolve_canonical_name("WBC"), "white blood cell count");
    }

    #[test]
    fn unresolved_name_is_retained_verbatim() {
        assert_eq!(resolve_canonical_name("Some Weird Test"), "some weird test");
    }

    #[test]
    fn loinc_lookup_known_and_unknown() {
        assert_eq!(lookup_loinc("hemoglobin"), Some("718-7"));
        assert_eq!(lookup_loinc("some weird test"), None);
    }

    #[test]
    fn unit_variants_normalize() {
        assert_eq!(canonical_unit("mill/cumm"), Some("10*6/uL".to_owned()));
        assert_eq!(canonical_unit(""), None);
        assert_eq!(canonical_unit("weird-unit"), Some("weird-unit".to_owned()));
    }

    #[test]
    fn platelet_and_mpv_are_distinct_canonical_entries() {
        assert_eq!(resolve_canonical_name("Platelet Count"), "platelet count");
        assert_eq!(resolve_canonical_name("MPV"), "mean platelet volume");
        assert_eq!(lookup_loinc("platelet count"), Some("777-3"));
        assert_eq!(lookup_loinc("mean platelet volume"), Some("32623-1"));
    }
}
