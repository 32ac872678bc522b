//! HL7 FHIR R4 bundle assembly and minimal structural validation (§4.6).
//!
//! Resources are built directly as `serde_json::Value` trees rather than
//! through a generated FHIR model crate -- the bundle shape needed here is
//! narrow (Bundle/Patient/Observation/MedicationRequest) and a full typed
//! model would carry far more surface than this pipeline exercises.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::parser::{
    ExtractedRow, Flag, MedicationEntry, Modality, PatientIdentity, RadiologyNarrative,
    ReferenceRange, RowValue,
};
use crate::terminology;

/// Build a `transaction`-style FHIR Bundle from one modality's extracted
/// content (§4.6).
pub fn build_bundle(
    modality: Modality,
    rows: &[ExtractedRow],
    medications: &[MedicationEntry],
    radiology: Option<&RadiologyNarrative>,
    identity: &PatientIdentity,
    patient_id: &str,
    report_date: Option<&str>,
) -> Value {
    let resource_id = Uuid::new_v4().to_string();
    let mut entries = vec![patient_entry(&resource_id, identity, patient_id)];

    match modality {
        Modality::Lab | Modality::Vitals => {
            for row in rows {
                entries.push(observation_entry(&resource_id, modality, row, report_date));
            }
        }
        Modality::Prescription => {
            for med in medications {
                entries.push(medication_request_entry(&resource_id, med));
            }
        }
        Modality::Radiology => {
            if let Some(narrative) = radiology {
                entries.push(radiology_observation_entry(&resource_id, narrative, report_date));
            }
        }
        Modality::Unknown => {}
    }

    json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": entries,
    })
}

/// Build the bundle's sole Patient resource. `resource_id` is this
/// bundle's internal cross-reference id (what `subject.reference` points
/// at); `patient_id` is the caller-supplied identifier and is carried as
/// `identifier[0].value` (§4.6), distinct from the extracted name in
/// `identity`.
fn patient_entry(resource_id: &str, identity: &PatientIdentity, patient_id: &str) -> Value {
    let mut name = json!({});
    if let Some(family) = &identity.family {
        name["family"] = json!(family);
    }
    if let Some(given) = &identity.given {
        name["given"] = json!([given]);
    }

    let mut resource = json!({
        "resourceType": "Patient",
        "id": resource_id,
        "identifier": [{ "value": patient_id }],
    });
    if identity.given.is_some() || identity.family.is_some() {
        resource["name"] = json!([name]);
    }

    json!({ "resource": resource })
}

fn category_coding(modality: Modality) -> Value {
    let (code, display) = match modality {
        Modality::Lab => ("laboratory", "Laboratory"),
        Modality::Vitals => ("vital-signs", "Vital Signs"),
        Modality::Radiology => ("imaging", "Imaging"),
        Modality::Prescription | Modality::Unknown => ("exam", "Exam"),
    };
    json!([{
        "coding": [{
            "system": "http://terminology.hl7.org/CodeSystem/observation-category",
            "code": code,
            "display": display,
        }]
    }])
}

fn code_for(test_name: &str) -> Value {
    match terminology::lookup_loinc(test_name) {
        Some(loinc) => json!({
            "coding": [{
                "system": "http://loinc.org",
                "code": loinc,
                "display": test_name,
            }],
            "text": test_name,
        }),
        None => json!({ "text": test_name }),
    }
}

fn interpretation_coding(flag: Flag) -> Value {
    let (code, display) = match flag {
        Flag::H => ("H", "High"),
        Flag::L => ("L", "Low"),
        Flag::N => ("N", "Normal"),
    };
    json!([{
        "coding": [{
            "system": "http://terminology.hl7.org/CodeSystem/v3-ObservationInterpretation",
            "code": code,
            "display": display,
        }]
    }])
}

fn reference_range_value(range: &ReferenceRange, unit: Option<&str>) -> Value {
    match range {
        ReferenceRange::Bounds { low, high } => {
            let mut low_v = json!({ "value": low });
            let mut high_v = json!({ "value": high });
            if let Some(u) = unit {
                low_v["unit"] = json!(u);
                high_v["unit"] = json!(u);
            }
            json!([{ "low": low_v, "high": high_v }])
        }
        ReferenceRange::Text(text) => json!([{ "text": text }]),
    }
}

fn observation_entry(
    patient_id: &str,
    modality: Modality,
    row: &ExtractedRow,
    report_date: Option<&str>,
) -> Value {
    let mut resource = json!({
        "resourceType": "Observation",
        "id": Uuid::new_v4().to_string(),
        "status": "final",
        "category": category_coding(modality),
        "code": code_for(&row.test_name),
        "subject": { "reference": format!("Patient/{patient_id}") },
    });

    match &row.value {
        RowValue::Number(n) => {
            let mut quantity = json!({ "value": n });
            if let Some(unit) = &row.unit {
                quantity["unit"] = json!(unit);
                quantity["system"] = json!("http://unitsofmeasure.org");
                quantity["code"] = json!(unit);
            }
            resource["valueQuantity"] = quantity;
        }
        RowValue::Text(t) => {
            resource["valueString"] = json!(t);
        }
    }

    if let Some(range) = &row.reference_range {
        resource["referenceRange"] = reference_range_value(range, row.unit.as_deref());
    }

    if let Some(flag) = row.flag {
        resource["interpretation"] = interpretation_coding(flag);
    }

    if let Some(date) = report_date {
        resource["effectiveDateTime"] = json!(date);
    }

    json!({ "resource": resource })
}

fn radiology_observation_entry(
    patient_id: &str,
    narrative: &RadiologyNarrative,
    report_date: Option<&str>,
) -> Value {
    let mut resource = json!({
        "resourceType": "Observation",
        "id": Uuid::new_v4().to_string(),
        "status": "final",
        "category": category_coding(Modality::Radiology),
        "code": { "text": "Radiology report" },
        "subject": { "reference": format!("Patient/{patient_id}") },
        "valueString": narrative.finding,
        "conclusion": narrative.impression,
    });

    if let Some(date) = report_date {
        resource["effectiveDateTime"] = json!(date);
    }

    json!({ "resource": resource })
}

fn medication_request_entry(patient_id: &str, med: &MedicationEntry) -> Value {
    json!({
        "resource": {
            "resourceType": "MedicationRequest",
            "id": Uuid::new_v4().to_string(),
            "status": "active",
            "intent": "order",
            "medicationCodeableConcept": { "text": med.medication },
            "subject": { "reference": format!("Patient/{patient_id}") },
            "dosageInstruction": [{
                "text": format!("{} {} for {}", med.dosage, med.frequency, med.duration),
                "timing": { "code": { "text": med.frequency } },
            }],
        }
    })
}

/// Structural validation errors found in an assembled bundle (§4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct BundleViolation {
    /// JSON pointer-ish path to the offending node.
    pub path: String,
    /// Human-readable description.
    pub message: String,
}

/// Validate the minimal structural invariants a bundle must satisfy before
/// being persisted (§4.6): `resourceType` present on every entry, every
/// Observation has exactly one of `valueQuantity`/`valueString`, every
/// Patient/Observation/MedicationRequest references a resolvable subject.
pub fn validate_bundle_minimal(bundle: &Value) -> Option<BundleViolation> {
    let entries = bundle.get("entry").and_then(Value::as_array)?;

    if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Some(BundleViolation {
            path: "$.resourceType".to_owned(),
            message: "bundle is missing resourceType 'Bundle'".to_owned(),
        });
    }

    let patient_ids: std::collections::HashSet<String> = entries
        .iter()
        .filter_map(|e| e.get("resource"))
        .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some("Patient"))
        .filter_map(|r| r.get("id").and_then(Value::as_str))
        .map(str::to_owned)
        .collect();

    for (i, entry) in entries.iter().enumerate() {
        let Some(resource) = entry.get("resource") else {
            return Some(BundleViolation {
                path: format!("$.entry[{i}]"),
                message: "entry is missing a resource".to_owned(),
            });
        };

        let Some(resource_type) = resource.get("resourceType").and_then(Value::as_str) else {
            return Some(BundleViolation {
                path: format!("$.entry[{i}].resource"),
                message: "resource is missing resourceType".to_owned(),
            });
        };

        if resource_type == "Observation" {
            let has_quantity = resource.get("valueQuantity").is_some();
            let has_string = resource.get("valueString").is_some();
            if has_quantity == has_string {
                return Some(BundleViolation {
                    path: format!("$.entry[{i}].resource"),
                    message: "Observation must have exactly one of valueQuantity/valueString".to_owned(),
                });
            }
        }

        if matches!(resource_type, "Observation" | "MedicationRequest") {
            let subject_ref = resource
                .pointer("/subject/reference")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("Patient/"));
            match subject_ref {
                Some(id) if patient_ids.contains(id) => {}
                _ => {
                    return Some(BundleViolation {
                        path: format!("$.entry[{i}].resource.subject"),
                        message: "subject does not reference a Patient present in the bundle".to_owned(),
                    });
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RowValue;

    fn lab_row() -> ExtractedRow {
        ExtractedRow {
            test_name: "hemoglobin".to_owned(),
            value: RowValue::Number(13.2),
            unit: Some("g/dL".to_owned()),
            reference_range: Some(ReferenceRange::Bounds { low: 13.0, high: 17.0 }),
            flag: Some(Flag::N),
            source_span: Some(0),
        }
    }

    #[test]
    fn builds_valid_lab_bundle() {
        let identity = PatientIdentity { given: Some("Jane".to_owned()), family: Some("Doe".to_owned()) };
        let bundle = build_bundle(Modality::Lab, &[lab_row()], &[], None, &identity, "patient-1", Some("2024-01-01"));
        assert!(validate_bundle_minimal(&bundle).is_none());
    }

    #[test]
    fn patient_identifier_carries_the_caller_supplied_patient_id() {
        let identity = PatientIdentity::default();
        let bundle = build_bundle(Modality::Lab, &[lab_row()], &[], None, &identity, "patient-99", None);
        let patient = bundle["entry"][0]["resource"].clone();
        assert_eq!(patient["identifier"][0]["value"], json!("patient-99"));
    }

    #[test]
    fn observation_with_number_uses_value_quantity_not_string() {
        let identity = PatientIdentity::default();
        let bundle = build_bundle(Modality::Lab, &[lab_row()], &[], None, &identity, "patient-1", None);
        let entry = bundle["entry"][1]["resource"].clone();
        assert!(entry.get("valueQuantity").is_some());
        assert!(entry.get("valueString").is_none());
    }

    #[test]
    fn known_loinc_test_gets_coding_unknown_gets_text_only() {
        assert!(matches!(code_for("hemoglobin")["coding"], Value::Array(_)));
        assert_eq!(code_for("some unmapped test")["text"], json!("some unmapped test"));
    }

    #[test]
    fn medication_bundle_builds_medication_request() {
        let med = MedicationEntry {
            medication: "Amoxicillin 500mg".to_owned(),
            dosage: "1 tab".to_owned(),
            frequency: "bid".to_owned(),
            duration: "7 days".to_owned(),
        };
        let identity = PatientIdentity::default();
        let bundle = build_bundle(Modality::Prescription, &[], &[med], None, &identity, "patient-1", None);
        assert!(validate_bundle_minimal(&bundle).is_none());
        assert_eq!(bundle["entry"][1]["resource"]["resourceType"], json!("MedicationRequest"));
    }

    #[test]
    fn validation_rejects_dangling_subject_reference() {
        let bundle = json!({
            "resourceType": "Bundle",
            "entry": [{
                "resource": {
                    "resourceType": "Observation",
                    "valueString": "x",
                    "subject": { "reference": "Patient/does-not-exist" }
                }
            }]
        });
        assert!(validate_bundle_minimal(&bundle).is_some());
    }
}
