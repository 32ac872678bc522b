//! Pipeline orchestrator: drives one submission through
//! classify -> extract -> sanitize -> validate -> (build | repair) ->
//! fallback (§4.7).
//!
//! Generalizes the phase-sequencing and retry-budget classification shape
//! used elsewhere in this corpus for multi-step LLM-driven workflows: a
//! fixed ordered phase list, each phase either advancing the state or
//! classifying the failure into a bounded number of repair attempts before
//! falling back to a degraded-but-valid output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use crate::firewall;
use crate::fhir;
use crate::llm::{ChatContentPart, ChatRequest, LlmClient};
use crate::parser::{
    self, ClassificationResult, ExtractedRow, MedicationEntry, Modality, ParsedOutput,
    PatientIdentity, RadiologyNarrative, ValidationError,
};
use crate::prompts;

/// Final disposition of a submission (§3 PipelineOutcome).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Bundle assembled and passed validation on a clean or repaired pass.
    Complete,
    /// Bundle assembled after falling back to a degraded, safety-mode form.
    Partial,
    /// No bundle could be assembled at all (e.g. classification failure).
    Failed,
}

/// A note recorded for one repair round (§3 RepairNote).
#[derive(Debug, Clone)]
pub struct RepairNote {
    /// Attempt number, 1-based.
    pub attempt: u32,
    /// Errors that triggered this repair round.
    pub errors: Vec<ValidationError>,
}

/// The full outcome of running one submission through the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Final status.
    pub status: SubmissionStatus,
    /// Assembled FHIR bundle, present unless classification itself failed.
    pub bundle: Option<Value>,
    /// Raw text of the last extraction/repair call, kept for audit.
    pub raw_extraction: String,
    /// Repair rounds actually performed.
    pub repair_notes: Vec<RepairNote>,
    /// Detected modality.
    pub modality: Modality,
}

/// Tunables that govern repair-loop and completeness behavior (§6 Config
/// fields consumed by the pipeline).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum repair attempts before falling back (§4.7).
    pub max_attempts: u32,
    /// Overall wall-clock budget for one submission.
    pub request_deadline: Duration,
    /// When set, completeness failures are treated as fatal rather than
    /// best-effort (affects whether a Partial fallback is still emitted).
    pub strict_extraction: bool,
    /// Require the full CBC panel when a CBC-shaped report is detected.
    pub require_expected_tests: bool,
    /// Require a resolvable patient identity.
    pub require_patient: bool,
    /// Permit a report date on Observations.
    pub allow_report_date: bool,
    /// Minimum observation rows for LAB/VITALS before a completeness error fires.
    pub min_observations: u32,
}

/// Run the full pipeline for one submission's images.
///
/// # Errors
///
/// Returns an error only when the LLM call budget is exhausted by
/// transport failures that leave no usable classification at all; every
/// other failure mode degrades into [`SubmissionStatus::Partial`] or
/// [`SubmissionStatus::Failed`] inside a returned [`PipelineOutcome`].
pub async fn run(
    llm: Arc<dyn LlmClient>,
    images: Vec<ChatContentPart>,
    patient_id: &str,
    config: &PipelineConfig,
) -> anyhow::Result<PipelineOutcome> {
    let deadline = Instant::now() + config.request_deadline;

    let modality = classify(&llm, images.clone()).await?;
    info!(?modality, "classified submission");

    let mut raw = extract(&llm, modality, images.clone()).await?;
    let mut repair_notes = Vec::new();

    for attempt in 1..=config.max_attempts {
        if Instant::now() >= deadline {
            warn!(attempt, "request deadline exceeded before repair budget exhausted");
            break;
        }

        let parsed = parser::parse(&raw, modality);
        let (rows, medications, radiology, patient_name) = materialize(parsed, modality);
        let (rows, identity) = firewall::strip_patient_identity(rows, patient_name.as_deref());
        let rows = firewall::rewrite_rows(rows);

        let mut errors = match modality {
            Modality::Lab | Modality::Vitals => {
                firewall::check_completeness(&rows, config.require_expected_tests, config.min_observations)
            }
            Modality::Prescription => firewall::check_prescription_completeness(medications.len()),
            Modality::Radiology | Modality::Unknown => Vec::new(),
        };
        errors.extend(firewall::check_patient_identity(&identity, config.require_patient));

        if errors.is_empty() {
            // Report-date extraction/pruning (firewall step 9) is not yet
            // wired to a concrete value; omit effectiveDateTime until it is.
            let report_date: Option<&str> = None;
            let bundle = fhir::build_bundle(
                modality,
                &rows,
                &medications,
                radiology.as_ref(),
                &identity,
                patient_id,
                report_date,
            );
            if fhir::validate_bundle_minimal(&bundle).is_none() {
                return Ok(PipelineOutcome {
                    status: SubmissionStatus::Complete,
                    bundle: Some(bundle),
                    raw_extraction: raw,
                    repair_notes,
                    modality,
                });
            }
        }

        repair_notes.push(RepairNote { attempt, errors: errors.clone() });

        if attempt == config.max_attempts {
            break;
        }

        raw = repair(&llm, &raw, &errors).await.unwrap_or(raw);
    }

    let fallback = build_fallback_bundle(modality, &raw, patient_id);
    Ok(PipelineOutcome {
        status: if fallback.is_some() {
            SubmissionStatus::Partial
        } else {
            SubmissionStatus::Failed
        },
        bundle: fallback,
        raw_extraction: raw,
        repair_notes,
        modality,
    })
}

async fn classify(llm: &Arc<dyn LlmClient>, images: Vec<ChatContentPart>) -> anyhow::Result<Modality> {
    let messages = prompts::build_classifier(images);
    let request = ChatRequest { messages, temperature: 0.0, max_tokens: Some(16) };
    let response = llm.chat(request).await?;
    Ok(Modality::from_token(&response.text))
}

/// Parsed classifier result, retained for callers that want the confidence
/// alongside the modality (e.g. audit logging).
pub async fn classify_with_confidence(
    llm: &Arc<dyn LlmClient>,
    images: Vec<ChatContentPart>,
) -> anyhow::Result<ClassificationResult> {
    let modality = classify(llm, images).await?;
    Ok(ClassificationResult { modality, confidence: 1.0 })
}

async fn extract(llm: &Arc<dyn LlmClient>, modality: Modality, images: Vec<ChatContentPart>) -> anyhow::Result<String> {
    let messages = prompts::build_extractor(modality, images);
    let request = ChatRequest { messages, temperature: 0.0, max_tokens: None };
    let response = llm.chat(request).await?;
    Ok(response.text)
}

async fn repair(llm: &Arc<dyn LlmClient>, prior_raw: &str, errors: &[ValidationError]) -> anyhow::Result<String> {
    let messages = prompts::build_repair(prior_raw, errors);
    let request = ChatRequest { messages, temperature: 0.0, max_tokens: None };
    let response = llm.chat(request).await?;
    Ok(response.text)
}

#[allow(clippy::type_complexity)]
fn materialize(
    parsed: ParsedOutput,
    modality: Modality,
) -> (Vec<ExtractedRow>, Vec<MedicationEntry>, Option<RadiologyNarrative>, Option<String>) {
    match parsed {
        ParsedOutput::Rows(rows, patient_name) => (rows, Vec::new(), None, patient_name),
        ParsedOutput::Medications(meds, patient_name) => (Vec::new(), meds, None, patient_name),
        ParsedOutput::Radiology(narrative, patient_name) => (Vec::new(), Vec::new(), Some(narrative), patient_name),
        ParsedOutput::Raw(_) => {
            let _ = modality;
            (Vec::new(), Vec::new(), None, None)
        }
    }
}

/// Build a minimal, explicitly degraded "safety-mode" bundle when the
/// repair budget is exhausted (§4.7 fallback). Contains only a Patient
/// resource and a single flagged Observation carrying the raw text, so
/// downstream consumers see a structurally valid bundle rather than
/// nothing at all.
fn build_fallback_bundle(modality: Modality, raw: &str, patient_id: &str) -> Option<Value> {
    if raw.trim().is_empty() {
        return None;
    }
    let row = ExtractedRow {
        test_name: "unstructured extraction".to_owned(),
        value: parser::RowValue::Text(raw.to_owned()),
        unit: None,
        reference_range: None,
        flag: None,
        source_span: None,
    };
    Some(fhir::build_bundle(modality, &[row], &[], None, &PatientIdentity::default(), patient_id, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        responses: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let text = self.responses.get(i).copied().unwrap_or("").to_owned();
            Ok(ChatResponse { text, usage: Usage::default() })
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            max_attempts: 2,
            request_deadline: Duration::from_secs(30),
            strict_extraction: false,
            require_expected_tests: false,
            require_patient: false,
            allow_report_date: false,
            min_observations: 1,
        }
    }

    #[tokio::test]
    async fn clean_lab_extraction_completes_on_first_pass() {
        let client = Arc::new(ScriptedClient {
            responses: vec!["LAB", "TEST\tVALUE\tUNIT\tRANGE\tFLAG\nHemoglobin\t13.2\tg/dL\t13.0-17.0\t"],
            calls: AtomicUsize::new(0),
        }) as Arc<dyn LlmClient>;

        let outcome = run(client, vec![], "patient-1", &config()).await.expect("pipeline run");
        assert_eq!(outcome.status, SubmissionStatus::Complete);
        assert!(outcome.bundle.is_some());
        assert!(outcome.repair_notes.is_empty());
    }

    #[tokio::test]
    async fn patient_name_and_id_flow_into_the_bundle() {
        let client = Arc::new(ScriptedClient {
            responses: vec![
                "LAB",
                "PATIENT\tDr. Jane A. Smith MD\nTEST\tVALUE\tUNIT\tRANGE\tFLAG\nHemoglobin\t13.2\tg/dL\t13.0-17.0\t",
            ],
            calls: AtomicUsize::new(0),
        }) as Arc<dyn LlmClient>;

        let outcome = run(client, vec![], "patient-42", &config()).await.expect("pipeline run");
        let bundle = outcome.bundle.expect("bundle");
        let patient = bundle["entry"][0]["resource"].clone();
        assert_eq!(patient["identifier"][0]["value"], serde_json::json!("patient-42"));
        assert_eq!(patient["name"][0]["given"][0], serde_json::json!("Jane A."));
        assert_eq!(patient["name"][0]["family"], serde_json::json!("Smith"));
    }

    #[tokio::test]
    async fn unparseable_extraction_falls_back_after_exhausting_repairs() {
        let client = Arc::new(ScriptedClient {
            responses: vec!["LAB", "garbage", "still garbage"],
            calls: AtomicUsize::new(0),
        }) as Arc<dyn LlmClient>;

        let outcome = run(client, vec![], "patient-1", &config()).await.expect("pipeline run");
        assert_eq!(outcome.status, SubmissionStatus::Partial);
        assert!(!outcome.repair_notes.is_empty());
    }

    #[tokio::test]
    async fn unknown_modality_with_empty_output_fails_outright() {
        let client = Arc::new(ScriptedClient {
            responses: vec!["NOT_A_MODALITY", "", ""],
            calls: AtomicUsize::new(0),
        }) as Arc<dyn LlmClient>;

        let outcome = run(client, vec![], "patient-1", &config()).await.expect("pipeline run");
        assert_eq!(outcome.status, SubmissionStatus::Failed);
        assert!(outcome.bundle.is_none());
    }
}
