//! Prompt construction for each pipeline stage.
//!
//! Each builder is a pure function `build(context) -> Vec<ChatMessage>`;
//! none perform I/O. Prompt text follows a constraint-bullet style (MUST /
//! SHOULD / MAY) matching the system-prompt-as-const-string pattern used
//! for the modality-aware clinical-data generation prompts elsewhere in
//! this corpus.

use crate::llm::{ChatContent, ChatContentPart, ChatMessage, ChatRole};
use crate::parser::Modality;

/// Build the one-shot modality classifier prompt (§4.3.1).
///
/// Instructs the model to respond with exactly one uppercase token from
/// `{LAB, RADIOLOGY, PRESCRIPTION, VITALS}`.
pub fn build_classifier(images: Vec<ChatContentPart>) -> Vec<ChatMessage> {
    let system = ChatMessage {
        role: ChatRole::System,
        content: ChatContent::Text(CLASSIFIER_SYSTEM_PROMPT.to_owned()),
    };
    let mut parts = images;
    parts.push(ChatContentPart::Text {
        text: "Classify this clinical document. Respond with exactly one token.".to_owned(),
    });
    let user = ChatMessage {
        role: ChatRole::User,
        content: ChatContent::Parts(parts),
    };
    vec![system, user]
}

const CLASSIFIER_SYSTEM_PROMPT: &str = "\
You classify clinical document images into exactly one modality.

Respond with exactly one uppercase token, nothing else:
- LAB -- a laboratory report (blood count, chemistry panel, etc.)
- RADIOLOGY -- an imaging report (X-ray, CT, MRI, ultrasound findings)
- PRESCRIPTION -- a medication prescription or order
- VITALS -- a vital-signs sheet (blood pressure, pulse, temperature, etc.)

If none apply clearly, respond UNKNOWN. Do not add punctuation, \
explanation, or markdown. Output must be a single token.";

/// Build the modality-specific extraction prompt (§4.3.2-5).
pub fn build_extractor(modality: Modality, images: Vec<ChatContentPart>) -> Vec<ChatMessage> {
    let system_text = match modality {
        Modality::Lab => LAB_EXTRACTOR_PROMPT,
        Modality::Radiology => RADIOLOGY_EXTRACTOR_PROMPT,
        Modality::Prescription => PRESCRIPTION_EXTRACTOR_PROMPT,
        Modality::Vitals => VITALS_EXTRACTOR_PROMPT,
        Modality::Unknown => LAB_EXTRACTOR_PROMPT,
    };
    let system = ChatMessage {
        role: ChatRole::System,
        content: ChatContent::Text(system_text.to_owned()),
    };
    let mut parts = images;
    parts.push(ChatContentPart::Text {
        text: "Extract the data from this document per the format above.".to_owned(),
    });
    let user = ChatMessage {
        role: ChatRole::User,
        content: ChatContent::Parts(parts),
    };
    vec![system, user]
}

const LAB_EXTRACTOR_PROMPT: &str = "\
You extract laboratory test results from the attached image(s) into a \
strict tab-separated table.

MUST emit a single line first: PATIENT\t<patient's full name exactly as \
printed, including any honorific or credential suffix>. Emit this line \
as PATIENT\t with nothing after the tab if no patient name is printed.
MUST emit a header line exactly, on the next line: TEST\tVALUE\tUNIT\tRANGE\tFLAG
MUST emit one data row per test, tab-separated, in the order tests appear.
MUST leave UNIT empty (not a placeholder word) when the source has no unit.
MUST leave FLAG empty when no abnormal flag is printed on the source.
MUST NOT wrap output in markdown code fences.
MUST NOT add commentary before or after the PATIENT line and the table.

Example few-shot rows (format only, not content to copy):
PATIENT\tJane A. Doe
TEST\tVALUE\tUNIT\tRANGE\tFLAG
Hemoglobin\t13.2\tg/dL\t13.0-17.0\t
Neutrophils Percent\t62\t%\t40-70\t
Absolute Neutrophils\t4.5\t10*3/uL\t2.0-7.0\t

Differential-count and Absolute-count rows belong in the same table as \
the CBC rows above them; do not emit separate tables.";

const RADIOLOGY_EXTRACTOR_PROMPT: &str = "\
You extract a radiology report from the attached image(s).

MUST emit a single line first: PATIENT\t<patient's full name exactly as \
printed, including any honorific or credential suffix>. Emit this line \
as PATIENT\t with nothing after the tab if no patient name is printed.
MUST emit, on the next line, valid JSON with exactly these top-level \
string fields:
  {\"finding\": \"...\", \"impression\": \"...\"}
MUST put the full narrative findings section, verbatim where possible, in \"finding\".
MUST put the impression/conclusion section in \"impression\".
MUST NOT wrap the JSON in markdown code fences.
MUST NOT add any field not listed above.";

const PRESCRIPTION_EXTRACTOR_PROMPT: &str = "\
You extract prescribed medications from the attached image(s).

MUST emit a single line first: PATIENT\t<patient's full name exactly as \
printed, including any honorific or credential suffix>. Emit this line \
as PATIENT\t with nothing after the tab if no patient name is printed.
MUST emit, on the next line, a JSON array of objects with exactly these \
string fields:
  {\"medication\": \"...\", \"dosage\": \"...\", \"frequency\": \"...\", \"duration\": \"...\"}
MUST preserve colloquial frequency phrasing verbatim (e.g. \"bid\", \
\"twice daily\", \"q8h\") -- do not translate or normalize it.
MUST NOT wrap the JSON in markdown code fences.
MUST emit an empty array `[]` if no medication is legible.";

const VITALS_EXTRACTOR_PROMPT: &str = "\
You extract vital-sign readings from the attached image(s) into a strict \
tab-separated table.

MUST emit a single line first: PATIENT\t<patient's full name exactly as \
printed, including any honorific or credential suffix>. Emit this line \
as PATIENT\t with nothing after the tab if no patient name is printed.
MUST emit a header line exactly, on the next line: TEST\tVALUE\tUNIT\tRANGE\tFLAG
MUST use these test names exactly when present: HR, BP Systolic, BP \
Diastolic, Temp, SpO2, BMI, Weight, Height, RR.
MUST split a combined blood-pressure reading (e.g. \"120/80\") into two \
rows: BP Systolic and BP Diastolic.
MUST NOT wrap output in markdown code fences.
MUST NOT add commentary before or after the PATIENT line and the table.";

/// Build the repair prompt (§4.3.6).
///
/// Prior images are intentionally omitted -- they are already in the
/// model's context from the extraction call this repairs.
pub fn build_repair(prior_raw_output: &str, errors: &[crate::parser::ValidationError]) -> Vec<ChatMessage> {
    let mut error_lines = String::new();
    for e in errors {
        error_lines.push_str(&format!("- [{}] {}: {}\n", e.code, e.path, e.message));
    }

    let system = ChatMessage {
        role: ChatRole::System,
        content: ChatContent::Text(REPAIR_SYSTEM_PROMPT.to_owned()),
    };
    let user = ChatMessage {
        role: ChatRole::User,
        content: ChatContent::Text(format!(
            "Your prior output:\n\n{prior_raw_output}\n\nErrors found:\n{error_lines}\n\
             Re-emit the corrected output in the same format as before, fixing only the \
             errors listed. Do not re-describe the document from scratch."
        )),
    };
    vec![system, user]
}

const REPAIR_SYSTEM_PROMPT: &str = "\
You previously extracted data from a clinical document and the output \
failed automated validation. You are given your prior raw output and a \
machine-readable list of errors.

MUST re-emit output in the exact same format as your prior output \
(same table/JSON shape).
MUST fix every listed error.
MUST NOT introduce new fields or rows not implied by the corrections.
MUST NOT add commentary, explanation, or markdown fences.";

/// Build the synthesis prompt (§4.3.7).
///
/// Given the assembled bundle and doctor's notes, produces a structured
/// markdown summary.
pub fn build_synthesis(bundle_json: &str, doctor_notes: &str) -> Vec<ChatMessage> {
    let system = ChatMessage {
        role: ChatRole::System,
        content: ChatContent::Text(SYNTHESIS_SYSTEM_PROMPT.to_owned()),
    };
    let user = ChatMessage {
        role: ChatRole::User,
        content: ChatContent::Text(format!(
            "FHIR bundle:\n\n{bundle_json}\n\nDoctor's notes:\n\n{doctor_notes}"
        )),
    };
    vec![system, user]
}

const SYNTHESIS_SYSTEM_PROMPT: &str = "\
You are a clinical summarization assistant. Given a FHIR bundle and a \
clinician's free-text notes, produce a structured markdown summary.

MUST use exactly these H2 sections, in this order: Findings, \
Correlations, Recommendations.
MUST ground every statement in the bundle's Observations or the notes --\
do not invent values.
MUST keep the summary concise; prefer bullet points under each heading.
MUST NOT wrap output in markdown code fences (the output IS markdown).";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_prompt_has_system_and_user_turn() {
        let msgs = build_classifier(vec![]);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, ChatRole::System);
        assert_eq!(msgs[1].role, ChatRole::User);
    }

    #[test]
    fn extractor_prompt_selects_modality() {
        let msgs = build_extractor(Modality::Prescription, vec![]);
        let text = msgs[0].content.text();
        assert!(text.contains("medication"));
    }

    #[test]
    fn repair_prompt_embeds_errors() {
        let errors = vec![crate::parser::ValidationError {
            path: "rows[0].unit".to_owned(),
            code: "unit_missing".to_owned(),
            message: "unit is required".to_owned(),
        }];
        let msgs = build_repair("prior output", &errors);
        let text = msgs[1].content.text();
        assert!(text.contains("unit_missing"));
        assert!(text.contains("prior output"));
    }
}
