//! Prompt templates for the four reasoning stages.
//!
//! Templates use `{name}` placeholders. Files in the configured prompts
//! directory replace the built-in text one stage at a time.

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::info;

use crate::error::CoveError;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("invalid placeholder regex"));

const QUESTIONS_FILE: &str = "verification_question.txt";
const REACT_FILE: &str = "react_agent.txt";
const ASSESSMENT_FILE: &str = "final_assessment.txt";
const AGGREGATION_FILE: &str = "aggregation.txt";

const QUESTIONS_TEMPLATE: &str = "\
You are an OSINT analyst checking a piece of collected evidence.

Evidence:
{collected_evidence}

Write at most {max_questions} verification questions that could be answered by
analysing the reference dataset. Each question must check one concrete,
falsifiable detail of the evidence.

Respond with a JSON object of the form
{\"verification_questions\": [\"question 1\", \"question 2\"]}";

const REACT_TEMPLATE: &str = "\
You verify OSINT evidence by analysing a reference dataset with python.

The dataset file path is available in the environment variable COVE_DATASET
(reference name: {data_path}). To run code, reply with a single ```python
fenced block; its printed output is returned to you as an observation.
When you are done, reply with FINAL(<your answer>).

Evidence under review:
{collected_evidence}

Verification questions:
{verification_questions}

Answer every question, citing the figures you computed.";

const ASSESSMENT_TEMPLATE: &str = "\
Judge the credibility of one piece of OSINT evidence using the verification
work below.

Evidence:
{collected_evidence}

Verification answers:
{verification_answers}

Respond with a JSON object:
{\"final_result\": \"verified\" | \"unverified\" | \"inconclusive\" | \"debunked\",
 \"explanation\": \"<short justification>\"}";

const AGGREGATION_TEMPLATE: &str = "\
Combine per-evidence credibility assessments into one verdict for the claim.

Evidence:
{evidence_list}

Assessments:
{credibility_assessments}

Respond with a JSON object:
{\"final_result\": \"verified\" | \"unverified\" | \"inconclusive\" | \"debunked\",
 \"explanation\": \"<short justification>\"}";

#[derive(Debug, Clone)]
pub struct Prompts {
    questions: String,
    react: String,
    assessment: String,
    aggregation: String,
}

impl Default for Prompts {
    fn default() -> Self {
        Self {
            questions: QUESTIONS_TEMPLATE.to_string(),
            react: REACT_TEMPLATE.to_string(),
            assessment: ASSESSMENT_TEMPLATE.to_string(),
            aggregation: AGGREGATION_TEMPLATE.to_string(),
        }
    }
}

impl Prompts {
    /// Built-in templates, overridden by whichever files exist in `dir`.
    pub fn load(dir: Option<&Path>) -> Result<Self, CoveError> {
        let mut prompts = Self::default();
        let Some(dir) = dir else {
            return Ok(prompts);
        };
        for (file, slot) in [
            (QUESTIONS_FILE, &mut prompts.questions),
            (REACT_FILE, &mut prompts.react),
            (ASSESSMENT_FILE, &mut prompts.assessment),
            (AGGREGATION_FILE, &mut prompts.aggregation),
        ] {
            let path = dir.join(file);
            if !path.exists() {
                continue;
            }
            *slot = fs::read_to_string(&path).map_err(|err| CoveError::config_io(path.clone(), err))?;
            info!(path = %path.display(), "loaded prompt override");
        }
        Ok(prompts)
    }

    pub fn questions(&self, evidence: &str, max_questions: usize) -> String {
        render(
            &self.questions,
            &[
                ("collected_evidence", evidence),
                ("max_questions", &max_questions.to_string()),
            ],
        )
    }

    pub fn react(&self, evidence: &str, questions: &str, data_path: &str) -> String {
        render(
            &self.react,
            &[
                ("collected_evidence", evidence),
                ("verification_questions", questions),
                ("data_path", data_path),
            ],
        )
    }

    pub fn assessment(&self, evidence: &str, answers: &str) -> String {
        render(
            &self.assessment,
            &[
                ("collected_evidence", evidence),
                ("verification_answers", answers),
            ],
        )
    }

    pub fn aggregation(&self, evidence: &str, assessments: &str) -> String {
        render(
            &self.aggregation,
            &[
                ("evidence_list", evidence),
                ("credibility_assessments", assessments),
            ],
        )
    }
}

/// Single-pass substitution; values are never re-scanned and unknown names stay verbatim.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            values
                .iter()
                .find(|(name, _)| *name == &caps[1])
                .map(|(_, value)| Cow::Owned(value.to_string()))
                .unwrap_or_else(|| Cow::Owned(caps[0].to_string()))
        })
        .into_owned()
}
