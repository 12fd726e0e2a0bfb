//! Analysis of finished result artifacts: verdict extraction, agreement with
//! human labels, and mismatch breakdown.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::artifact::ResultRow;
use crate::dataset::{DatasetSource, Iteration};
use crate::error::CoveError;

static FINAL_RESULT_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""final_result"\s*:\s*"([^"]+)""#).expect("invalid final_result regex")
});
static FINAL_RESULT_OBJECT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\{\s*"final_result"[^}]+\}"#).expect("invalid final_result object regex")
});
static EXPLANATION_FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""explanation"\s*:\s*"([^"]+)""#).expect("invalid explanation regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Verified,
    Unverified,
    Inconclusive,
    Debunked,
    Unknown,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Verified => "VERIFIED",
            Verdict::Unverified => "UNVERIFIED",
            Verdict::Inconclusive => "INCONCLUSIVE",
            Verdict::Debunked => "DEBUNKED",
            Verdict::Unknown => "UNKNOWN",
        }
    }

    fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "verified" => Verdict::Verified,
            "unverified" => Verdict::Unverified,
            "inconclusive" => Verdict::Inconclusive,
            "debunked" => Verdict::Debunked,
            _ => Verdict::Unknown,
        }
    }

    /// Structured `final_result` field first, then a bare keyword scan.
    pub fn parse(assessment: &str) -> Self {
        if let Some(caps) = FINAL_RESULT_FIELD.captures(assessment) {
            return Self::from_token(&caps[1]);
        }
        if let Some(found) = FINAL_RESULT_OBJECT.find(assessment)
            && let Ok(Value::Object(map)) = serde_json::from_str::<Value>(found.as_str())
            && let Some(Value::String(token)) = map.get("final_result")
        {
            return Self::from_token(token);
        }

        let lower = assessment.to_lowercase();
        if lower.contains("unverified") {
            Verdict::Unverified
        } else if lower.contains("verified") {
            Verdict::Verified
        } else if lower.contains("inconclusive") {
            Verdict::Inconclusive
        } else if lower.contains("debunked") {
            Verdict::Debunked
        } else {
            Verdict::Unknown
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn extract_explanation(assessment: &str) -> Option<String> {
    EXPLANATION_FIELD
        .captures(assessment)
        .map(|caps| caps[1].to_string())
}

/// Binary outcome recorded by a human reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HumanLabel {
    Success,
    Fail,
}

impl HumanLabel {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "success" => Some(HumanLabel::Success),
            "fail" | "failure" => Some(HumanLabel::Fail),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HumanLabel::Success => "Success",
            HumanLabel::Fail => "Fail",
        }
    }
}

/// How an inconclusive verdict enters the agreement figure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InconclusivePolicy {
    /// Only `VERIFIED` counts as success; everything else is a fail.
    #[default]
    AsFail,
    /// Inconclusive verdicts are left out of the agreement figure.
    Exclude,
}

impl InconclusivePolicy {
    pub fn predict(&self, verdict: Verdict) -> Option<HumanLabel> {
        match (self, verdict) {
            (_, Verdict::Verified) => Some(HumanLabel::Success),
            (InconclusivePolicy::Exclude, Verdict::Inconclusive) => None,
            _ => Some(HumanLabel::Fail),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    FalsePositive,
    FalseNegative,
    Other,
}

impl MismatchKind {
    fn classify(verdict: Verdict, human: HumanLabel) -> Self {
        match (verdict, human) {
            (Verdict::Verified, HumanLabel::Fail) => MismatchKind::FalsePositive,
            (Verdict::Unverified, HumanLabel::Success) => MismatchKind::FalseNegative,
            _ => MismatchKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MismatchKind::FalsePositive => "false positive",
            MismatchKind::FalseNegative => "false negative",
            MismatchKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonRow {
    pub iteration: Iteration,
    pub verdict: Verdict,
    pub predicted: Option<HumanLabel>,
    pub human: Option<HumanLabel>,
    /// `None` when the row does not count towards agreement.
    pub matched: Option<bool>,
    pub mismatch: Option<MismatchKind>,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Comparison {
    pub rows: Vec<ComparisonRow>,
    pub agreements: usize,
    /// Rows that have both a prediction and a human label.
    pub considered: usize,
    pub verdicts: BTreeMap<Verdict, usize>,
    pub labels: BTreeMap<String, usize>,
}

impl Comparison {
    pub fn agreement_percentage(&self) -> f64 {
        if self.considered == 0 {
            0.0
        } else {
            self.agreements as f64 * 100.0 / self.considered as f64
        }
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &ComparisonRow> {
        self.rows.iter().filter(|row| row.matched == Some(false))
    }

    pub fn mismatch_count(&self, kind: MismatchKind) -> usize {
        self.mismatches()
            .filter(|row| row.mismatch == Some(kind))
            .count()
    }

    /// Plain-text report.
    pub fn render(&self) -> String {
        let total = self.rows.len();
        let mut out = String::new();
        let _ = writeln!(out, "--- Verdict vs Human Evaluation ---");
        let _ = writeln!(out, "{:>9}  {:<12}  {:<9}  {:<9}  match", "iteration", "verdict", "predicted", "human");
        for row in &self.rows {
            let _ = writeln!(
                out,
                "{:>9}  {:<12}  {:<9}  {:<9}  {}",
                row.iteration,
                row.verdict.as_str(),
                row.predicted.map(|l| l.as_str()).unwrap_or("-"),
                row.human.map(|l| l.as_str()).unwrap_or("-"),
                match row.matched {
                    Some(true) => "yes",
                    Some(false) => "no",
                    None => "n/a",
                }
            );
        }

        let _ = writeln!(out, "\n--- Summary ---");
        let _ = writeln!(out, "Total iterations: {total}");
        let _ = writeln!(out, "Compared: {}", self.considered);
        let _ = writeln!(out, "Agreements: {}", self.agreements);
        let _ = writeln!(out, "Agreement percentage: {:.2}%", self.agreement_percentage());

        let _ = writeln!(out, "\n--- Verdict Distribution ---");
        for (verdict, count) in &self.verdicts {
            let _ = writeln!(out, "{verdict}: {count} ({:.1}%)", percent(*count, total));
        }
        let _ = writeln!(out, "\n--- Human Eval Distribution ---");
        for (label, count) in &self.labels {
            let _ = writeln!(out, "{label}: {count} ({:.1}%)", percent(*count, total));
        }

        let mismatches = self.mismatches().count();
        let _ = writeln!(out, "\n--- Mismatches ({mismatches}) ---");
        for kind in [
            MismatchKind::FalsePositive,
            MismatchKind::FalseNegative,
            MismatchKind::Other,
        ] {
            let count = self.mismatch_count(kind);
            let _ = writeln!(out, "{}: {count} ({:.1}%)", kind.as_str(), percent(count, mismatches));
        }
        for row in self.mismatches() {
            let explanation = row.explanation.as_deref().unwrap_or("");
            let _ = writeln!(
                out,
                "iteration {}: {} vs {} ({}) {}",
                row.iteration,
                row.verdict,
                row.human.map(|l| l.as_str()).unwrap_or("-"),
                row.mismatch.map(|k| k.as_str()).unwrap_or("other"),
                truncate(explanation, 200)
            );
        }
        out
    }
}

fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(limit).collect::<String>())
    }
}

/// Join result rows with human labels on iteration.
///
/// Rows without a usable label are listed but do not count towards agreement.
pub fn compare(
    results: &[ResultRow],
    labels: &BTreeMap<Iteration, String>,
    policy: InconclusivePolicy,
) -> Comparison {
    let mut comparison = Comparison::default();
    for result in results {
        let verdict = Verdict::parse(&result.final_assessment);
        let raw_label = labels.get(&result.iteration);
        let human = raw_label.and_then(|label| HumanLabel::parse(label));
        let predicted = policy.predict(verdict);

        *comparison.verdicts.entry(verdict).or_default() += 1;
        let label_key = raw_label
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| "(unlabelled)".to_string());
        *comparison.labels.entry(label_key).or_default() += 1;

        let matched = match (predicted, human) {
            (Some(predicted), Some(human)) => Some(predicted == human),
            _ => None,
        };
        if matched.is_some() {
            comparison.considered += 1;
        }
        if matched == Some(true) {
            comparison.agreements += 1;
        }
        let mismatch = match (matched, human) {
            (Some(false), Some(human)) => Some(MismatchKind::classify(verdict, human)),
            _ => None,
        };

        comparison.rows.push(ComparisonRow {
            iteration: result.iteration,
            verdict,
            predicted,
            human,
            matched,
            mismatch,
            explanation: extract_explanation(&result.final_assessment),
        });
    }
    comparison
}

/// Read `iteration → label` pairs from a labelled sheet.
pub fn load_labels(
    source: &dyn DatasetSource,
    sheet: &str,
    iteration_column: &str,
    label_column: &str,
) -> Result<BTreeMap<Iteration, String>, CoveError> {
    let mut labels = BTreeMap::new();
    for (idx, row) in source.sheet(sheet)?.iter().enumerate() {
        let iteration = match row.get(iteration_column) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            CoveError::Dataset(format!(
                "row {} of sheet '{sheet}' has no usable '{iteration_column}' value",
                idx + 1
            ))
        })?;
        let label = match row.get(label_column) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        labels.entry(iteration).or_insert(label);
    }
    Ok(labels)
}

/// Preview of the first `limit` rows: verdict, matched keywords and the raw assessment.
pub fn render_inspection(rows: &[ResultRow], limit: usize) -> String {
    const KEYWORDS: [&str; 4] = ["verified", "unverified", "inconclusive", "disinformation"];
    let mut out = String::new();
    let _ = writeln!(out, "--- First {} final assessments ---", limit.min(rows.len()));
    for row in rows.iter().take(limit) {
        let lower = row.final_assessment.to_lowercase();
        let found: Vec<&str> = KEYWORDS
            .iter()
            .copied()
            .filter(|keyword| lower.contains(keyword))
            .collect();
        let _ = writeln!(out, "\nIteration {}:", row.iteration);
        let _ = writeln!(out, "Evidence items: {}", row.evidence_count);
        let _ = writeln!(out, "Verdict: {}", Verdict::parse(&row.final_assessment));
        let _ = writeln!(out, "Keywords: [{}]", found.join(", "));
        let _ = writeln!(out, "Content: {}", row.final_assessment);
    }

    let mut distribution: BTreeMap<Verdict, usize> = BTreeMap::new();
    for row in rows {
        *distribution
            .entry(Verdict::parse(&row.final_assessment))
            .or_default() += 1;
    }
    let _ = writeln!(out, "\n--- Verdict Distribution ---");
    for (verdict, count) in distribution {
        let _ = writeln!(out, "{verdict}: {count} ({:.1}%)", percent(count, rows.len()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_prefers_structured_field() {
        assert_eq!(
            Verdict::parse(r#"{"final_result": "Unverified", "explanation": "was verified elsewhere"}"#),
            Verdict::Unverified
        );
        assert_eq!(
            Verdict::parse(r#"Result: {"final_result":"verified"}"#),
            Verdict::Verified
        );
        assert_eq!(Verdict::parse(r#"{"final_result": "partly"}"#), Verdict::Unknown);
    }

    #[test]
    fn keyword_fallback_checks_unverified_first() {
        assert_eq!(Verdict::parse("The claim is UNVERIFIED."), Verdict::Unverified);
        assert_eq!(Verdict::parse("Claim verified by upload logs."), Verdict::Verified);
        assert_eq!(Verdict::parse("Evidence is inconclusive."), Verdict::Inconclusive);
        assert_eq!(Verdict::parse("This was debunked."), Verdict::Debunked);
        assert_eq!(Verdict::parse("error aggregating assessments: timeout"), Verdict::Unknown);
    }

    #[test]
    fn inconclusive_policy() {
        assert_eq!(InconclusivePolicy::AsFail.predict(Verdict::Inconclusive), Some(HumanLabel::Fail));
        assert_eq!(InconclusivePolicy::Exclude.predict(Verdict::Inconclusive), None);
        assert_eq!(InconclusivePolicy::Exclude.predict(Verdict::Unknown), Some(HumanLabel::Fail));
        assert_eq!(InconclusivePolicy::Exclude.predict(Verdict::Verified), Some(HumanLabel::Success));
    }

    fn result(iteration: Iteration, assessment: &str) -> ResultRow {
        ResultRow {
            evidence_count: 1,
            ..ResultRow::placeholder(iteration, assessment)
        }
    }

    #[test]
    fn compare_counts_agreement_and_classifies_mismatches() {
        let results = vec![
            result(1, r#"{"final_result": "verified", "explanation": "upload dates match"}"#),
            result(2, r#"{"final_result": "verified", "explanation": "subscriber counts agree"}"#),
            result(3, r#"{"final_result": "unverified", "explanation": "no matching channel"}"#),
            result(4, r#"{"final_result": "inconclusive"}"#),
            result(5, "verified"),
        ];
        let labels: BTreeMap<Iteration, String> = [
            (1, "Success"),
            (2, "Fail"),
            (3, "Success"),
            (4, "Fail"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();

        let comparison = compare(&results, &labels, InconclusivePolicy::AsFail);
        assert_eq!(comparison.considered, 4);
        assert_eq!(comparison.agreements, 2);
        assert_eq!(comparison.mismatch_count(MismatchKind::FalsePositive), 1);
        assert_eq!(comparison.mismatch_count(MismatchKind::FalseNegative), 1);
        assert_eq!(comparison.labels.get("(unlabelled)"), Some(&1));
        assert_eq!(
            comparison.rows[2].explanation.as_deref(),
            Some("no matching channel")
        );

        let excluded = compare(&results, &labels, InconclusivePolicy::Exclude);
        assert_eq!(excluded.considered, 3);
        assert_eq!(excluded.agreements, 1);
    }

    #[test]
    fn inspection_lists_keywords() {
        let text = render_inspection(&[result(7, "Claim unverified; likely disinformation")], 5);
        assert!(text.contains("Verdict: UNVERIFIED"));
        assert!(text.contains("Keywords: [verified, unverified, disinformation]"));
    }
}
