use std::collections::BTreeMap;

use cove_core::eval::{self, HumanLabel, MismatchKind};
use cove_core::{InconclusivePolicy, JsonWorkbook, ResultRow, Verdict};
use serde_json::json;

fn row(iteration: u64, final_assessment: &str) -> ResultRow {
    ResultRow {
        iteration,
        evidence_count: 1,
        evidence_list: vec![format!("evidence for {iteration}")],
        verification_questions: vec![vec!["Was it posted first here?".to_string()]],
        verification_answers: vec![format!("Evidence 1:\nanswer {iteration}")],
        credibility_assessments: vec![final_assessment.to_string()],
        final_assessment: final_assessment.to_string(),
    }
}

fn sample() -> (Vec<ResultRow>, BTreeMap<u64, String>) {
    let results = vec![
        row(1, r#"{"final_result": "VERIFIED", "explanation": "matches upload logs"}"#),
        row(2, r#"{"final_result": "VERIFIED", "explanation": "looks consistent"}"#),
        row(3, "The claim remains inconclusive."),
    ];
    let labels = BTreeMap::from([
        (1, "Success".to_string()),
        (2, "Fail".to_string()),
        (3, String::new()),
    ]);
    (results, labels)
}

#[test]
fn comparison_report_renders_agreement_and_mismatches() {
    let (results, labels) = sample();
    let comparison = eval::compare(&results, &labels, InconclusivePolicy::AsFail);

    assert_eq!(comparison.considered, 2);
    assert_eq!(comparison.agreements, 1);
    assert_eq!(comparison.mismatch_count(MismatchKind::FalsePositive), 1);
    assert_eq!(comparison.rows[2].matched, None);

    insta::assert_snapshot!(comparison.render(), @r"
    --- Verdict vs Human Evaluation ---
    iteration  verdict       predicted  human      match
            1  VERIFIED      Success    Success    yes
            2  VERIFIED      Success    Fail       no
            3  INCONCLUSIVE  Fail       -          n/a

    --- Summary ---
    Total iterations: 3
    Compared: 2
    Agreements: 1
    Agreement percentage: 50.00%

    --- Verdict Distribution ---
    VERIFIED: 2 (66.7%)
    INCONCLUSIVE: 1 (33.3%)

    --- Human Eval Distribution ---
    (unlabelled): 1 (33.3%)
    Fail: 1 (33.3%)
    Success: 1 (33.3%)

    --- Mismatches (1) ---
    false positive: 1 (100.0%)
    false negative: 0 (0.0%)
    other: 0 (0.0%)
    iteration 2: VERIFIED vs Fail (false positive) looks consistent
    ");
}

#[test]
fn excluding_inconclusive_changes_only_the_inconclusive_rows() {
    let results = vec![
        row(1, r#"{"final_result": "INCONCLUSIVE"}"#),
        row(2, r#"{"final_result": "UNVERIFIED"}"#),
    ];
    let labels = BTreeMap::from([(1, "Fail".to_string()), (2, "Success".to_string())]);

    let strict = eval::compare(&results, &labels, InconclusivePolicy::AsFail);
    assert_eq!(strict.considered, 2);
    assert_eq!(strict.agreements, 1);

    let lenient = eval::compare(&results, &labels, InconclusivePolicy::Exclude);
    assert_eq!(lenient.considered, 1);
    assert_eq!(lenient.agreements, 0);
    assert_eq!(lenient.rows[1].mismatch, Some(MismatchKind::FalseNegative));
    assert_eq!(lenient.rows[1].human, Some(HumanLabel::Success));
}

#[test]
fn labels_load_from_a_workbook_sheet() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("labels.json");
    let workbook = json!({
        "Reviewed": [
            { "Iterations": 1, "human_eval": "Success" },
            { "Iterations": "2", "human_eval": "Fail" },
            { "Iterations": 3, "human_eval": null }
        ]
    });
    std::fs::write(&path, workbook.to_string()).unwrap();

    let labels =
        eval::load_labels(&JsonWorkbook::open(&path), "Reviewed", "Iterations", "human_eval")
            .unwrap();
    assert_eq!(labels.get(&1).map(String::as_str), Some("Success"));
    assert_eq!(labels.get(&2).map(String::as_str), Some("Fail"));
    assert_eq!(labels.get(&3).map(String::as_str), Some(""));
}

#[test]
fn inspection_lists_verdicts_and_keywords() {
    let (results, _) = sample();
    let text = eval::render_inspection(&results, 2);

    assert!(text.starts_with("--- First 2 final assessments ---"));
    assert!(text.contains("Iteration 1:\nEvidence items: 1\nVerdict: VERIFIED\nKeywords: [verified]"));
    assert!(!text.contains("Iteration 3:"));
    assert!(text.contains("INCONCLUSIVE: 1 (33.3%)"));
    assert_eq!(Verdict::parse(&results[2].final_assessment), Verdict::Inconclusive);
}
