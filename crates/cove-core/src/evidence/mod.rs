//! Normalization of raw evidence cells into an ordered list of evidence strings.
//!
//! Cells arrive in whatever shape the spreadsheet held: a list literal, a
//! mapping literal, a bare sentence, or an already-structured JSON value.
//! Everything downstream only ever sees [`EvidenceList`].

pub mod literal;

use serde_json::Value;
use tracing::warn;

use literal::Literal;

/// Canonical evidence for one record: ordered, non-empty strings.
pub type EvidenceList = Vec<String>;

/// Shape of an evidence cell after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum EvidenceContent {
    /// Null, blank, or content that could not be read.
    Empty,
    /// A single free-text observation.
    Text(String),
    /// An ordered collection of observations.
    List(Vec<String>),
    /// A mapping kept whole as one observation, in its literal notation.
    Mapping(String),
}

impl EvidenceContent {
    /// Classify a raw cell. Never fails: unreadable content degrades to [`EvidenceContent::Empty`].
    pub fn classify(cell: &Value) -> Self {
        match cell {
            Value::Null => EvidenceContent::Empty,
            Value::String(text) => Self::from_text(text),
            Value::Array(items) => EvidenceContent::List(
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        other => Some(other.to_string()),
                    })
                    .collect(),
            ),
            Value::Object(_) => EvidenceContent::Mapping(cell.to_string()),
            Value::Bool(_) | Value::Number(_) => EvidenceContent::Text(cell.to_string()),
        }
    }

    fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
            return EvidenceContent::Empty;
        }

        let looks_structured = trimmed.starts_with(['[', '(', '{']);
        match literal::parse(trimmed) {
            Ok(Literal::List(items)) | Ok(Literal::Tuple(items)) => EvidenceContent::List(
                items
                    .iter()
                    .filter(|item| !matches!(item, Literal::None))
                    .map(Literal::to_text)
                    .collect(),
            ),
            Ok(Literal::Dict(_)) => EvidenceContent::Mapping(trimmed.to_string()),
            Ok(Literal::None) => EvidenceContent::Empty,
            Ok(scalar) => EvidenceContent::Text(scalar.to_text()),
            Err(err) if looks_structured => {
                warn!(error = %err, "evidence literal unreadable; treating record as having no evidence");
                EvidenceContent::Empty
            }
            Err(_) => EvidenceContent::Text(trimmed.to_string()),
        }
    }

    pub fn into_list(self) -> EvidenceList {
        let items = match self {
            EvidenceContent::Empty => Vec::new(),
            EvidenceContent::Text(text) => vec![text],
            EvidenceContent::List(items) => items,
            EvidenceContent::Mapping(text) => vec![text],
        };
        items
            .into_iter()
            .filter(|item| !item.trim().is_empty())
            .collect()
    }
}

/// Normalize one raw evidence cell.
pub fn normalize(cell: &Value) -> EvidenceList {
    EvidenceContent::classify(cell).into_list()
}
