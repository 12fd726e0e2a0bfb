//! The four reasoning stages of the verification chain.

pub mod aggregate;
pub mod assess;
pub mod questions;
pub mod verify;

pub use aggregate::Aggregator;
pub use assess::AssessmentScorer;
pub use questions::{QuestionGenerator, parse_questions};
pub use verify::{AnswerOutcome, VerificationAnswer, VerificationExecutor};
