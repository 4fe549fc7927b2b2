//! Intent classification and complexity routing
//!
//! Turns (user text, session tail, room context, tool catalog) into a
//! ranked list of intent candidates, and decides whether a query needs the
//! multi-step agent. Both decisions are influenced by stored feedback
//! corrections.

pub mod classifier;
pub mod complexity;
pub mod prompt;

pub use classifier::{Classification, ClassifierConfig, IntentClassifier};
pub use complexity::{Complexity, ComplexityDetector};
pub use prompt::ClassifierPromptInputs;

use thiserror::Error;

/// Classifier errors (all recovered before they reach the user)
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("LM call failed: {0}")]
    Llm(String),

    #[error("No parseable candidate block in LM output")]
    Unparseable,
}

impl From<ClassifierError> for hearth_core::Error {
    fn from(err: ClassifierError) -> Self {
        hearth_core::Error::Internal(err.to_string())
    }
}
