mod catalog;
mod classifier;
mod machine;

pub use catalog::SlotId;
pub use classifier::{AnswerClassifier, RuleClassifier};
pub use machine::ClarificationEngine;
