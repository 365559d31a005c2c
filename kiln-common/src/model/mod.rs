// kiln-common/src/model/mod.rs
// Declares the modules within the model directory.
pub mod formula;
pub mod option;
pub mod predicate;
pub mod procedure;
pub mod template;

// Re-export
pub use formula::{Formula, LinkSpec, SourceSpec, SuffixKeyword, SuffixSpec};
pub use option::{FormulaOption, OptionValue, ResolvedOptions};
pub use predicate::Predicate;
pub use procedure::{BuildContext, Invocation, Procedure, Step, StepPhase};
pub use template::TemplateVars;
