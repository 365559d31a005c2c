// kiln-core/src/lib.rs
pub mod build;
pub mod install;
pub mod pipeline;
pub mod process;
pub mod uninstall;

pub use install::{LinkRepository, LinkRequest};
pub use pipeline::{run_formula_test, BuildExecutor, ExecutionReport};
pub use process::{ProcessRunner, StepOutcome, StepOutput, StepRunner};
pub use uninstall::{uninstall_formula, UninstallOptions};
