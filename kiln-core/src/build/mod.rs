// kiln-core/src/build/mod.rs
// Preparing a formula build: workspace, sources, grafts and environment.
pub mod env;
pub mod graft;
pub mod source;
pub mod workspace;

pub use env::BuildEnvironment;
pub use graft::{copy_tree, graft_into};
pub use source::{materialize_source, stage_into_prefix};
pub use workspace::BuildWorkspace;
