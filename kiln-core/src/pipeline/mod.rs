// kiln-core/src/pipeline/mod.rs
use std::collections::BTreeMap;

use kiln_common::config::Config;
use kiln_common::model::formula::Formula;

pub mod executor;
pub mod steps;

pub use executor::{BuildExecutor, ExecutionReport};
pub use test::run_formula_test;

/// Template variables shared by the install and test procedures of `formula`.
pub(crate) fn formula_vars(config: &Config, formula: &Formula) -> BTreeMap<String, String> {
    let mut vars = formula.base_vars();
    vars.insert("root".into(), config.kiln_root().to_string_lossy().to_string());
    vars.insert("bin".into(), config.bin_dir().to_string_lossy().to_string());
    vars.insert("lib".into(), config.lib_dir().to_string_lossy().to_string());
    vars.insert("jobs".into(), config.make_jobs.to_string());
    vars
}
