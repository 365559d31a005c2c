// kiln-core/src/install/suffix.rs
//! Link suffix computation.
//!
//! A formula either declares a probe (run the freshly installed tool and read
//! the version off its first output line) or takes the suffix from its own
//! version. `none` links entry points under their plain names.
use std::collections::BTreeMap;
use std::path::Path;

use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::{Formula, SuffixKeyword, SuffixSpec};
use kiln_common::model::option::ResolvedOptions;
use kiln_common::model::procedure::{Invocation, StepPhase};
use kiln_common::model::template::TemplateVars;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::process::{StepOutcome, StepRunner};

/// `major.minor` of the formula version, falling back to the leading numeric
/// run and finally to the raw version string.
pub fn suffix_from_version(formula: &Formula) -> String {
    if let Ok(v) = formula.version_semver() {
        return format!("{}.{}", v.major, v.minor);
    }
    let leading = Regex::new(r"^\d+(\.\d+)?").ok();
    leading
        .as_ref()
        .and_then(|re| re.find(&formula.version))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| formula.version.clone())
}

/// Pull the suffix out of the first non-empty line of a probe's output.
pub fn parse_probe_output(formula_name: &str, output: &str, pattern: &str) -> Result<String> {
    let re = Regex::new(pattern).map_err(|e| {
        KilnError::VersionProbe(formula_name.to_string(), format!("bad pattern '{pattern}': {e}"))
    })?;
    let first_line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| {
            KilnError::VersionProbe(formula_name.to_string(), "probe printed nothing".to_string())
        })?;
    re.find(first_line)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            KilnError::VersionProbe(
                formula_name.to_string(),
                format!("'{first_line}' does not match /{pattern}/"),
            )
        })
}

pub async fn compute_suffix(
    formula: &Formula,
    prefix: &Path,
    options: &ResolvedOptions,
    runner: &dyn StepRunner,
    cancel: &CancellationToken,
) -> Result<String> {
    let (probe, pattern) = match &formula.link.suffix {
        SuffixSpec::Keyword(SuffixKeyword::None) => return Ok(String::new()),
        SuffixSpec::Keyword(SuffixKeyword::Version) => return Ok(suffix_from_version(formula)),
        SuffixSpec::Probe { probe, pattern } => (probe, pattern),
    };

    let mut vars = TemplateVars::new(options);
    for (key, value) in formula.base_vars() {
        vars.set(&key, value);
    }
    vars.set("prefix", prefix.to_string_lossy());
    let mut argv = probe
        .iter()
        .map(|arg| vars.expand(arg))
        .collect::<Result<Vec<_>>>()?;
    if argv.is_empty() {
        return Err(KilnError::VersionProbe(
            formula.name().to_string(),
            "empty probe command".to_string(),
        ));
    }
    let program = argv.remove(0);
    let invocation = Invocation {
        label: "version-probe".to_string(),
        program,
        args: argv,
        cwd: prefix.to_path_buf(),
        env: BTreeMap::new(),
        phase: StepPhase::Install,
    };
    debug!("[{}] Probing suffix: {}", formula.name(), invocation.command_line());

    match runner.run(&invocation, cancel).await {
        Ok(StepOutcome::Exited(output)) if output.success() => {
            parse_probe_output(formula.name(), &output.combined(), pattern)
        }
        Ok(StepOutcome::Exited(output)) => Err(KilnError::VersionProbe(
            formula.name().to_string(),
            format!(
                "'{}' exited with {:?}: {}",
                invocation.command_line(),
                output.exit_code,
                output.combined().trim()
            ),
        )),
        Ok(StepOutcome::Cancelled(_)) => Err(KilnError::Cancelled {
            formula: formula.name().to_string(),
            step: invocation.label,
        }),
        Err(e) => Err(KilnError::VersionProbe(formula.name().to_string(), e.to_string())),
    }
}
