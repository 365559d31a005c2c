// kiln-core/src/build/env.rs
//! Per-build environment overlay.
//!
//! The overlay is handed to every invocation of one build and applied to the
//! child process only. The orchestrator's own environment is never modified.
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::Formula;
use kiln_common::model::option::ResolvedOptions;
use kiln_common::model::template::TemplateVars;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
}

impl BuildEnvironment {
    /// Assemble the overlay for one build:
    /// 1. `PATH` with the shared bin dir and each dependency prefix's `bin` in front
    ///    of the inherited `PATH`.
    /// 2. `CMAKE_PREFIX_PATH` listing dependency prefixes.
    /// 3. `MAKEFLAGS=-j<make_jobs>`.
    /// 4. The formula's own `env` entries whose guard holds, expanded with `vars`.
    ///    These win over anything set above.
    pub fn new(
        formula: &Formula,
        options: &ResolvedOptions,
        dependency_prefixes: &[PathBuf],
        config: &Config,
        vars: &TemplateVars<'_>,
    ) -> Result<Self> {
        let mut overlay = BTreeMap::new();

        let mut path_dirs: Vec<PathBuf> = dependency_prefixes
            .iter()
            .map(|p| p.join("bin"))
            .filter(|p| p.is_dir())
            .collect();
        path_dirs.push(config.bin_dir());
        if let Some(inherited) = env::var_os("PATH") {
            path_dirs.extend(env::split_paths(&inherited));
        }
        set_path_list_var(&mut overlay, "PATH", &path_dirs)?;

        if !dependency_prefixes.is_empty() {
            set_path_list_var(&mut overlay, "CMAKE_PREFIX_PATH", dependency_prefixes)?;
        }

        overlay.insert("MAKEFLAGS".to_string(), format!("-j{}", config.make_jobs));

        for (key, value) in formula.env_overlay(options) {
            let expanded = vars.expand(&value)?;
            debug!("[{}] env overlay {}={}", formula.name(), key, expanded);
            overlay.insert(key, expanded);
        }

        Ok(Self { vars: overlay })
    }

    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn into_vars(self) -> BTreeMap<String, String> {
        self.vars
    }
}

fn set_path_list_var(vars: &mut BTreeMap<String, String>, name: &str, paths: &[PathBuf]) -> Result<()> {
    let joined = env::join_paths(paths.iter().map(PathBuf::as_path))
        .map_err(|e| KilnError::Generic(format!("Failed to join {name}: {e}")))?;
    let joined = joined.into_string().map_err(|raw| {
        KilnError::Generic(format!("{name} contains non-UTF8 characters: {raw:?}"))
    })?;
    vars.insert(name.to_string(), joined);
    Ok(())
}

/// Whether `dir` is listed in a colon-separated path variable value.
pub fn path_list_contains(value: &str, dir: &Path) -> bool {
    env::split_paths(value).any(|p| p == dir)
}
