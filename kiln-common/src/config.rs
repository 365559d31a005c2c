// kiln-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{KilnError, Result};

// Used when KILN_ROOT is not set or is empty.
const DEFAULT_FALLBACK_KILN_ROOT: &str = "/opt/kiln";

/// Option names that a user flag applies to every formula in the plan declaring them.
pub const GLOBAL_OPTIONS: &[&str] = &["universal"];

#[derive(Debug, Clone)]
pub struct Config {
    pub kiln_root: PathBuf,
    /// Extra recipe directories searched before `<root>/Library/Formula`.
    pub formula_paths: Vec<PathBuf>,
    pub site_packages: Option<PathBuf>,
    /// Number of plan entries allowed to build at the same time.
    pub jobs: usize,
    /// Parallelism handed to make through MAKEFLAGS.
    pub make_jobs: usize,
    pub keep_tmp: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading kiln configuration");

        let kiln_root = env::var("KILN_ROOT")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                debug!(
                    "KILN_ROOT not set or empty, falling back to default: {}",
                    DEFAULT_FALLBACK_KILN_ROOT
                );
                PathBuf::from(DEFAULT_FALLBACK_KILN_ROOT)
            });
        if !kiln_root.is_absolute() {
            return Err(KilnError::Config(format!(
                "KILN_ROOT must be an absolute path, got '{}'",
                kiln_root.display()
            )));
        }

        let formula_paths = env::var_os("KILN_FORMULA_PATH")
            .map(|raw| env::split_paths(&raw).collect())
            .unwrap_or_default();
        let site_packages = env::var_os("KILN_SITE_PACKAGES").map(PathBuf::from);

        let jobs = match env::var("KILN_JOBS") {
            Ok(raw) => raw.parse::<usize>().map_err(|e| {
                KilnError::Config(format!("KILN_JOBS must be a positive integer: {e}"))
            })?,
            Err(_) => 1,
        }
        .max(1);
        let keep_tmp = env::var("KILN_KEEP_TMP").is_ok_and(|v| v == "1");

        let mut config = Self::with_root(kiln_root);
        config.formula_paths = formula_paths;
        config.site_packages = site_packages;
        config.jobs = jobs;
        config.keep_tmp = keep_tmp;
        debug!("Effective KILN_ROOT set to: {}", config.kiln_root.display());
        Ok(config)
    }

    /// Configuration rooted at `root` with every other setting at its default.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            kiln_root: root.into(),
            formula_paths: Vec::new(),
            site_packages: None,
            jobs: 1,
            make_jobs: num_cpus::get().max(1),
            keep_tmp: false,
        }
    }

    pub fn kiln_root(&self) -> &Path {
        &self.kiln_root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.kiln_root.join("bin")
    }

    pub fn man_base_dir(&self) -> PathBuf {
        self.kiln_root.join("share").join("man")
    }

    pub fn man1_dir(&self) -> PathBuf {
        self.man_base_dir().join("man1")
    }

    /// Shared library root holding the private per-formula prefixes.
    pub fn lib_dir(&self) -> PathBuf {
        self.kiln_root.join("lib")
    }

    pub fn site_packages_dir(&self) -> PathBuf {
        self.site_packages
            .clone()
            .unwrap_or_else(|| self.lib_dir().join("python").join("site-packages"))
    }

    pub fn formula_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.formula_paths.clone();
        dirs.push(self.kiln_root.join("Library").join("Formula"));
        dirs
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.kiln_root.join("var").join("cache").join("kiln")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.kiln_root.join("var").join("log").join("kiln")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.kiln_root.join("var").join("kiln")
    }

    pub fn records_path(&self) -> PathBuf {
        self.state_dir().join("installed.json")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.kiln_root.join("tmp")
    }

    /// Private prefix for one formula build: `<lib>/<name>-<version>`, with the option
    /// fingerprint appended for non-default variants so they never share a directory.
    pub fn formula_prefix(&self, name: &str, version: &str, variant: Option<&str>) -> PathBuf {
        match variant {
            Some(fingerprint) => self
                .lib_dir()
                .join(format!("{name}-{version}-{fingerprint}")),
            None => self.lib_dir().join(format!("{name}-{version}")),
        }
    }

    pub fn formula_logs_dir(&self, name: &str) -> PathBuf {
        self.logs_dir().join(name)
    }
}
