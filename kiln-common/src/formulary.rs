use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::config::Config;
use super::error::{KilnError, Result};
use super::model::formula::Formula;

/// Loads recipes from the formula directories and keeps every parsed formula
/// for the rest of the process.
#[derive(Debug)]
pub struct Formulary {
    dirs: Vec<PathBuf>,
    parsed_cache: Mutex<HashMap<String, Arc<Formula>>>,
}

impl Formulary {
    pub fn new(config: &Config) -> Self {
        Self::with_dirs(config.formula_dirs())
    }

    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            parsed_cache: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory formulary, used by tests and by callers that build recipes in code.
    pub fn from_formulas(formulas: impl IntoIterator<Item = Formula>) -> Result<Self> {
        let mut map = HashMap::new();
        for mut formula in formulas {
            formula.finalize()?;
            map.insert(formula.name.clone(), Arc::new(formula));
        }
        Ok(Self {
            dirs: Vec::new(),
            parsed_cache: Mutex::new(map),
        })
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<Formula>>>> {
        self.parsed_cache
            .lock()
            .map_err(|_| KilnError::Generic("formulary cache lock poisoned".to_string()))
    }

    fn recipe_path(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(format!("{name}.toml")))
            .find(|path| path.is_file())
    }

    pub fn load_formula(&self, name: &str) -> Result<Arc<Formula>> {
        if let Some(formula) = self.cache()?.get(name) {
            debug!("Loaded formula '{}' from parsed cache.", name);
            return Ok(Arc::clone(formula));
        }

        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(KilnError::FormulaNotFound(name.to_string()));
        }
        let Some(path) = self.recipe_path(name) else {
            debug!("No recipe for '{}' in {:?}", name, self.dirs);
            return Err(KilnError::FormulaNotFound(name.to_string()));
        };

        let raw = fs::read_to_string(&path)?;
        let formula = Arc::new(Formula::from_toml_str(name, &raw)?);
        debug!(
            "Successfully loaded formula '{}' version {} from {}",
            formula.name,
            formula.version_str_full(),
            path.display()
        );
        self.cache()?
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&formula));
        Ok(formula)
    }

    /// Names of every recipe found in the formula directories, sorted.
    pub fn available(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.cache()?.keys().cloned().collect();
        for dir in &self.dirs {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}
