// kiln-common/src/model/formula.rs
// A formula is a build recipe: metadata, options, dependencies and the
// install/test/caveats procedures. Recipes are TOML files named <name>.toml.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::option::{FormulaOption, OptionValue, ResolvedOptions};
use super::predicate::{holds, Predicate};
use super::procedure::{resolve_inside, Procedure};
use super::template::TemplateVars;
use crate::dependency::{Dependency, Strength};
use crate::error::{KilnError, Result};

/// Where the source tree of a formula comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceSpec {
    Archive {
        url: String,
        #[serde(default)]
        sha256: Option<String>,
        #[serde(default)]
        mirrors: Vec<String>,
    },
    Git {
        #[serde(alias = "head")]
        git: String,
        #[serde(default)]
        branch: Option<String>,
    },
    Path {
        path: PathBuf,
    },
}

impl SourceSpec {
    pub fn locator(&self) -> String {
        match self {
            SourceSpec::Archive { url, .. } => url.clone(),
            SourceSpec::Git { git, branch } => match branch {
                Some(b) => format!("{git}#{b}"),
                None => git.clone(),
            },
            SourceSpec::Path { path } => path.display().to_string(),
        }
    }
}

/// A forbidden option combination: resolution fails when `when` holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub when: Predicate,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvOverride {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub when: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
    pub text: String,
    #[serde(default)]
    pub when: Option<Predicate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuffixKeyword {
    None,
    Version,
}

fn default_suffix_pattern() -> String {
    r"\d+\.\d+".to_string()
}

/// How the link suffix of an installation is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SuffixSpec {
    Keyword(SuffixKeyword),
    /// Run the freshly installed tool and pull the suffix out of its first output line.
    Probe {
        probe: Vec<String>,
        #[serde(default = "default_suffix_pattern")]
        pattern: String,
    },
}

impl Default for SuffixSpec {
    fn default() -> Self {
        SuffixSpec::Keyword(SuffixKeyword::Version)
    }
}

/// A language-binding directory staged into the prefix and linked into site-packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Directory relative to the build path.
    pub from: String,
    pub name: String,
    #[serde(default)]
    pub when: Option<Predicate>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    #[serde(default)]
    pub suffix: SuffixSpec,
    #[serde(default = "yes")]
    pub bin: bool,
    #[serde(default = "yes")]
    pub man: bool,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

impl Default for LinkSpec {
    fn default() -> Self {
        Self {
            suffix: SuffixSpec::default(),
            bin: true,
            man: true,
            bindings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    #[serde(default)]
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub keg_only: bool,
    #[serde(default)]
    pub options: Vec<FormulaOption>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    pub env: Vec<EnvOverride>,
    #[serde(default)]
    pub install: Procedure,
    #[serde(default)]
    pub test: Procedure,
    #[serde(default)]
    pub caveats: Vec<Caveat>,
    #[serde(default)]
    pub link: LinkSpec,
}

impl Formula {
    /// Bare formula with no options, dependencies or steps.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            revision: 0,
            desc: None,
            homepage: None,
            source: None,
            keg_only: false,
            options: Vec::new(),
            dependencies: Vec::new(),
            constraints: Vec::new(),
            env: Vec::new(),
            install: Procedure::default(),
            test: Procedure::default(),
            caveats: Vec::new(),
            link: LinkSpec::default(),
        }
    }

    /// Parse a recipe. `name` comes from the file name and must agree with any
    /// `name` key inside the recipe.
    pub fn from_toml_str(name: &str, source: &str) -> Result<Self> {
        let mut formula: Formula = toml::from_str(source)
            .map_err(|e| KilnError::ParseError(format!("formula '{name}'"), e.to_string()))?;
        if formula.name.is_empty() {
            formula.name = name.to_string();
        } else if formula.name != name {
            return Err(KilnError::ParseError(
                format!("formula '{name}'"),
                format!("recipe declares name '{}'", formula.name),
            ));
        }
        formula.finalize()?;
        Ok(formula)
    }

    /// Add implicit `with-<dep>` switches and check the recipe is self-consistent.
    pub fn finalize(&mut self) -> Result<()> {
        let declared: HashSet<String> = self.options.iter().map(|o| o.name.clone()).collect();
        let mut implicit = Vec::new();
        for dep in &self.dependencies {
            if let Some(option) = dep.switch_option() {
                if !declared.contains(&option) && !implicit.iter().any(|o: &FormulaOption| o.name == option) {
                    debug!("'{}': implicit option '{}' for {} dependency", self.name, option, dep.strength);
                    implicit.push(FormulaOption::switch(
                        option,
                        format!("Build with {} support", dep.name),
                        dep.strength == Strength::Recommended,
                    ));
                }
            }
        }
        self.options.extend(implicit);
        self.validate()
    }

    fn parse_error(&self, msg: String) -> KilnError {
        KilnError::ParseError(format!("formula '{}'", self.name), msg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(self.parse_error("version must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for option in &self.options {
            if option.name.is_empty() || option.name.starts_with('-') {
                return Err(self.parse_error(format!("invalid option name '{}'", option.name)));
            }
            if !seen.insert(option.name.as_str()) {
                return Err(self.parse_error(format!("option '{}' declared twice", option.name)));
            }
        }

        let mut dep_names = HashSet::new();
        for dep in &self.dependencies {
            if dep.name == self.name {
                return Err(self.parse_error("a formula cannot depend on itself".to_string()));
            }
            if !dep_names.insert(dep.name.as_str()) {
                return Err(self.parse_error(format!("dependency '{}' declared twice", dep.name)));
            }
            if let Some(graft) = &dep.graft {
                if graft.is_empty() {
                    return Err(self.parse_error(format!("empty graft path for '{}'", dep.name)));
                }
                resolve_inside(&PathBuf::from("."), graft)
                    .map_err(|e| self.parse_error(format!("graft of '{}': {e}", dep.name)))?;
            }
        }

        for binding in &self.link.bindings {
            resolve_inside(&PathBuf::from("."), &binding.from)
                .map_err(|e| self.parse_error(format!("binding '{}': {e}", binding.name)))?;
        }

        if let SuffixSpec::Probe { probe, pattern } = &self.link.suffix {
            if probe.is_empty() {
                return Err(self.parse_error("suffix probe has no command".to_string()));
            }
            Regex::new(pattern)
                .map_err(|e| self.parse_error(format!("invalid suffix pattern: {e}")))?;
        }

        for name in self.referenced_options() {
            if !seen.contains(name) {
                return Err(self.parse_error(format!("guard refers to undeclared option '{name}'")));
            }
        }
        Ok(())
    }

    fn predicates(&self) -> Vec<&Predicate> {
        let mut out: Vec<&Predicate> = Vec::new();
        out.extend(self.dependencies.iter().filter_map(|d| d.when.as_ref()));
        out.extend(self.constraints.iter().map(|c| &c.when));
        out.extend(self.env.iter().filter_map(|e| e.when.as_ref()));
        out.extend(self.caveats.iter().filter_map(|c| c.when.as_ref()));
        out.extend(self.link.bindings.iter().filter_map(|b| b.when.as_ref()));
        for step in self.install.steps().iter().chain(self.test.steps()) {
            out.extend(step.predicates());
        }
        out
    }

    /// Every option name read by a guard anywhere in the recipe.
    pub fn referenced_options(&self) -> BTreeSet<&str> {
        self.predicates()
            .into_iter()
            .flat_map(Predicate::referenced_options)
            .collect()
    }

    // --- Accessors ---
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &[FormulaOption] {
        &self.options
    }

    pub fn option(&self, name: &str) -> Option<&FormulaOption> {
        self.options.iter().find(|o| o.name == name)
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Gets the full version string including revision (e.g., "1.2.3_1").
    pub fn version_str_full(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.clone()
        }
    }

    /// Lenient semver view of the version: "3.4" reads as 3.4.0.
    pub fn version_semver(&self) -> Result<Version> {
        let raw = self.version.trim_start_matches('v');
        let padded = match raw.matches('.').count() {
            0 => format!("{raw}.0.0"),
            1 => format!("{raw}.0"),
            _ => raw.to_string(),
        };
        Ok(Version::parse(&padded)?)
    }

    /// Snapshot of every declared option at its default value.
    pub fn default_options(&self) -> ResolvedOptions {
        let mut opts = ResolvedOptions::new();
        for option in &self.options {
            opts.insert(option.name.clone(), option.default.clone());
        }
        opts
    }

    /// Whether a resolved option set is the default one for this formula.
    pub fn is_default_variant(&self, options: &ResolvedOptions) -> bool {
        options.non_default(&self.options).is_empty()
    }

    pub fn violated_constraint(&self, options: &ResolvedOptions) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.when.evaluate(options))
    }

    /// Environment overlay for a build with `options`.
    pub fn env_overlay(&self, options: &ResolvedOptions) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter(|e| holds(e.when.as_ref(), options))
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    pub fn active_bindings<'a>(&'a self, options: &'a ResolvedOptions) -> impl Iterator<Item = &'a Binding> {
        self.link
            .bindings
            .iter()
            .filter(move |b| holds(b.when.as_ref(), options))
    }

    /// Render the caveat blocks whose guard holds.
    pub fn caveats_for(&self, options: &ResolvedOptions, vars: &TemplateVars<'_>) -> Result<Option<String>> {
        let mut blocks = Vec::new();
        for caveat in self.caveats.iter().filter(|c| holds(c.when.as_ref(), options)) {
            blocks.push(vars.expand(caveat.text.trim_end())?);
        }
        Ok((!blocks.is_empty()).then(|| blocks.join("\n\n")))
    }

    /// Template variables every procedure of this formula can use.
    pub fn base_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_string(), self.name.clone()),
            ("version".to_string(), self.version.clone()),
        ])
    }

    pub fn is_switch(&self, name: &str) -> bool {
        self.option(name)
            .is_some_and(|o| matches!(o.default, OptionValue::Bool(_)))
    }
}
