// kiln-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::model::predicate::Predicate;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DependencyTag: u8 {
        const RUNTIME     = 0b00000001;
        const BUILD       = 0b00000010;
        const TEST        = 0b00000100;
        const OPTIONAL    = 0b00001000;
        const RECOMMENDED = 0b00010000;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// How strongly a formula needs one of its dependencies, as written in recipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    #[default]
    Required,
    Recommended,
    Optional,
    Build,
    Test,
}

impl Strength {
    pub fn tags(self) -> DependencyTag {
        match self {
            Strength::Required => DependencyTag::RUNTIME,
            Strength::Recommended => DependencyTag::RECOMMENDED,
            Strength::Optional => DependencyTag::OPTIONAL,
            Strength::Build => DependencyTag::BUILD,
            Strength::Test => DependencyTag::TEST,
        }
    }

    /// Recommended and optional dependencies are switched by a `with-<dep>` option.
    pub fn is_switchable(self) -> bool {
        matches!(self, Strength::Recommended | Strength::Optional)
    }
}

impl fmt::Display for Strength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strength::Required => "required",
            Strength::Recommended => "recommended",
            Strength::Optional => "optional",
            Strength::Build => "build",
            Strength::Test => "test",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub strength: Strength,
    /// Path inside the dependent's build tree that receives this formula's prefix.
    #[serde(default)]
    pub graft: Option<String>,
    #[serde(default)]
    pub when: Option<Predicate>,
    /// Flags threaded through to the dependency's own option set.
    #[serde(default)]
    pub flags: Vec<String>,
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self::new_with_strength(name, Strength::Required)
    }

    pub fn new_with_strength(name: impl Into<String>, strength: Strength) -> Self {
        Self {
            name: name.into(),
            strength,
            graft: None,
            when: None,
            flags: Vec::new(),
        }
    }

    pub fn grafted_at(mut self, path: impl Into<String>) -> Self {
        self.graft = Some(path.into());
        self
    }

    pub fn guarded(mut self, when: Predicate) -> Self {
        self.when = Some(when);
        self
    }

    pub fn with_flags(mut self, flags: &[&str]) -> Self {
        self.flags = flags.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn tags(&self) -> DependencyTag {
        self.strength.tags()
    }

    /// Name of the option that switches this dependency, if it has one.
    pub fn switch_option(&self) -> Option<String> {
        (self.strength.is_switchable() && self.when.is_none())
            .then(|| format!("with-{}", self.name))
    }
}
