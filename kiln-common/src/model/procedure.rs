// kiln-common/src/model/procedure.rs
//! Install and test procedures: declarative (guard, step) lists that turn into
//! concrete process invocations once the option snapshot and paths are known.
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::option::ResolvedOptions;
use super::predicate::{holds, Predicate};
use super::template::TemplateVars;
use crate::error::{KilnError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepPhase {
    #[default]
    Build,
    Install,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPhase::Build => f.write_str("build"),
            StepPhase::Install => f.write_str("install"),
        }
    }
}

/// One argument of a step, optionally present only when its guard holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepArg {
    Plain(String),
    Guarded { value: String, when: Predicate },
}

impl StepArg {
    fn selected(&self, options: &ResolvedOptions) -> Option<&str> {
        match self {
            StepArg::Plain(value) => Some(value),
            StepArg::Guarded { value, when } => when.evaluate(options).then_some(value.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub name: Option<String>,
    pub run: Vec<StepArg>,
    #[serde(default)]
    pub when: Option<Predicate>,
    /// Working directory relative to the build path.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub phase: StepPhase,
}

impl Step {
    pub fn command(run: &[&str]) -> Self {
        Self {
            name: None,
            run: run.iter().map(|s| StepArg::Plain(s.to_string())).collect(),
            when: None,
            cwd: None,
            env: BTreeMap::new(),
            phase: StepPhase::Build,
        }
    }

    pub fn in_phase(mut self, phase: StepPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn guarded(mut self, when: Predicate) -> Self {
        self.when = Some(when);
        self
    }

    pub fn predicates(&self) -> impl Iterator<Item = &Predicate> {
        self.when.iter().chain(self.run.iter().filter_map(|arg| match arg {
            StepArg::Guarded { when, .. } => Some(when),
            StepArg::Plain(_) => None,
        }))
    }
}

/// Everything a procedure needs to produce its invocations.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub formula: String,
    pub buildpath: PathBuf,
    pub prefix: PathBuf,
    pub options: ResolvedOptions,
    /// Additive environment overlay applied to every invocation.
    pub env: BTreeMap<String, String>,
    pub vars: BTreeMap<String, String>,
}

impl BuildContext {
    pub fn template_vars(&self) -> TemplateVars<'_> {
        let mut vars = TemplateVars::new(&self.options);
        vars.set("buildpath", self.buildpath.to_string_lossy())
            .set("prefix", self.prefix.to_string_lossy());
        for (key, value) in &self.vars {
            vars.set(key, value.clone());
        }
        vars
    }
}

/// A fully expanded external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub phase: StepPhase,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Procedure(pub Vec<Step>);

impl Procedure {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn steps(&self) -> &[Step] {
        &self.0
    }

    /// Steps whose guard holds for the given options, in declaration order.
    pub fn active_steps<'a>(&'a self, options: &'a ResolvedOptions) -> impl Iterator<Item = &'a Step> {
        self.0
            .iter()
            .filter(move |step| holds(step.when.as_ref(), options))
    }

    pub fn invocations(&self, ctx: &BuildContext) -> Result<Vec<Invocation>> {
        let vars = ctx.template_vars();
        let mut out = Vec::new();
        for (index, step) in self.active_steps(&ctx.options).enumerate() {
            let mut argv = Vec::with_capacity(step.run.len());
            for arg in &step.run {
                if let Some(raw) = arg.selected(&ctx.options) {
                    argv.push(vars.expand(raw)?);
                }
            }
            if argv.is_empty() {
                return Err(KilnError::ParseError(
                    ctx.formula.clone(),
                    format!("step {} has no command", index + 1),
                ));
            }
            let program = argv.remove(0);
            let cwd = match &step.cwd {
                Some(rel) => resolve_inside(&ctx.buildpath, &vars.expand(rel)?)?,
                None => ctx.buildpath.clone(),
            };
            let mut env = ctx.env.clone();
            for (key, value) in &step.env {
                env.insert(key.clone(), vars.expand(value)?);
            }
            let label = match &step.name {
                Some(name) => name.clone(),
                None => Path::new(&program)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| program.clone()),
            };
            out.push(Invocation {
                label,
                program,
                args: argv,
                cwd,
                env,
                phase: step.phase,
            });
        }
        Ok(out)
    }
}

/// Join `rel` onto `base`, refusing absolute paths and `..` escapes.
pub fn resolve_inside(base: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir))
    {
        return Err(KilnError::ParseError(
            "path".to_string(),
            format!("'{rel}' must be a relative path inside the build directory"),
        ));
    }
    Ok(base.join(rel_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::option::OptionValue;

    fn context(options: ResolvedOptions) -> BuildContext {
        BuildContext {
            formula: "llvm".into(),
            buildpath: PathBuf::from("/tmp/build"),
            prefix: PathBuf::from("/opt/kiln/lib/llvm-3.4"),
            options,
            env: BTreeMap::from([("REQUIRES_RTTI".to_string(), "1".to_string())]),
            vars: BTreeMap::new(),
        }
    }

    #[test]
    fn guarded_arguments_follow_options() {
        let procedure: Procedure = toml::from_str::<BTreeMap<String, Procedure>>(
            r#"
            install = [
              { run = ["./configure", "--prefix={prefix}", { value = "--enable-libcpp", when = "with-libcxx" }] },
              { run = ["make", "install"], phase = "install" },
              { run = ["make", "-C", "projects/libcxx", "install"], when = "with-libcxx", phase = "install" },
            ]
            "#,
        )
        .unwrap()
        .remove("install")
        .unwrap();

        let mut opts = ResolvedOptions::new();
        opts.insert("with-libcxx", OptionValue::Bool(false));
        let plain = procedure.invocations(&context(opts)).unwrap();
        assert_eq!(plain.len(), 2);
        assert_eq!(plain[0].args, vec!["--prefix=/opt/kiln/lib/llvm-3.4"]);
        assert_eq!(plain[1].phase, StepPhase::Install);

        let mut opts = ResolvedOptions::new();
        opts.insert("with-libcxx", OptionValue::Bool(true));
        let with_libcxx = procedure.invocations(&context(opts)).unwrap();
        assert_eq!(with_libcxx.len(), 3);
        assert_eq!(
            with_libcxx[0].args,
            vec!["--prefix=/opt/kiln/lib/llvm-3.4", "--enable-libcpp"]
        );
        assert_eq!(with_libcxx[2].env.get("REQUIRES_RTTI").map(String::as_str), Some("1"));
    }

    #[test]
    fn cwd_cannot_escape_buildpath() {
        assert!(resolve_inside(Path::new("/tmp/build"), "../etc").is_err());
        assert!(resolve_inside(Path::new("/tmp/build"), "/etc").is_err());
        assert_eq!(
            resolve_inside(Path::new("/tmp/build"), "projects/libcxx").unwrap(),
            PathBuf::from("/tmp/build/projects/libcxx")
        );
    }
}
