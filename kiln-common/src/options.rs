// kiln-common/src/options.rs
//! Option/variant engine: turns `--with-X` style flags into option requests,
//! merges requests coming from several requesters and produces the resolved
//! option snapshot of a formula.
use std::collections::BTreeMap;

use tracing::debug;

use crate::config::GLOBAL_OPTIONS;
use crate::error::{KilnError, Result};
use crate::model::formula::Formula;
use crate::model::option::{parse_bool, OptionValue, ResolvedOptions};

/// Requester name used for flags given on the command line.
pub const COMMAND_LINE: &str = "command line";
/// Requester name used for build-wide flags.
pub const GLOBAL: &str = "global flags";

/// One requester asking for one option value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionRequest {
    pub option: String,
    pub value: OptionValue,
    pub origin: String,
}

/// Requests accumulated for one formula, keyed by option name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSet {
    requests: BTreeMap<String, OptionRequest>,
}

impl RequestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request. Returns `true` when it changed the set; a different value
    /// for an already requested option is `UnsatisfiableOptions`.
    pub fn merge(&mut self, formula: &str, request: OptionRequest) -> Result<bool> {
        match self.requests.get(&request.option) {
            Some(existing) if existing.value == request.value => Ok(false),
            Some(existing) => Err(KilnError::UnsatisfiableOptions {
                formula: formula.to_string(),
                option: request.option.clone(),
                requester_a: existing.origin.clone(),
                value_a: existing.value.clone(),
                requester_b: request.origin,
                value_b: request.value,
            }),
            None => {
                self.requests.insert(request.option.clone(), request);
                Ok(true)
            }
        }
    }

    pub fn merge_all(
        &mut self,
        formula: &str,
        requests: impl IntoIterator<Item = OptionRequest>,
    ) -> Result<bool> {
        let mut changed = false;
        for request in requests {
            changed |= self.merge(formula, request)?;
        }
        Ok(changed)
    }

    pub fn get(&self, option: &str) -> Option<&OptionRequest> {
        self.requests.get(option)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionRequest> {
        self.requests.values()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

fn strip_dashes(flag: &str) -> &str {
    flag.strip_prefix("--").unwrap_or(flag)
}

fn split_flag(flag: &str) -> (&str, Option<&str>) {
    match strip_dashes(flag).split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (strip_dashes(flag), None),
    }
}

/// Map a flag onto one of the formula's declared options.
///
/// `--NAME` switches a boolean option on, `--NAME=VALUE` sets it explicitly.
/// `--without-X` / `--disable-X` switch off `with-X` / `enable-X`, and the
/// positive spellings switch off a declared `without-X` / `disable-X`.
pub fn parse_flag(formula: &Formula, flag: &str) -> Result<(String, OptionValue)> {
    let (name, raw_value) = split_flag(flag);
    let invalid = |option: &str, value: &str| KilnError::InvalidOptionValue {
        formula: formula.name().to_string(),
        option: option.to_string(),
        value: value.to_string(),
    };

    if let Some(declared) = formula.option(name) {
        let value = match (&declared.default, raw_value) {
            (OptionValue::Bool(_), None) => OptionValue::Bool(true),
            (OptionValue::Bool(_), Some(raw)) => {
                OptionValue::Bool(parse_bool(raw).ok_or_else(|| invalid(name, raw))?)
            }
            (OptionValue::Str(_), Some(raw)) => OptionValue::Str(raw.to_string()),
            (OptionValue::Str(_), None) => return Err(invalid(name, "")),
        };
        return Ok((name.to_string(), value));
    }

    const OPPOSITES: &[(&str, &str)] = &[
        ("without-", "with-"),
        ("disable-", "enable-"),
        ("with-", "without-"),
        ("enable-", "disable-"),
    ];
    for (prefix, opposite) in OPPOSITES {
        if let Some(rest) = name.strip_prefix(prefix) {
            let target = format!("{opposite}{rest}");
            if formula.is_switch(&target) {
                if let Some(raw) = raw_value {
                    return Err(invalid(name, raw));
                }
                debug!("'{}': flag '{}' switches off '{}'", formula.name(), flag, target);
                return Ok((target, OptionValue::Bool(false)));
            }
        }
    }

    Err(KilnError::UnknownOption {
        formula: formula.name().to_string(),
        flag: flag.to_string(),
    })
}

/// Parse every flag of one requester into option requests.
pub fn parse_flags(formula: &Formula, origin: &str, flags: &[String]) -> Result<Vec<OptionRequest>> {
    flags
        .iter()
        .map(|flag| {
            let (option, value) = parse_flag(formula, flag)?;
            Ok(OptionRequest {
                option,
                value,
                origin: origin.to_string(),
            })
        })
        .collect()
}

/// Split command-line flags into those for the requested formula and the
/// build-wide ones that apply to every formula declaring them.
pub fn split_global_flags(flags: &[String]) -> Result<(Vec<String>, Vec<(String, OptionValue)>)> {
    let mut local = Vec::new();
    let mut global = Vec::new();
    for flag in flags {
        let (name, raw_value) = split_flag(flag);
        if GLOBAL_OPTIONS.contains(&name) {
            let value = match raw_value {
                None => true,
                Some(raw) => parse_bool(raw).ok_or_else(|| KilnError::InvalidOptionValue {
                    formula: GLOBAL.to_string(),
                    option: name.to_string(),
                    value: raw.to_string(),
                })?,
            };
            global.push((name.to_string(), OptionValue::Bool(value)));
        } else {
            local.push(flag.clone());
        }
    }
    Ok((local, global))
}

/// Requests a formula receives from the build-wide flags it declares.
pub fn global_requests(formula: &Formula, globals: &[(String, OptionValue)]) -> Vec<OptionRequest> {
    globals
        .iter()
        .filter(|(name, _)| formula.option(name).is_some())
        .map(|(name, value)| OptionRequest {
            option: name.clone(),
            value: value.clone(),
            origin: GLOBAL.to_string(),
        })
        .collect()
}

/// Defaults overlaid with the accumulated requests. Constraints are not checked here.
pub fn resolve_values(formula: &Formula, requests: &RequestSet) -> ResolvedOptions {
    let mut options = formula.default_options();
    for request in requests.iter() {
        options.insert(request.option.clone(), request.value.clone());
    }
    options
}

/// Check the formula's declared constraints against a resolved snapshot.
pub fn validate(formula: &Formula, options: &ResolvedOptions) -> Result<()> {
    match formula.violated_constraint(options) {
        Some(constraint) => Err(KilnError::InvalidOptionCombination {
            formula: formula.name().to_string(),
            message: constraint.message.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::option::FormulaOption;
    use crate::model::predicate::Predicate;
    use crate::model::formula::Constraint;

    fn llvm() -> Formula {
        let mut f = Formula::new("llvm", "3.4");
        f.options = vec![
            FormulaOption::switch("with-python", "", true),
            FormulaOption::switch("disable-shared", "", false),
            FormulaOption::switch("universal", "", false),
            FormulaOption {
                name: "targets".into(),
                description: String::new(),
                default: OptionValue::Str("host".into()),
            },
        ];
        f.constraints = vec![Constraint {
            when: Predicate::parse("with-python & disable-shared").unwrap(),
            message: "The Python bindings need the shared library.".into(),
        }];
        f
    }

    fn flags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn resolve(formula: &Formula, flags: &[String]) -> Result<ResolvedOptions> {
        let mut requests = RequestSet::new();
        requests.merge_all(formula.name(), parse_flags(formula, COMMAND_LINE, flags)?)?;
        let options = resolve_values(formula, &requests);
        validate(formula, &options)?;
        Ok(options)
    }

    #[test]
    fn parses_positive_negative_and_valued_flags() {
        let f = llvm();
        assert_eq!(
            parse_flag(&f, "--disable-shared").unwrap(),
            ("disable-shared".into(), OptionValue::Bool(true))
        );
        assert_eq!(
            parse_flag(&f, "--without-python").unwrap(),
            ("with-python".into(), OptionValue::Bool(false))
        );
        assert_eq!(
            parse_flag(&f, "--enable-shared").unwrap(),
            ("disable-shared".into(), OptionValue::Bool(false))
        );
        assert_eq!(
            parse_flag(&f, "--targets=all").unwrap(),
            ("targets".into(), OptionValue::Str("all".into()))
        );
        assert_eq!(
            parse_flag(&f, "universal=no").unwrap(),
            ("universal".into(), OptionValue::Bool(false))
        );
    }

    #[test]
    fn unknown_and_mistyped_flags_fail() {
        let f = llvm();
        assert!(matches!(
            parse_flag(&f, "--with-ocaml"),
            Err(KilnError::UnknownOption { .. })
        ));
        assert!(matches!(
            parse_flag(&f, "--disable-shared=maybe"),
            Err(KilnError::InvalidOptionValue { .. })
        ));
        assert!(matches!(
            parse_flag(&f, "--targets"),
            Err(KilnError::InvalidOptionValue { .. })
        ));
    }

    #[test]
    fn invalid_combination_is_rejected() {
        let f = llvm();
        let err = resolve(&f, &flags(&["--disable-shared"])).unwrap_err();
        match err {
            KilnError::InvalidOptionCombination { formula, message } => {
                assert_eq!(formula, "llvm");
                assert_eq!(message, "The Python bindings need the shared library.");
            }
            other => panic!("unexpected error: {other}"),
        }
        let ok = resolve(&f, &flags(&["--disable-shared", "--without-python"])).unwrap();
        assert!(ok.is_enabled("disable-shared"));
        assert!(!ok.is_enabled("with-python"));
    }

    #[test]
    fn conflicting_requesters_are_unsatisfiable() {
        let mut set = RequestSet::new();
        let a = OptionRequest {
            option: "disable-shared".into(),
            value: OptionValue::Bool(true),
            origin: "a".into(),
        };
        assert!(set.merge("llvm", a.clone()).unwrap());
        assert!(!set.merge("llvm", a).unwrap());
        let b = OptionRequest {
            option: "disable-shared".into(),
            value: OptionValue::Bool(false),
            origin: "b".into(),
        };
        match set.merge("llvm", b).unwrap_err() {
            KilnError::UnsatisfiableOptions {
                requester_a,
                requester_b,
                ..
            } => {
                assert_eq!(requester_a, "a");
                assert_eq!(requester_b, "b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn global_flags_only_reach_declaring_formulae() {
        let (local, global) =
            split_global_flags(&flags(&["--universal", "--with-clang"])).unwrap();
        assert_eq!(local, flags(&["--with-clang"]));
        assert_eq!(global, vec![("universal".to_string(), OptionValue::Bool(true))]);
        assert_eq!(global_requests(&llvm(), &global).len(), 1);
        assert!(global_requests(&Formula::new("zlib", "1.3"), &global).is_empty());
    }
}
