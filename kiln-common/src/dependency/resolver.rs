// kiln-common/src/dependency/resolver.rs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, instrument};

use crate::dependency::{Dependency, DependencyTag};
use crate::error::{KilnError, Result};
use crate::formulary::Formulary;
use crate::model::formula::Formula;
use crate::model::option::{OptionValue, ResolvedOptions};
use crate::model::predicate::holds;
use crate::options::{self, RequestSet, COMMAND_LINE};
use crate::pipeline::{BuildPlan, Graft, PlanEntry};

// --- ResolutionContext ---
pub struct ResolutionContext<'a> {
    pub formulary: &'a Formulary,
    /// Pull in `test` dependencies of the requested formula.
    pub include_test: bool,
    /// Build-wide flags, applied to every formula that declares the option.
    pub global_flags: &'a [(String, OptionValue)],
}

#[derive(Debug, Clone)]
struct ResolvedNode {
    formula: Arc<Formula>,
    requests: RequestSet,
    options: ResolvedOptions,
    is_root: bool,
}

pub struct DependencyResolver<'a> {
    context: ResolutionContext<'a>,
    /// Current recursion stack, in order, for cycle reporting.
    visiting: Vec<String>,
    nodes: HashMap<String, ResolvedNode>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(context: ResolutionContext<'a>) -> Self {
        Self {
            context,
            visiting: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    /// Resolve `target` with the user's `flags` into a dependency-ordered plan.
    /// Every error is raised before anything is built.
    #[instrument(skip(self))]
    pub fn resolve(&mut self, target: &str, flags: &[String]) -> Result<BuildPlan> {
        debug!("Starting dependency resolution for '{}' with {:?}", target, flags);
        self.visiting.clear();
        self.nodes.clear();

        let root = self.context.formulary.load_formula(target)?;
        let root_requests = options::parse_flags(&root, COMMAND_LINE, flags)?;
        self.resolve_recursive(target, root_requests, true)?;

        let plan = self.build_plan(target)?;
        for entry in &plan.entries {
            options::validate(&entry.formula, &entry.options)?;
        }
        debug!("Final build plan: {:?}", plan.names());
        Ok(plan)
    }

    fn resolve_recursive(
        &mut self,
        name: &str,
        incoming: Vec<options::OptionRequest>,
        is_root: bool,
    ) -> Result<()> {
        debug!("Resolving: {} (requests: {:?}, is_target: {})", name, incoming, is_root);

        // -------- cycle guard -------------------------------------------------------------
        if let Some(start) = self.visiting.iter().position(|n| n == name) {
            let mut cycle: Vec<String> = self.visiting[start..].to_vec();
            cycle.push(name.to_string());
            error!("Dependency cycle detected: {}", cycle.join(" -> "));
            return Err(KilnError::CyclicDependency(cycle));
        }

        // -------- revisit: merge new requests, stop if nothing changed -------------------
        if let Some(existing) = self.nodes.get_mut(name) {
            let changed = existing.requests.merge_all(name, incoming)?;
            if !changed {
                debug!("'{}' already resolved with compatible requests.", name);
                return Ok(());
            }
            existing.options = options::resolve_values(&existing.formula, &existing.requests);
            debug!(
                "Re-evaluating dependencies for '{}' with options [{}]",
                name, existing.options
            );
        }
        // -------- first time we see this node ---------------------------------------------
        else {
            let formula = self.context.formulary.load_formula(name)?;
            let mut requests = RequestSet::new();
            requests.merge_all(
                name,
                options::global_requests(&formula, self.context.global_flags),
            )?;
            requests.merge_all(name, incoming)?;
            let options = options::resolve_values(&formula, &requests);
            debug!("Initial options for '{}': [{}]", name, options);
            self.nodes.insert(
                name.to_string(),
                ResolvedNode {
                    formula,
                    requests,
                    options,
                    is_root,
                },
            );
        }

        // --------------------------------------------------------------------- recurse ----
        let Some(snapshot) = self.nodes.get(name).cloned() else {
            return Err(KilnError::Generic(format!("resolver lost node '{name}'")));
        };

        self.visiting.push(name.to_string());
        for dep in self.active_edges(&snapshot) {
            debug!(
                "RESOLVER: Evaluating edge: parent='{}', child='{}' ({})",
                name, dep.name, dep.strength
            );
            let child = self.context.formulary.load_formula(&dep.name)?;
            let threaded = options::parse_flags(&child, name, &dep.flags)?;
            if let Err(e) = self.resolve_recursive(&dep.name, threaded, false) {
                self.visiting.pop();
                return Err(e);
            }
        }
        self.visiting.pop();
        debug!("Finished resolving '{}'", name);
        Ok(())
    }

    /// Dependencies of a node that take part in the build under its current options.
    fn active_edges(&self, node: &ResolvedNode) -> Vec<Dependency> {
        node.formula
            .dependencies()
            .iter()
            .filter(|dep| self.should_process_dependency_edge(node, dep))
            .cloned()
            .collect()
    }

    fn should_process_dependency_edge(&self, node: &ResolvedNode, dep: &Dependency) -> bool {
        let tags = dep.tags();
        if tags.contains(DependencyTag::TEST) && !(self.context.include_test && node.is_root) {
            debug!("Edge to '{}' skipped: test dependencies excluded.", dep.name);
            return false;
        }
        if !holds(dep.when.as_ref(), &node.options) {
            debug!("Edge to '{}' skipped: guard '{:?}' does not hold.", dep.name, dep.when);
            return false;
        }
        if let Some(switch) = dep.switch_option() {
            if !node.options.is_enabled(&switch) {
                debug!("Edge to '{}' skipped: '{}' is off.", dep.name, switch);
                return false;
            }
        }
        true
    }

    /// Depth-first post-order from the root over active edges, in declaration order.
    ///
    /// Edges are taken from the final option sets, so a cycle closed by an
    /// option that was switched on late is caught here rather than during
    /// the descent.
    fn build_plan(&self, root: &str) -> Result<BuildPlan> {
        let mut plan = BuildPlan::default();
        let mut placed = HashSet::new();
        let mut in_progress = Vec::new();
        self.place(root, &mut placed, &mut in_progress, &mut plan)?;
        Ok(plan)
    }

    fn place(
        &self,
        name: &str,
        placed: &mut HashSet<String>,
        in_progress: &mut Vec<String>,
        plan: &mut BuildPlan,
    ) -> Result<()> {
        if let Some(start) = in_progress.iter().position(|n| n == name) {
            let mut cycle: Vec<String> = in_progress[start..].to_vec();
            cycle.push(name.to_string());
            error!("Dependency cycle detected: {}", cycle.join(" -> "));
            return Err(KilnError::CyclicDependency(cycle));
        }
        if placed.contains(name) {
            return Ok(());
        }
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| KilnError::Generic(format!("'{name}' was never resolved")))?;
        let edges = self.active_edges(node);
        in_progress.push(name.to_string());
        for dep in &edges {
            self.place(&dep.name, placed, in_progress, plan)?;
        }
        in_progress.pop();
        placed.insert(name.to_string());
        plan.entries.push(PlanEntry {
            formula: Arc::clone(&node.formula),
            options: node.options.clone(),
            dependencies: edges.iter().map(|d| d.name.clone()).collect(),
            grafts: edges
                .iter()
                .filter_map(|d| {
                    d.graft.as_ref().map(|path| Graft {
                        formula: d.name.clone(),
                        path: path.clone(),
                    })
                })
                .collect(),
            requested: node.is_root,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::Strength;
    use crate::model::option::FormulaOption;
    use crate::model::predicate::Predicate;
    use crate::model::formula::Constraint;

    fn formula(name: &str, deps: Vec<Dependency>) -> Formula {
        let mut f = Formula::new(name, "1.0");
        f.dependencies = deps;
        f
    }

    fn resolve(formulary: &Formulary, target: &str, flags: &[&str]) -> Result<BuildPlan> {
        let flags: Vec<String> = flags.iter().map(|s| s.to_string()).collect();
        let mut resolver = DependencyResolver::new(ResolutionContext {
            formulary,
            include_test: false,
            global_flags: &[],
        });
        resolver.resolve(target, &flags)
    }

    #[test]
    fn dependencies_precede_dependents() {
        let formulary = Formulary::from_formulas([
            formula("app", vec![Dependency::new_runtime("libb"), Dependency::new_runtime("liba")]),
            formula("libb", vec![Dependency::new_runtime("liba")]),
            formula("liba", vec![]),
        ])
        .unwrap();
        let plan = resolve(&formulary, "app", &[]).unwrap();
        assert_eq!(plan.names(), vec!["liba", "libb", "app"]);
        for entry in &plan.entries {
            let idx = plan.position(entry.name()).unwrap();
            for dep in &entry.dependencies {
                assert!(plan.position(dep).unwrap() < idx);
            }
        }
        assert!(plan.root().is_some_and(|r| r.name() == "app"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let formulary = Formulary::from_formulas([
            formula(
                "app",
                vec![
                    Dependency::new_runtime("c"),
                    Dependency::new_runtime("a"),
                    Dependency::new_runtime("b"),
                ],
            ),
            formula("a", vec![Dependency::new_runtime("c")]),
            formula("b", vec![]),
            formula("c", vec![]),
        ])
        .unwrap();
        let first = resolve(&formulary, "app", &[]).unwrap();
        let second = resolve(&formulary, "app", &[]).unwrap();
        assert_eq!(first.names(), second.names());
        let opts: Vec<_> = first.entries.iter().map(|e| e.options.clone()).collect();
        let opts2: Vec<_> = second.entries.iter().map(|e| e.options.clone()).collect();
        assert_eq!(opts, opts2);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let formulary = Formulary::from_formulas([
            formula("a", vec![Dependency::new_runtime("b")]),
            formula("b", vec![Dependency::new_runtime("a")]),
        ])
        .unwrap();
        match resolve(&formulary, "a", &[]).unwrap_err() {
            KilnError::CyclicDependency(path) => assert_eq!(path, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycle_closed_by_a_late_option_is_reported() {
        // `b` only points back at `d` once `c` asks for `--x`, after `b` was
        // already resolved through `d`.
        let mut b = formula(
            "b",
            vec![Dependency::new_runtime("d").guarded(Predicate::parse("x").unwrap())],
        );
        b.options = vec![FormulaOption::switch("x", "", false)];
        let formulary = Formulary::from_formulas([
            formula(
                "r",
                vec![Dependency::new_runtime("d"), Dependency::new_runtime("c")],
            ),
            formula("d", vec![Dependency::new_runtime("b")]),
            formula("c", vec![Dependency::new_runtime("b").with_flags(&["--x"])]),
            b,
        ])
        .unwrap();
        match resolve(&formulary, "r", &[]).unwrap_err() {
            KilnError::CyclicDependency(path) => assert_eq!(path, vec!["d", "b", "d"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn grafted_sub_formula_comes_first() {
        let mut root = formula(
            "root",
            vec![Dependency::new_with_strength("sub", Strength::Build)
                .grafted_at("tools/sub")
                .guarded(Predicate::parse("with-sub").unwrap())],
        );
        root.options = vec![FormulaOption::switch("with-sub", "", false)];
        let formulary = Formulary::from_formulas([root, formula("sub", vec![])]).unwrap();

        let without = resolve(&formulary, "root", &[]).unwrap();
        assert_eq!(without.names(), vec!["root"]);

        let with = resolve(&formulary, "root", &["--with-sub"]).unwrap();
        assert_eq!(with.names(), vec!["sub", "root"]);
        let entry = with.entry("root").unwrap();
        assert_eq!(
            entry.grafts,
            vec![Graft {
                formula: "sub".into(),
                path: "tools/sub".into()
            }]
        );
    }

    #[test]
    fn implicit_switches_gate_recommended_and_optional() {
        let formulary = Formulary::from_formulas([
            formula(
                "llvm",
                vec![
                    Dependency::new_with_strength("python", Strength::Recommended),
                    Dependency::new_with_strength("ocaml", Strength::Optional),
                ],
            ),
            formula("python", vec![]),
            formula("ocaml", vec![]),
        ])
        .unwrap();
        assert_eq!(resolve(&formulary, "llvm", &[]).unwrap().names(), vec!["python", "llvm"]);
        assert_eq!(
            resolve(&formulary, "llvm", &["--without-python", "--with-ocaml"])
                .unwrap()
                .names(),
            vec!["ocaml", "llvm"]
        );
    }

    #[test]
    fn conflicting_threaded_flags_are_unsatisfiable() {
        let mut llvm = formula("llvm", vec![]);
        llvm.options = vec![FormulaOption::switch("disable-shared", "", false)];
        let formulary = Formulary::from_formulas([
            formula(
                "app",
                vec![
                    Dependency::new_runtime("static-tool").with_flags(&[]),
                    Dependency::new_runtime("shared-tool"),
                ],
            ),
            formula(
                "static-tool",
                vec![Dependency::new_runtime("llvm").with_flags(&["--disable-shared"])],
            ),
            formula(
                "shared-tool",
                vec![Dependency::new_runtime("llvm").with_flags(&["--disable-shared=false"])],
            ),
            llvm,
        ])
        .unwrap();
        match resolve(&formulary, "app", &[]).unwrap_err() {
            KilnError::UnsatisfiableOptions {
                formula,
                option,
                requester_a,
                requester_b,
                ..
            } => {
                assert_eq!(formula, "llvm");
                assert_eq!(option, "disable-shared");
                assert_eq!(requester_a, "static-tool");
                assert_eq!(requester_b, "shared-tool");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn revisited_node_picks_up_new_requests() {
        let mut llvm = formula(
            "llvm",
            vec![Dependency::new_runtime("clang").guarded(Predicate::parse("with-clang").unwrap())],
        );
        llvm.options = vec![FormulaOption::switch("with-clang", "", false)];
        let formulary = Formulary::from_formulas([
            formula(
                "app",
                vec![Dependency::new_runtime("llvm"), Dependency::new_runtime("tool")],
            ),
            formula(
                "tool",
                vec![Dependency::new_runtime("llvm").with_flags(&["--with-clang"])],
            ),
            llvm,
            formula("clang", vec![]),
        ])
        .unwrap();
        let plan = resolve(&formulary, "app", &[]).unwrap();
        assert_eq!(plan.names(), vec!["clang", "llvm", "tool", "app"]);
        assert!(plan.entry("llvm").unwrap().options.is_enabled("with-clang"));
    }

    #[test]
    fn invalid_combination_and_unknown_flags_fail_resolution() {
        let mut llvm = formula("llvm", vec![]);
        llvm.options = vec![
            FormulaOption::switch("with-python", "", true),
            FormulaOption::switch("disable-shared", "", false),
        ];
        llvm.constraints = vec![Constraint {
            when: Predicate::parse("with-python & disable-shared").unwrap(),
            message: "The Python bindings need the shared library.".into(),
        }];
        let formulary = Formulary::from_formulas([llvm]).unwrap();
        assert!(matches!(
            resolve(&formulary, "llvm", &["--disable-shared"]),
            Err(KilnError::InvalidOptionCombination { .. })
        ));
        assert!(matches!(
            resolve(&formulary, "llvm", &["--with-ocaml"]),
            Err(KilnError::UnknownOption { .. })
        ));
        assert!(matches!(
            resolve(&formulary, "missing", &[]),
            Err(KilnError::FormulaNotFound(_))
        ));
    }

    #[test]
    fn global_flags_apply_to_declaring_formulae_only() {
        let mut llvm = formula("llvm", vec![]);
        llvm.options = vec![FormulaOption::switch("universal", "", false)];
        let formulary = Formulary::from_formulas([
            formula("app", vec![Dependency::new_runtime("llvm")]),
            llvm,
        ])
        .unwrap();
        let globals = vec![("universal".to_string(), OptionValue::Bool(true))];
        let mut resolver = DependencyResolver::new(ResolutionContext {
            formulary: &formulary,
            include_test: false,
            global_flags: &globals,
        });
        let plan = resolver.resolve("app", &[]).unwrap();
        assert!(plan.entry("llvm").unwrap().options.is_enabled("universal"));
        assert!(plan.entry("app").unwrap().options.get("universal").is_none());
    }

    #[test]
    fn test_dependencies_only_when_requested() {
        let formulary = Formulary::from_formulas([
            formula(
                "vim-vspec",
                vec![Dependency::new_with_strength("vim", Strength::Test)],
            ),
            formula("vim", vec![]),
        ])
        .unwrap();
        assert_eq!(resolve(&formulary, "vim-vspec", &[]).unwrap().names(), vec!["vim-vspec"]);
        let mut resolver = DependencyResolver::new(ResolutionContext {
            formulary: &formulary,
            include_test: true,
            global_flags: &[],
        });
        assert_eq!(
            resolver.resolve("vim-vspec", &[]).unwrap().names(),
            vec!["vim", "vim-vspec"]
        );
    }
}
