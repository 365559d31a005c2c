// The recipes shipped in formulae/ must load, validate and resolve.
use std::path::PathBuf;

use kiln_common::dependency::{DependencyResolver, ResolutionContext};
use kiln_common::error::{KilnError, Result};
use kiln_common::model::option::OptionValue;
use kiln_common::model::procedure::{BuildContext, StepPhase};
use kiln_common::options::split_global_flags;
use kiln_common::pipeline::BuildPlan;
use kiln_common::Formulary;

fn shipped() -> Formulary {
    Formulary::with_dirs(vec![
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../formulae")
    ])
}

fn plan(formulary: &Formulary, target: &str, flags: &[&str]) -> Result<BuildPlan> {
    let flags: Vec<String> = flags.iter().map(|s| s.to_string()).collect();
    let (local, global) = split_global_flags(&flags)?;
    DependencyResolver::new(ResolutionContext {
        formulary,
        include_test: false,
        global_flags: &global,
    })
    .resolve(target, &local)
}

#[test]
fn every_shipped_recipe_loads() {
    let formulary = shipped();
    let names = formulary.available().unwrap();
    for expected in [
        "clang",
        "clang-tools-extra",
        "compiler-rt",
        "libcxx",
        "llvm-svn",
        "python",
        "vim-vspec",
    ] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
    for name in &names {
        formulary
            .load_formula(name)
            .unwrap_or_else(|e| panic!("{name}: {e}"));
    }
}

#[test]
fn default_llvm_plan_pulls_in_python_only() {
    let formulary = shipped();
    let plan = plan(&formulary, "llvm-svn", &[]).unwrap();
    assert_eq!(plan.names(), vec!["python", "llvm-svn"]);
    let root = plan.root().unwrap();
    assert!(root.grafts.is_empty());
    assert_eq!(root.options.get("with-python"), Some(&OptionValue::Bool(true)));
}

#[test]
fn clang_tools_are_grafted_under_clang() {
    let formulary = shipped();
    let plan = plan(
        &formulary,
        "llvm-svn",
        &["--with-clang", "--with-clang-tools-extra", "--without-python", "--universal"],
    )
    .unwrap();
    assert_eq!(plan.names(), vec!["clang", "clang-tools-extra", "llvm-svn"]);

    let root = plan.root().unwrap();
    let grafts: Vec<(&str, &str)> = root
        .grafts
        .iter()
        .map(|g| (g.formula.as_str(), g.path.as_str()))
        .collect();
    assert_eq!(
        grafts,
        vec![
            ("clang", "tools/clang"),
            ("clang-tools-extra", "tools/clang/tools/extra"),
        ]
    );
    assert!(root.options.is_enabled("universal"));
    let env = root.formula.env_overlay(&root.options);
    assert_eq!(env.get("UNIVERSAL").map(String::as_str), Some("1"));
    assert!(!env.contains_key("REQUIRES_RTTI"));
}

#[test]
fn python_bindings_and_static_llvm_do_not_mix() {
    let formulary = shipped();
    let err = plan(&formulary, "llvm-svn", &["--disable-shared"]).unwrap_err();
    match err {
        KilnError::InvalidOptionCombination { message, .. } => {
            assert_eq!(message, "The Python bindings need the shared library.")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(plan(&formulary, "llvm-svn", &["--disable-shared", "--without-python"]).is_ok());

    let err = plan(&formulary, "llvm-svn", &["--with-fortran"]).unwrap_err();
    assert!(matches!(err, KilnError::UnknownOption { .. }));
}

#[test]
fn configure_arguments_follow_the_options() {
    let formulary = shipped();
    let plan = plan(&formulary, "llvm-svn", &["--all-targets", "--with-libcxx"]).unwrap();
    let root = plan.root().unwrap();
    let ctx = BuildContext {
        formula: "llvm-svn".into(),
        buildpath: PathBuf::from("/tmp/kiln/llvm-svn-build"),
        prefix: PathBuf::from("/opt/kiln/lib/llvm-svn-3.5"),
        options: root.options.clone(),
        env: Default::default(),
        vars: Default::default(),
    };
    let invocations = root.formula.install.invocations(&ctx).unwrap();
    let labels: Vec<&str> = invocations.iter().map(|i| i.label.as_str()).collect();
    assert_eq!(labels, vec!["configure", "make", "make-install", "install-libcxx"]);

    let configure = &invocations[0];
    assert_eq!(configure.program, "./configure");
    assert!(configure.args.contains(&"--prefix=/opt/kiln/lib/llvm-svn-3.5".to_string()));
    assert!(configure.args.contains(&"--enable-targets=all".to_string()));
    assert!(!configure.args.contains(&"--enable-targets=host".to_string()));
    assert!(configure.args.contains(&"--enable-libcpp".to_string()));
    assert!(configure.args.contains(&"--enable-shared".to_string()));

    let libcxx = &invocations[3];
    assert_eq!(libcxx.phase, StepPhase::Install);
    assert_eq!(
        libcxx.cwd,
        PathBuf::from("/tmp/kiln/llvm-svn-build/projects/libcxx")
    );
}
