// End-to-end runs of the build executor against real shell steps in a
// temporary kiln root.
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kiln_common::dependency::{DependencyResolver, ResolutionContext};
use kiln_common::error::{KilnError, Result};
use kiln_common::model::procedure::Invocation;
use kiln_common::pipeline::{BuildPlan, EntryState, PipelineEvent};
use kiln_common::{Config, Formula, Formulary};
use kiln_core::{
    BuildExecutor, ExecutionReport, LinkRepository, ProcessRunner, StepOutcome, StepRunner,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Delegates to the real process runner and remembers every invocation.
#[derive(Default)]
struct RecordingRunner {
    inner: ProcessRunner,
    seen: Mutex<Vec<Invocation>>,
}

impl RecordingRunner {
    fn labels(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.label.clone())
            .collect()
    }
}

#[async_trait]
impl StepRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation, cancel: &CancellationToken) -> Result<StepOutcome> {
        self.seen.lock().unwrap().push(invocation.clone());
        self.inner.run(invocation, cancel).await
    }
}

struct Harness {
    _root: TempDir,
    config: Config,
    runner: Arc<RecordingRunner>,
    linker: Arc<LinkRepository>,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(root.path());
        config.make_jobs = 2;
        let linker = Arc::new(LinkRepository::new(&config));
        Self {
            _root: root,
            config,
            runner: Arc::new(RecordingRunner::default()),
            linker,
        }
    }

    fn plan(&self, formulary: &Formulary, target: &str, flags: &[&str]) -> Result<BuildPlan> {
        let flags: Vec<String> = flags.iter().map(|s| s.to_string()).collect();
        DependencyResolver::new(ResolutionContext {
            formulary,
            include_test: false,
            global_flags: &[],
        })
        .resolve(target, &flags)
    }

    fn executor(&self) -> BuildExecutor {
        BuildExecutor::new(&self.config, self.runner.clone(), self.linker.clone())
    }

    async fn install(
        &self,
        formulary: &Formulary,
        target: &str,
        flags: &[&str],
    ) -> Result<ExecutionReport> {
        let plan = self.plan(formulary, target, flags)?;
        Ok(self.executor().execute(&plan).await)
    }
}

fn formulary(recipes: &[(&str, &str)]) -> Formulary {
    Formulary::from_formulas(
        recipes
            .iter()
            .map(|(name, src)| Formula::from_toml_str(name, src).unwrap()),
    )
    .unwrap()
}

fn tool_recipe(step_name: &str, tool: &str) -> String {
    format!(
        r##"
version = "3.4"
install = [
  {{ name = "{step_name}", run = ["sh", "-c", 'mkdir -p {{prefix}}/bin && printf "#!/bin/sh\necho {tool} version 3.4\n" > {{prefix}}/bin/{tool} && chmod +x {{prefix}}/bin/{tool}'] }},
]
"##
    )
}

const SUB: &str = r#"
version = "1.0"
install = [
  { name = "build-sub", run = ["sh", "-c", "mkdir -p {prefix}/lib && echo grafted > {prefix}/lib/sub.txt"] },
]
"#;

const ROOT: &str = r#"
version = "1.0"
dependencies = [{ name = "sub", strength = "optional", graft = "tools/sub" }]
install = [
  { name = "check-graft", run = ["test", "-f", "tools/sub/lib/sub.txt"] },
  { name = "install-root", phase = "install", run = ["sh", "-c", "mkdir -p {prefix}/bin && cp tools/sub/lib/sub.txt {prefix}/bin/root-tool"] },
]
"#;

#[tokio::test]
async fn grafted_sub_formula_is_in_the_workspace_before_install() {
    let h = Harness::new();
    let formulary = formulary(&[("sub", SUB), ("root", ROOT)]);

    let plan = h.plan(&formulary, "root", &["--with-sub"]).unwrap();
    assert_eq!(plan.names(), vec!["sub", "root"]);

    let report = h.executor().execute(&plan).await;
    assert!(report.is_success(), "{:?}", report.states);
    assert_eq!(h.runner.labels(), vec!["build-sub", "check-graft", "install-root"]);

    let root_prefix = &report.prefixes["root"];
    assert_eq!(
        fs::read_to_string(root_prefix.join("bin/root-tool")).unwrap(),
        "grafted\n"
    );
    assert!(root_prefix.join("INSTALL_RECEIPT.json").is_file());
    assert!(h.config.bin_dir().join("root-tool-1.0").symlink_metadata().is_ok());
    // Workspaces are cleaned up.
    assert_eq!(fs::read_dir(h.config.tmp_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn invalid_option_combination_runs_nothing() {
    let h = Harness::new();
    let llvm = r#"
version = "3.4"
options = [{ name = "disable-shared" }]
dependencies = [{ name = "python", strength = "recommended" }]
constraints = [{ when = "with-python & disable-shared", message = "The Python bindings need the shared library." }]
install = [{ run = ["true"] }]
"#;
    let python = r#"
version = "2.7"
install = [{ run = ["true"] }]
"#;
    let formulary = formulary(&[("llvm", llvm), ("python", python)]);

    let err = h
        .install(&formulary, "llvm", &["--disable-shared"])
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::InvalidOptionCombination { .. }));
    assert!(h.runner.labels().is_empty());

    // Dropping the bindings makes the same combination valid.
    let report = h
        .install(&formulary, "llvm", &["--disable-shared", "--without-python"])
        .await
        .unwrap();
    assert!(report.is_success());
}

#[tokio::test]
async fn cyclic_recipes_never_build() {
    let h = Harness::new();
    let a = "version = \"1\"\ndependencies = [{ name = \"b\" }]\ninstall = [{ run = [\"true\"] }]";
    let b = "version = \"1\"\ndependencies = [{ name = \"a\" }]\ninstall = [{ run = [\"true\"] }]";
    let formulary = formulary(&[("a", a), ("b", b)]);
    let err = h.install(&formulary, "a", &[]).await.unwrap_err();
    assert!(matches!(err, KilnError::CyclicDependency(_)));
    assert!(h.runner.labels().is_empty());
}

#[tokio::test]
async fn cycle_switched_on_by_a_later_requester_never_builds() {
    let h = Harness::new();
    let r = r#"
version = "1"
dependencies = [{ name = "d" }, { name = "c" }]
install = [{ name = "build-r", run = ["true"] }]
"#;
    let d = r#"
version = "1"
dependencies = [{ name = "b" }]
install = [{ name = "build-d", run = ["true"] }]
"#;
    let c = r#"
version = "1"
dependencies = [{ name = "b", flags = ["--x"] }]
install = [{ name = "build-c", run = ["true"] }]
"#;
    let b = r#"
version = "1"
options = [{ name = "x" }]
dependencies = [{ name = "d", when = "x" }]
install = [{ name = "build-b", run = ["true"] }]
"#;
    let formulary = formulary(&[("r", r), ("d", d), ("c", c), ("b", b)]);
    let err = h.install(&formulary, "r", &[]).await.unwrap_err();
    assert!(matches!(err, KilnError::CyclicDependency(_)));
    assert!(h.runner.labels().is_empty());
}

#[tokio::test]
async fn failure_reaches_indirect_dependents_without_running_them() {
    let h = Harness::new();
    let base = r#"
version = "1"
install = [{ name = "build-base", run = ["false"] }]
"#;
    let mid = r#"
version = "1"
dependencies = [{ name = "base" }]
install = [{ name = "build-mid", run = ["true"] }]
"#;
    let top = r#"
version = "1"
dependencies = [{ name = "mid" }]
install = [{ name = "build-top", run = ["true"] }]
"#;
    let formulary = formulary(&[("base", base), ("mid", mid), ("top", top)]);
    let report = h.install(&formulary, "top", &[]).await.unwrap();

    assert_eq!(h.runner.labels(), vec!["build-base"]);
    assert_eq!(report.fail_count(), 3);
    for (name, dependency) in [("mid", "base"), ("top", "mid")] {
        match report.state(name) {
            Some(EntryState::Failed(e)) => match e.as_ref() {
                KilnError::DependencyFailed { dependency: d, .. } => assert_eq!(d, dependency),
                other => panic!("{name}: unexpected error: {other}"),
            },
            other => panic!("{name}: unexpected state: {other:?}"),
        }
    }
    assert!(matches!(
        report.root_cause().map(|e| e.as_ref()),
        Some(KilnError::ExternalStepFailed { .. })
    ));
}

#[tokio::test]
async fn failed_step_fails_dependents_and_keeps_earlier_entries() {
    let h = Harness::new();
    let base = tool_recipe("build-base", "base");
    let broken = r#"
version = "1.0"
dependencies = [{ name = "base" }]
install = [
  { name = "configure-broken", run = ["sh", "-c", "mkdir -p {prefix}/bin && echo partial > {prefix}/bin/partial"] },
  { name = "make-broken", run = ["sh", "-c", "echo compile error >&2; exit 3"] },
  { name = "never-runs", run = ["true"] },
]
"#;
    let app = r#"
version = "1.0"
dependencies = [{ name = "broken" }]
install = [{ name = "build-app", run = ["true"] }]
"#;
    let formulary = formulary(&[("base", base.as_str()), ("broken", broken), ("app", app)]);

    let report = h.install(&formulary, "app", &[]).await.unwrap();
    assert!(matches!(report.state("base"), Some(EntryState::Linked)));
    match report.state("broken") {
        Some(EntryState::Failed(e)) => match e.as_ref() {
            KilnError::ExternalStepFailed {
                step,
                exit_code,
                output,
                ..
            } => {
                assert_eq!(step, "make-broken");
                assert_eq!(*exit_code, Some(3));
                assert!(output.contains("compile error"));
            }
            other => panic!("unexpected error: {other}"),
        },
        other => panic!("unexpected state: {other:?}"),
    }
    assert!(matches!(
        report.state("app"),
        Some(EntryState::Failed(e)) if matches!(e.as_ref(), KilnError::DependencyFailed { dependency, .. } if dependency == "broken")
    ));
    assert_eq!(
        h.runner.labels(),
        vec!["build-base", "configure-broken", "make-broken"]
    );

    // Nothing from the failed build was promoted.
    assert!(!h.config.formula_prefix("broken", "1.0", None).exists());
    assert!(h.config.bin_dir().join("partial-1.0").symlink_metadata().is_err());
    // The earlier entry stays installed and its link survives.
    assert!(h.config.bin_dir().join("base-3.4").symlink_metadata().is_ok());
    assert!(h
        .config
        .formula_logs_dir("broken")
        .join("02.make-broken.log")
        .is_file());
    assert!(matches!(
        report.root_cause().map(|e| e.as_ref()),
        Some(KilnError::ExternalStepFailed { .. })
    ));
}

#[tokio::test]
async fn version_suffixes_coexist_and_equal_suffixes_conflict() {
    let h = Harness::new();
    let clang34 = tool_recipe("build-clang", "clang");
    let clang35 = tool_recipe("build-clang-35", "clang").replace("\"3.4\"", "\"3.5\"");
    let svn = tool_recipe("build-svn", "clang");
    let formulary = formulary(&[
        ("clang", clang34.as_str()),
        ("clang-next", clang35.as_str()),
        ("llvm-svn", svn.as_str()),
    ]);

    assert!(h.install(&formulary, "clang", &[]).await.unwrap().is_success());
    assert!(h
        .install(&formulary, "clang-next", &[])
        .await
        .unwrap()
        .is_success());
    let first = h.config.formula_prefix("clang", "3.4", None);
    assert_eq!(
        fs::read_link(h.config.bin_dir().join("clang-3.4")).unwrap(),
        first.join("bin/clang")
    );
    assert!(h.config.bin_dir().join("clang-3.5").symlink_metadata().is_ok());

    let report = h.install(&formulary, "llvm-svn", &[]).await.unwrap();
    assert!(matches!(
        report.state("llvm-svn"),
        Some(EntryState::Failed(e)) if matches!(e.as_ref(), KilnError::LinkConflict { .. })
    ));
    assert_eq!(
        fs::read_link(h.config.bin_dir().join("clang-3.4")).unwrap(),
        first.join("bin/clang")
    );
    assert_eq!(h.linker.registry().load().unwrap().len(), 2);
}

#[tokio::test]
async fn probe_suffix_comes_from_the_built_tool() {
    let h = Harness::new();
    let recipe = r#"
version = "HEAD"
install = [
  { name = "install-tool", run = ["sh", "-c", "mkdir -p {prefix}/bin && printf '#!/bin/sh\necho tool version 2.5.1\n' > {prefix}/bin/tool && chmod +x {prefix}/bin/tool"] },
]
[link]
suffix = { probe = ["{prefix}/bin/tool", "--version"] }
"#;
    let formulary = formulary(&[("tool", recipe)]);
    let report = h.install(&formulary, "tool", &[]).await.unwrap();
    assert!(report.is_success(), "{:?}", report.states);
    assert!(h.config.bin_dir().join("tool-2.5").symlink_metadata().is_ok());
    assert_eq!(h.runner.labels(), vec!["install-tool", "version-probe"]);
}

#[tokio::test]
async fn recorded_installations_are_not_rebuilt() {
    let h = Harness::new();
    let recipe = tool_recipe("build-llc", "llc");
    let formulary = formulary(&[("llc", recipe.as_str())]);
    assert!(h.install(&formulary, "llc", &[]).await.unwrap().is_success());
    assert_eq!(h.runner.labels().len(), 1);

    let (tx, mut rx) = tokio::sync::broadcast::channel(64);
    let plan = h.plan(&formulary, "llc", &[]).unwrap();
    let report = h.executor().with_events(tx).execute(&plan).await;
    assert!(report.is_success());
    assert_eq!(h.runner.labels().len(), 1);

    let mut saw_already_installed = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, PipelineEvent::AlreadyInstalled { .. }) {
            saw_already_installed = true;
        }
    }
    assert!(saw_already_installed);
}

#[tokio::test]
async fn cancellation_stops_the_running_step_and_pending_entries() {
    let h = Harness::new();
    let slow = r#"
version = "1.0"
install = [{ name = "slow-make", run = ["sleep", "30"] }]
"#;
    let after = r#"
version = "1.0"
dependencies = [{ name = "slow" }]
install = [{ name = "after-make", run = ["true"] }]
"#;
    let formulary = formulary(&[("slow", slow), ("after", after)]);
    let plan = h.plan(&formulary, "after", &[]).unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let report = tokio::time::timeout(
        Duration::from_secs(20),
        h.executor().with_cancellation(token).execute(&plan),
    )
    .await
    .expect("cancelled pipeline should finish promptly");

    for name in ["slow", "after"] {
        assert!(
            matches!(
                report.state(name),
                Some(EntryState::Failed(e)) if matches!(e.as_ref(), KilnError::Cancelled { .. })
            ),
            "{name}: {:?}",
            report.state(name)
        );
    }
    assert_eq!(h.runner.labels(), vec!["slow-make"]);
    assert!(!h.config.formula_prefix("slow", "1.0", None).exists());
}

#[tokio::test]
async fn source_less_sub_formula_stages_its_tree() {
    let h = Harness::new();
    let src = tempfile::tempdir().unwrap();
    fs::create_dir_all(src.path().join("autoload")).unwrap();
    fs::write(src.path().join("autoload/vspec.vim"), "\" vspec").unwrap();
    let recipe = format!(
        "version = \"1.1\"\nkeg_only = true\nsource = {{ path = \"{}\" }}\n",
        src.path().display()
    );
    let formulary = formulary(&[("vim-vspec", recipe.as_str())]);
    let report = h.install(&formulary, "vim-vspec", &[]).await.unwrap();
    assert!(report.is_success(), "{:?}", report.states);
    assert!(report.prefixes["vim-vspec"].join("autoload/vspec.vim").is_file());
    assert!(h.runner.labels().is_empty());
    assert!(h.linker.registry().load().unwrap()[0].entries.is_empty());
}
