//! Orchestration tests over fake providers and builders.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serial_test::serial;
use tempfile::TempDir;
use tracing_test::traced_test;

use polyversion_lib::builder::{BuildError, Builder, CommandBuilder};
use polyversion_lib::codec::{Codec, Value};
use polyversion_lib::driver::{
  DataFactory, DataRequest, DriverError, MANIFEST_FILE, MockData, Namer, RootDataFactory, Selectable, TaskError,
  name_selector,
};
use polyversion_lib::environment::{
  CommandOutput, EnvState, Environment, EnvironmentFactory, ExecContext, PlainEnvironment,
};
use polyversion_lib::{Driver, Revision, RunReport};

use crate::common::*;

fn three_revisions() -> Vec<Revision> {
  vec![branch("main", 30), branch("dev", 20), tag("v1.0", 10)]
}

fn manifest_names(output: &Path) -> Vec<String> {
  let text = std::fs::read_to_string(output.join(MANIFEST_FILE)).unwrap();
  let decoded = Codec::global().decode(&text).unwrap();
  let revisions: Vec<Revision> = decoded
    .as_seq()
    .unwrap()
    .iter()
    .map(|v| v.downcast_ref::<Revision>().unwrap().clone())
    .collect();
  names(&revisions)
}

fn read(path: impl AsRef<Path>) -> String {
  std::fs::read_to_string(path).unwrap()
}

// =============================================================================
// Fan-out / fan-in
// =============================================================================

#[tokio::test]
async fn builds_every_revision_into_its_own_directory() {
  let temp = TempDir::new().unwrap();
  let driver = fake_driver(
    &temp,
    FakeProvider::new(three_revisions()),
    Arc::new(FakeBuilder::default()),
  );

  let report = driver.run().await.unwrap();

  assert!(report.is_success());
  assert_eq!(names(&report.builds), vec!["dev", "main", "v1.0"]);
  assert_eq!(names(&report.targets), vec!["dev", "main", "v1.0"]);

  let out = temp.path().join("out");
  assert_eq!(subdirs(&out), vec!["dev", "main", "v1.0"]);
  assert_eq!(manifest_names(&out), vec!["dev", "main", "v1.0"]);
  assert_eq!(read(out.join("main/index.html")), "main|main");
  assert_eq!(read(out.join("v1.0/index.html")), "v1.0|v1.0");
}

#[tokio::test]
async fn failed_build_is_left_out_of_the_merge() {
  let temp = TempDir::new().unwrap();
  let driver = fake_driver(
    &temp,
    FakeProvider::new(three_revisions()),
    Arc::new(FakeBuilder::failing(&["dev"])),
  );

  let report = driver.run().await.unwrap();

  assert!(!report.is_success());
  assert_eq!(report.failed_names(), vec!["dev"]);
  assert!(matches!(
    report.failures[0].error,
    TaskError::Build(BuildError::CommandFailed { .. })
  ));

  let out = temp.path().join("out");
  assert_eq!(subdirs(&out), vec!["main", "v1.0"]);
  assert_eq!(manifest_names(&out), vec!["main", "v1.0"]);
}

#[tokio::test]
async fn failures_do_not_cancel_other_builds() {
  let revisions: Vec<Revision> = (0..10).map(|i| branch(&format!("b{i}"), i)).collect();
  let temp = TempDir::new().unwrap();
  let provider = FakeProvider::new(revisions).with_broken(&["b1", "b4"]);
  let builder = FakeBuilder::failing(&["b7"]).with_delay(Duration::from_millis(5));
  let driver = fake_driver(&temp, provider, Arc::new(builder));

  let report = driver.run().await.unwrap();

  assert_eq!(report.builds.len(), 7);
  assert_eq!(report.failures.len(), 3);
  let failed = sorted(report.failed_names().iter().map(|s| s.to_string()).collect());
  assert_eq!(failed, vec!["b1", "b4", "b7"]);
  for failure in &report.failures {
    match failure.revision.name.as_str() {
      "b7" => assert!(matches!(failure.error, TaskError::Build(_))),
      _ => assert!(matches!(failure.error, TaskError::Materialize(_))),
    }
  }

  let built = manifest_names(&temp.path().join("out"));
  assert_eq!(built.len(), 7);
  assert!(!built.iter().any(|n| ["b1", "b4", "b7"].contains(&n.as_str())));
}

#[tokio::test]
async fn every_successful_build_is_recorded_once() {
  for count in [1_i64, 2, 16] {
    let revisions: Vec<Revision> = (0..count).map(|i| tag(&format!("v{i}"), i)).collect();
    let expected = names(&revisions);
    let temp = TempDir::new().unwrap();
    let builder = FakeBuilder::default().with_delay(Duration::from_millis(2));
    let driver = fake_driver(&temp, FakeProvider::new(revisions), Arc::new(builder));

    let report = driver.run().await.unwrap();

    let unique: HashSet<&str> = report.build_names().into_iter().collect();
    assert_eq!(report.builds.len(), count as usize);
    assert_eq!(unique.len(), count as usize);
    assert_eq!(manifest_names(&temp.path().join("out")), expected);
  }
}

#[tokio::test]
#[traced_test]
async fn failed_revision_is_logged_once() {
  let temp = TempDir::new().unwrap();
  let driver = fake_driver(
    &temp,
    FakeProvider::new(three_revisions()),
    Arc::new(FakeBuilder::failing(&["dev"])),
  );

  driver.run().await.unwrap();

  assert!(logs_contain("build failed"));
  logs_assert(|lines: &[&str]| {
    let failed: Vec<&&str> = lines
      .iter()
      .filter(|line| line.contains("build failed"))
      .collect();
    match failed.as_slice() {
      [line] if line.contains("revision=dev") && line.contains("ERROR") => Ok(()),
      other => Err(format!("expected one failure line for dev, got {other:?}")),
    }
  });
}

#[tokio::test]
async fn panicking_builder_is_contained() {
  let temp = TempDir::new().unwrap();
  let mut builder = FakeBuilder::default();
  builder.panicking.insert("dev".to_string());
  let driver = fake_driver(&temp, FakeProvider::new(three_revisions()), Arc::new(builder));

  let report = driver.run().await.unwrap();

  assert_eq!(report.failed_names(), vec!["dev"]);
  match &report.failures[0].error {
    TaskError::Panicked(message) => assert!(message.contains("builder exploded for dev")),
    other => panic!("unexpected error: {other}"),
  }
  assert_eq!(manifest_names(&temp.path().join("out")), vec!["main", "v1.0"]);
}

#[tokio::test]
async fn parallelism_limits_concurrent_builds() {
  let revisions: Vec<Revision> = (0..6).map(|i| branch(&format!("b{i}"), i)).collect();
  let temp = TempDir::new().unwrap();
  let builder = Arc::new(FakeBuilder::default().with_delay(Duration::from_millis(20)));
  let driver = fake_driver(&temp, FakeProvider::new(revisions), builder.clone()).with_parallelism(Some(1));

  let report = driver.run().await.unwrap();

  assert_eq!(report.builds.len(), 6);
  assert_eq!(builder.peak(), 1);
}

#[tokio::test]
async fn unbounded_builds_overlap() {
  let revisions: Vec<Revision> = (0..6).map(|i| branch(&format!("b{i}"), i)).collect();
  let temp = TempDir::new().unwrap();
  let builder = Arc::new(FakeBuilder::default().with_delay(Duration::from_millis(200)));
  let driver = fake_driver(&temp, FakeProvider::new(revisions), builder.clone());

  driver.run().await.unwrap();

  assert!(builder.peak() > 1);
}

#[tokio::test]
async fn filtered_revisions_are_not_built() {
  let temp = TempDir::new().unwrap();
  let provider = FakeProvider::new(three_revisions()).with_rejected(&["dev"]);
  let driver = fake_driver(&temp, provider, Arc::new(FakeBuilder::default()));

  let report = driver.run().await.unwrap();

  assert_eq!(names(&report.targets), vec!["main", "v1.0"]);
  assert!(report.is_success());
  assert_eq!(subdirs(&temp.path().join("out")), vec!["main", "v1.0"]);
}

#[tokio::test]
async fn discovery_failure_aborts_the_run() {
  let temp = TempDir::new().unwrap();
  let provider = FakeProvider {
    discovery_fails: true,
    ..FakeProvider::new(three_revisions())
  };
  let driver = fake_driver(&temp, provider, Arc::new(FakeBuilder::default()));

  let err = driver.run().await.unwrap_err();

  assert!(matches!(err, DriverError::Discovery(_)));
  assert!(!temp.path().join("out").join(MANIFEST_FILE).exists());
}

#[tokio::test]
async fn no_revisions_still_writes_an_empty_manifest() {
  let temp = TempDir::new().unwrap();
  let driver = fake_driver(&temp, FakeProvider::new(Vec::new()), Arc::new(FakeBuilder::default()));

  let report = driver.run().await.unwrap();

  assert!(report.builds.is_empty());
  assert!(manifest_names(&temp.path().join("out")).is_empty());
}

#[tokio::test]
async fn sorted_builds_follow_creation_time() {
  let revisions = vec![branch("newest", 300), branch("oldest", 100), branch("middle", 200)];
  let temp = TempDir::new().unwrap();
  let driver = fake_driver(&temp, FakeProvider::new(revisions), Arc::new(FakeBuilder::default()))
    .with_sorted_builds(true);

  let report = driver.run().await.unwrap();

  assert_eq!(report.build_names(), vec!["oldest", "middle", "newest"]);
}

// =============================================================================
// Factories and selection
// =============================================================================

#[tokio::test]
async fn namer_controls_output_directories() {
  let temp = TempDir::new().unwrap();
  let namer: Namer = Arc::new(|rev: &Revision| format!("{}-docs", rev.name));
  let driver = fake_driver(
    &temp,
    FakeProvider::new(three_revisions()),
    Arc::new(FakeBuilder::default()),
  )
  .with_namer(namer);

  driver.run().await.unwrap();

  assert_eq!(subdirs(&temp.path().join("out")), vec!["dev-docs", "main-docs", "v1.0-docs"]);
}

#[tokio::test]
async fn data_factory_sees_targets_and_environment() {
  let temp = TempDir::new().unwrap();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let recorded = seen.clone();
  let factory: DataFactory = Arc::new(move |req: &DataRequest<'_>| {
    recorded
      .lock()
      .unwrap()
      .push((req.revision.name.clone(), req.targets.len(), req.environment.state()));
    // every revision claims to be the oldest target
    let oldest = req.targets.iter().min_by_key(|r| r.created_at).unwrap();
    Value::map([("current", Value::from(oldest.clone()))])
  });
  let driver = fake_driver(
    &temp,
    FakeProvider::new(three_revisions()),
    Arc::new(FakeBuilder::default()),
  )
  .with_data_factory(factory);

  driver.run().await.unwrap();

  let out = temp.path().join("out");
  assert_eq!(read(out.join("main/index.html")), "main|v1.0");
  assert_eq!(read(out.join("dev/index.html")), "dev|v1.0");

  let seen = seen.lock().unwrap();
  assert_eq!(seen.len(), 3);
  assert!(seen.iter().all(|(_, targets, state)| *targets == 3 && *state == EnvState::Entered));
}

#[tokio::test]
async fn builder_is_selected_per_revision() {
  let temp = TempDir::new().unwrap();
  let good: Arc<dyn Builder> = Arc::new(FakeBuilder::default());
  let bad: Arc<dyn Builder> = Arc::new(FakeBuilder::failing(&["v1.0"]));
  let builders = Selectable::selected(name_selector(Some("default".into())), [("v1.0", bad), ("default", good)]);
  let driver = Driver::new(
    temp.path().join("repo"),
    temp.path().join("out"),
    Arc::new(FakeProvider::new(three_revisions())),
    builders,
    PlainEnvironment::factory(),
  );

  let report = driver.run().await.unwrap();

  assert_eq!(report.failed_names(), vec!["v1.0"]);
  assert_eq!(names(&report.builds), vec!["dev", "main"]);
}

#[tokio::test]
async fn missing_selection_fails_only_that_revision() {
  let temp = TempDir::new().unwrap();
  let only_main: Arc<dyn Builder> = Arc::new(FakeBuilder::default());
  let builders = Selectable::selected(name_selector(None), [("main", only_main)]);
  let driver = Driver::new(
    temp.path().join("repo"),
    temp.path().join("out"),
    Arc::new(FakeProvider::new(three_revisions())),
    builders,
    PlainEnvironment::factory(),
  );

  let report = driver.run().await.unwrap();

  assert_eq!(report.build_names(), vec!["main"]);
  assert_eq!(report.failures.len(), 2);
  assert!(report.failures.iter().all(|f| matches!(f.error, TaskError::Select(_))));
}

/// Environment recording its lifecycle transitions.
struct RecordingEnvironment {
  inner: PlainEnvironment,
  log: Arc<Mutex<Vec<(String, EnvState)>>>,
}

#[async_trait]
impl Environment for RecordingEnvironment {
  fn path(&self) -> &Path {
    self.inner.path()
  }

  fn name(&self) -> &str {
    self.inner.name()
  }

  fn state(&self) -> EnvState {
    self.inner.state()
  }

  async fn enter(&mut self) -> Result<(), BuildError> {
    self.inner.enter().await?;
    self.log.lock().unwrap().push((self.name().to_string(), EnvState::Entered));
    Ok(())
  }

  async fn exit(&mut self) -> Result<(), BuildError> {
    self.inner.exit().await?;
    self.log.lock().unwrap().push((self.name().to_string(), EnvState::Exited));
    Ok(())
  }

  fn activate(&self, ctx: &mut ExecContext) {
    self.inner.activate(ctx)
  }

  async fn execute(&self, cmd: &[String], ctx: ExecContext) -> Result<CommandOutput, BuildError> {
    self.inner.execute(cmd, ctx).await
  }
}

#[tokio::test]
async fn environments_are_exited_after_failed_builds() {
  let temp = TempDir::new().unwrap();
  let log = Arc::new(Mutex::new(Vec::new()));
  let shared = log.clone();
  let factory: EnvironmentFactory = Arc::new(move |path: &Path, name: &str| -> Box<dyn Environment> {
    Box::new(RecordingEnvironment {
      inner: PlainEnvironment::new(path, name),
      log: shared.clone(),
    })
  });
  let builder: Arc<dyn Builder> = Arc::new(FakeBuilder::failing(&["dev"]));
  let driver = Driver::new(
    temp.path().join("repo"),
    temp.path().join("out"),
    Arc::new(FakeProvider::new(three_revisions())),
    builder,
    factory,
  );

  driver.run().await.unwrap();

  let log = log.lock().unwrap();
  for name in ["main", "dev", "v1.0"] {
    let states: Vec<EnvState> = log.iter().filter(|(n, _)| n == name).map(|(_, s)| *s).collect();
    assert_eq!(states, vec![EnvState::Entered, EnvState::Exited], "lifecycle of {name}");
  }
}

/// Restores the working directory on drop.
struct CwdGuard(std::path::PathBuf);

impl CwdGuard {
  fn enter(dir: &Path) -> Self {
    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir).unwrap();
    Self(previous)
  }
}

impl Drop for CwdGuard {
  fn drop(&mut self) {
    let _ = std::env::set_current_dir(&self.0);
  }
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn relative_output_directory_is_resolved_before_building() {
  let temp = TempDir::new().unwrap();
  let _cwd = CwdGuard::enter(temp.path());
  let builder: Arc<dyn Builder> = Arc::new(CommandBuilder::new(
    ".",
    ["sh", "-c", "echo built > \"$0/index.html\"", "{OUTPUT_DIR}"],
  ));
  let driver = Driver::new(
    ".",
    "site",
    Arc::new(FakeProvider::new(vec![branch("main", 1)])),
    builder,
    PlainEnvironment::factory(),
  );

  let report = driver.run().await.unwrap();

  assert!(report.is_success(), "failures: {:?}", report.failed_names());
  assert_eq!(names(&report.builds), vec!["main"]);
  assert_eq!(read(temp.path().join("site/main/index.html")).trim(), "built");
  assert!(temp.path().join("site").join(MANIFEST_FILE).is_file());
}

#[tokio::test]
async fn environments_are_exited_after_panicking_builds() {
  let temp = TempDir::new().unwrap();
  let log = Arc::new(Mutex::new(Vec::new()));
  let shared = log.clone();
  let factory: EnvironmentFactory = Arc::new(move |path: &Path, name: &str| -> Box<dyn Environment> {
    Box::new(RecordingEnvironment {
      inner: PlainEnvironment::new(path, name),
      log: shared.clone(),
    })
  });
  let mut builder = FakeBuilder::default();
  builder.panicking.insert("dev".to_string());
  let builder: Arc<dyn Builder> = Arc::new(builder);
  let driver = Driver::new(
    temp.path().join("repo"),
    temp.path().join("out"),
    Arc::new(FakeProvider::new(three_revisions())),
    builder,
    factory,
  );

  let report = driver.run().await.unwrap();

  assert_eq!(report.failed_names(), vec!["dev"]);
  assert!(matches!(report.failures[0].error, TaskError::Panicked(_)));
  let log = log.lock().unwrap();
  let states: Vec<EnvState> = log.iter().filter(|(n, _)| n == "dev").map(|(_, s)| *s).collect();
  assert_eq!(states, vec![EnvState::Entered, EnvState::Exited]);
}

// =============================================================================
// Root merge
// =============================================================================

#[tokio::test]
async fn root_merge_copies_static_files_and_renders_templates() {
  let temp = TempDir::new().unwrap();
  let static_dir = temp.path().join("static");
  std::fs::create_dir_all(static_dir.join("css")).unwrap();
  std::fs::write(static_dir.join("css/site.css"), "body {}").unwrap();
  let template_dir = temp.path().join("templates");
  std::fs::create_dir_all(&template_dir).unwrap();
  std::fs::write(
    template_dir.join("versions.txt"),
    "{% for r in revisions|sort(attribute='name') %}{{ r.name }};{% endfor %}",
  )
  .unwrap();

  let driver = fake_driver(
    &temp,
    FakeProvider::new(three_revisions()),
    Arc::new(FakeBuilder::failing(&["dev"])),
  )
  .with_static_dir(&static_dir)
  .with_template_dir(&template_dir);

  driver.run().await.unwrap();

  let out = temp.path().join("out");
  assert_eq!(read(out.join("css/site.css")), "body {}");
  assert_eq!(read(out.join("versions.txt")), "main;v1.0;");
}

#[tokio::test]
async fn root_data_factory_replaces_the_default_context() {
  let temp = TempDir::new().unwrap();
  let template_dir = temp.path().join("templates");
  std::fs::create_dir_all(&template_dir).unwrap();
  std::fs::write(template_dir.join("summary.txt"), "{{ built }} of {{ total }}").unwrap();

  let factory: RootDataFactory = Arc::new(|_driver: &Driver, report: &RunReport| {
    Value::map([
      ("built", Value::from(report.builds.len() as u64)),
      ("total", Value::from(report.targets.len() as u64)),
    ])
  });
  let driver = fake_driver(
    &temp,
    FakeProvider::new(three_revisions()),
    Arc::new(FakeBuilder::failing(&["main"])),
  )
  .with_template_dir(&template_dir)
  .with_root_data_factory(factory);

  driver.run().await.unwrap();

  assert_eq!(read(temp.path().join("out/summary.txt")), "2 of 3");
}

// =============================================================================
// Local mode
// =============================================================================

#[tokio::test]
async fn local_run_builds_the_working_tree() {
  let temp = TempDir::new().unwrap();
  let repo = temp.path().join("repo");
  std::fs::create_dir_all(repo.join("docs")).unwrap();
  std::fs::write(repo.join(MARKER), "working-tree").unwrap();
  std::fs::write(repo.join("docs/index.rst"), "Title").unwrap();

  let mock = MockData {
    current: branch("main", 50),
    revisions: vec![tag("v1.0", 10), tag("v2.0", 20)],
  };
  let driver = fake_driver(&temp, FakeProvider::new(Vec::new()), Arc::new(FakeBuilder::default()));

  let report = driver.run_local(mock).await.unwrap();

  assert_eq!(names(&report.builds), vec!["main", "v1.0", "v2.0"]);
  let out = temp.path().join("out");
  assert_eq!(subdirs(&out), vec!["local"]);
  assert_eq!(read(out.join("local/index.html")), "working-tree|main");
  assert_eq!(read(out.join("local/files.txt")), format!("{MARKER}\ndocs"));
  assert_eq!(manifest_names(&out), vec!["main", "v1.0", "v2.0"]);
}

#[tokio::test]
async fn local_run_does_not_duplicate_current() {
  let temp = TempDir::new().unwrap();
  std::fs::create_dir_all(temp.path().join("repo")).unwrap();
  let main = branch("main", 50);
  let mock = MockData {
    current: main.clone(),
    revisions: vec![main, tag("v1.0", 10)],
  };
  let driver = fake_driver(&temp, FakeProvider::new(Vec::new()), Arc::new(FakeBuilder::default()));

  let report = driver.run_local(mock).await.unwrap();

  assert_eq!(report.builds.len(), 2);
}

#[tokio::test]
async fn local_build_failure_is_an_error() {
  let temp = TempDir::new().unwrap();
  std::fs::create_dir_all(temp.path().join("repo")).unwrap();
  let mock = MockData {
    current: branch("main", 50),
    revisions: Vec::new(),
  };
  let driver = fake_driver(
    &temp,
    FakeProvider::new(Vec::new()),
    Arc::new(FakeBuilder::failing(&["main"])),
  );

  let err = driver.run_local(mock).await.unwrap_err();

  assert!(matches!(err, DriverError::Local(TaskError::Build(_))));
  assert!(!temp.path().join("out").join(MANIFEST_FILE).exists());
}
