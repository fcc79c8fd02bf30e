//! 模块管理器端到端测试：磁盘上的模块包、配置文件、进程内宿主

use hotswap::core::{EventListener, ModuleEvent, SchedulerKind};
use hotswap::plugins::{CommandHandler, InProcessHost, Module, ModuleManager, ModuleView};
use hotswap::{ConfigManager, ModuleState, Outcome};
use parking_lot::Mutex;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Handle;

const CORE_DESCRIPTOR: &str = r#"
name: Core
version: 1.4.2
main: demo.Core
libraries: org.example:json:2.0
commands:
  core:
    description: Show core status
    aliases: [c]
"#;

const ECONOMY_DESCRIPTOR: &str = r#"
name: Economy
version: 0.9
main: demo.Economy
depend: Core
commands:
  balance:
    aliases: [bal, money]
"#;

struct Status;

impl CommandHandler for Status {
    fn execute(&self, _sender: &str, _label: &str, _args: &[String]) -> anyhow::Result<bool> {
        Ok(true)
    }
}

struct Core;

impl Module for Core {
    fn command_handler(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        (command == "core").then(|| Arc::new(Status) as Arc<dyn CommandHandler>)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Economy {
    saw_core: bool,
}

impl Module for Economy {
    fn on_load(&mut self, peers: &ModuleView<'_>) -> anyhow::Result<()> {
        self.saw_core = peers.instance::<Core>("Core").is_some();
        anyhow::ensure!(self.saw_core, "Core must be loaded first");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Journal(Arc<Mutex<Vec<String>>>);

impl EventListener for Journal {
    fn handle(&self, event: &ModuleEvent) -> anyhow::Result<()> {
        self.0.lock().push(event.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "journal"
    }
}

struct Fixture {
    _temp_dir: TempDir,
    modules_dir: PathBuf,
    manager: ModuleManager<InProcessHost>,
    core_instances: Arc<AtomicUsize>,
    journal: Arc<Mutex<Vec<String>>>,
}

fn write_package(modules_dir: &Path, dir: &str, entry: &str, content: &str) -> PathBuf {
    let package = modules_dir.join(dir);
    std::fs::create_dir_all(&package).unwrap();
    std::fs::write(package.join(entry), content).unwrap();
    package
}

async fn fixture() -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let modules_dir = temp_dir.path().join("modules");
    write_package(&modules_dir, "core", "module.yml", CORE_DESCRIPTOR);
    write_package(&modules_dir, "economy", "module-host.yml", ECONOMY_DESCRIPTOR);

    let config_path = temp_dir.path().join("hotswap.yaml");
    tokio::fs::write(
        &config_path,
        format!("modules_dir: {}\ntick_millis: 50\n", modules_dir.display()),
    )
    .await
    .unwrap();
    let config = ConfigManager::load_from_file(&config_path).await.unwrap().into_config();
    hotswap::initialize(&config.logging);

    let core_instances = Arc::new(AtomicUsize::new(0));
    let counter = core_instances.clone();
    let mut host = InProcessHost::new();
    host.register_factory("demo.Core", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(Core) as Box<dyn Module>))
    });
    host.register_factory("demo.Economy", |_| {
        Ok(Some(Box::new(Economy { saw_core: false }) as Box<dyn Module>))
    });

    let journal = Arc::new(Mutex::new(Vec::new()));
    host.events_mut().register_catch_all(Arc::new(Journal(journal.clone())));

    Fixture {
        _temp_dir: temp_dir,
        modules_dir,
        manager: ModuleManager::new(host, config),
        core_instances,
        journal,
    }
}

#[tokio::test]
async fn test_full_lifecycle_from_packages() {
    let mut fx = fixture().await;
    let manager = &mut fx.manager;

    let loaded = manager.load_files([fx.modules_dir.join("core"), fx.modules_dir.join("economy")]);
    assert!(loaded.is_success(), "{:?}", loaded);
    let economy = manager.module("economy").unwrap();
    assert!(economy.instance().as_any().downcast_ref::<Economy>().unwrap().saw_core);

    let enabled = manager.enable(["Core", "Economy"]);
    assert!(enabled.is_success());
    assert_eq!(manager.command("money").unwrap().owner, "Economy");
    let status = manager.command("c").unwrap().handler().unwrap();
    assert!(status.execute("console", "c", &[]).unwrap());

    assert!(manager.disable(["Economy"]).is_success());
    let mut unloaded = manager.unload(["Economy"]);
    assert!(unloaded.is_success());
    assert!(unloaded.close_all().is_empty());

    assert!(!manager.commands().owners().contains("Economy"));
    assert!(manager.command("bal").is_none());
    assert!(manager.module("Economy").is_none());
    assert!(!manager.table().has_lookup_name("economy"));
    assert!(manager.is_enabled("Core"));
}

#[tokio::test]
async fn test_reload_replaces_instance() {
    let mut fx = fixture().await;
    fx.manager.load_file_named("core");
    fx.manager.enable(["Core"]);
    fx.journal.lock().clear();

    let result = fx.manager.reload("Core");

    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(fx.core_instances.load(Ordering::SeqCst), 2);
    assert_eq!(fx.manager.state("Core"), ModuleState::Enabled);
    assert_eq!(fx.manager.command("c").unwrap().owner, "Core");
    assert_eq!(
        *fx.journal.lock(),
        vec![
            "Pre-Disable(Core)",
            "Post-Disable(Core)",
            "Pre-Unload(Core)",
            "Post-Unload(Core)",
            "Pre-Load(Core)",
            "Post-Load(Core)",
            "Pre-Enable(Core)",
            "Post-Enable(Core)",
        ]
    );
}

#[tokio::test]
async fn test_reload_after_package_removed() {
    let mut fx = fixture().await;
    fx.manager.load_file_named("core");
    fx.manager.enable(["Core"]);
    std::fs::remove_dir_all(fx.modules_dir.join("core")).unwrap();

    let result = fx.manager.reload("Core");

    assert_eq!(result.outcome, Outcome::FileChanged);
    assert!(fx.manager.module("Core").is_none());
    assert!(fx.manager.command("core").is_none());
}

#[tokio::test]
async fn test_reload_disabled_module_is_refused() {
    let mut fx = fixture().await;
    fx.manager.load_file_named("core");

    let result = fx.manager.reload("Core");

    assert_eq!(result.outcome, Outcome::AlreadyDisabled);
    assert_eq!(fx.manager.state("Core"), ModuleState::Loaded);
    assert_eq!(fx.core_instances.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_load_failures_from_disk() {
    let mut fx = fixture().await;
    write_package(&fx.modules_dir, "broken", "module.yml", "name: Broken\nversion: 1\n");

    let missing = fx.manager.load_file_named("nowhere");
    assert_eq!(missing.outcome_of("nowhere"), Some(Outcome::NotExists));

    let invalid = fx.manager.load_file_named("broken");
    assert_eq!(invalid.outcome_of("broken"), Some(Outcome::InvalidDescription));

    let orphan = fx.manager.load_file_named("economy");
    let failure = orphan.first_failure().unwrap();
    assert_eq!(failure.outcome, Outcome::UnknownDependency);
    assert_eq!(failure.detail("dependency"), Some("Core"));
    assert_eq!(fx.manager.modules().count(), 0);
}

#[tokio::test]
async fn test_scheduler_bound_from_host_capability() {
    let mut fx = fixture().await;
    let scheduler = fx.manager.bind_scheduler(Handle::current());
    assert_eq!(scheduler.kind(), SchedulerKind::Global);

    let (sender, receiver) = tokio::sync::oneshot::channel();
    scheduler.run_task(move || {
        let _ = sender.send("ran");
    });
    let ran = tokio::time::timeout(Duration::from_secs(1), receiver).await.unwrap().unwrap();
    assert_eq!(ran, "ran");

    let fired = Arc::new(AtomicUsize::new(0));
    let flag = fired.clone();
    let delay = fx.manager.config().ticks(1);
    let scheduler = fx.manager.scheduler().unwrap();
    let handle = scheduler.run_task_later(move || {
        flag.fetch_add(1, Ordering::SeqCst);
    }, delay);
    assert!(scheduler.cancel_task(&handle));
    assert!(!scheduler.cancel_task(&handle));

    tokio::time::sleep(delay * 3).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.metrics().tasks_cancelled, 1);
}
