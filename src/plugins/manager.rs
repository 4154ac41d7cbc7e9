//! Plugin lifecycle controller - owns the registry and the reload protocol
//!
//! One reload cycle at a time, serialized by an async lock. The published
//! registry is an immutable snapshot swapped atomically; readers never take
//! a lock. Partial failures publish whatever succeeded; only discovery or
//! config errors abort a cycle and leave the previous snapshot in force.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::application::errors::{CycleError, PluginError};
use crate::application::services::BUILTIN_COMMANDS;
use crate::plugins::contract::{Capability, HostContext, Plugin, PluginMetadata};
use crate::plugins::discovery::{self, Candidate, PluginManifest, SourceKind, OVERLAY_FILE, PACKAGE_ENTRY};
use crate::plugins::factory::FactoryRegistry;
use crate::plugins::overlay::PluginOverlay;
use crate::plugins::registry::{CommandRegistration, PluginRecord, PluginState, Registry};

/// Why a reload cycle was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadReason {
    FileChange,
    Manual,
    ConfigChange,
}

/// Ephemeral reload trigger. Requests arriving inside one debounce window
/// coalesce into a single cycle.
#[derive(Debug, Clone)]
pub struct ReloadRequest {
    pub id: Uuid,
    pub reason: ReloadReason,
    pub trigger_paths: Vec<PathBuf>,
    pub requested_at: DateTime<Utc>,
}

impl ReloadRequest {
    pub fn new(reason: ReloadReason, trigger_paths: Vec<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            reason,
            trigger_paths,
            requested_at: Utc::now(),
        }
    }

    pub fn manual() -> Self {
        Self::new(ReloadReason::Manual, Vec::new())
    }

    pub fn file_change(paths: Vec<PathBuf>) -> Self {
        Self::new(ReloadReason::FileChange, paths)
    }

    pub fn config_change(paths: Vec<PathBuf>) -> Self {
        Self::new(ReloadReason::ConfigChange, paths)
    }

    /// Fold a later request into this one's trigger set
    pub fn merge(&mut self, other: ReloadRequest) {
        for path in other.trigger_paths {
            if !self.trigger_paths.contains(&path) {
                self.trigger_paths.push(path);
            }
        }
    }
}

/// Summary of one completed reload cycle
#[derive(Debug, Default, Clone)]
pub struct ReloadOutcome {
    pub generation: u64,
    pub activated: Vec<String>,
    pub carried: Vec<String>,
    pub failed: Vec<String>,
    /// Command names dropped by conflict resolution
    pub conflicts: Vec<String>,
    pub retired: Vec<String>,
}

/// The lifecycle controller
pub struct PluginManager {
    root: PathBuf,
    factories: FactoryRegistry,
    published: ArcSwap<Registry>,
    overlay: std::sync::RwLock<Arc<PluginOverlay>>,
    reload_lock: Mutex<()>,
    generation: AtomicU64,
    requests_tx: mpsc::UnboundedSender<ReloadRequest>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<ReloadRequest>>>,
}

impl PluginManager {
    pub fn new(root: impl Into<PathBuf>, factories: FactoryRegistry) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            root: root.into(),
            factories,
            published: ArcSwap::from_pointee(Registry::empty()),
            overlay: std::sync::RwLock::new(Arc::new(PluginOverlay::default())),
            reload_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Current published snapshot; lock-free
    pub fn registry(&self) -> Arc<Registry> {
        self.published.load_full()
    }

    /// Overlay configuration currently in force
    pub fn overlay(&self) -> Arc<PluginOverlay> {
        self.overlay.read().expect("overlay lock poisoned").clone()
    }

    /// Sender handle for reload triggers (watcher, manual command)
    pub fn request_sender(&self) -> mpsc::UnboundedSender<ReloadRequest> {
        self.requests_tx.clone()
    }

    /// Queue a reload request for the controller loop
    pub fn request_reload(&self, request: ReloadRequest) {
        if self.requests_tx.send(request).is_err() {
            tracing::debug!("Reload loop not running, request dropped");
        }
    }

    /// Consume queued reload requests until shutdown is signalled.
    ///
    /// Requests that arrive while a cycle is in flight sit in the channel
    /// and are drained into exactly one follow-up cycle.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = {
            let mut guard = self.requests_rx.lock().await;
            match guard.take() {
                Some(rx) => rx,
                None => {
                    tracing::warn!("Reload loop already running");
                    return;
                }
            }
        };

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    let Some(mut request) = maybe else { break };
                    while let Ok(next) = rx.try_recv() {
                        request.merge(next);
                    }
                    match self.reload(request).await {
                        Ok(outcome) => {
                            tracing::info!(
                                generation = outcome.generation,
                                activated = outcome.activated.len(),
                                carried = outcome.carried.len(),
                                failed = outcome.failed.len(),
                                retired = outcome.retired.len(),
                                "Reload cycle published"
                            );
                        }
                        Err(e) => tracing::warn!("Reload cycle aborted: {}", e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("Reload loop stopped");
    }

    /// Run one reload cycle end to end.
    ///
    /// Fatal errors (`Discovery`, `ConfigParse`) return before any visible
    /// mutation; the previously published registry and overlay stay as they
    /// were.
    pub async fn reload(&self, request: ReloadRequest) -> Result<ReloadOutcome, CycleError> {
        let _guard = self.reload_lock.lock().await;
        tracing::debug!(
            request = %request.id,
            reason = ?request.reason,
            triggers = request.trigger_paths.len(),
            "Reload cycle starting"
        );

        let overlay = PluginOverlay::load(self.root.join(OVERLAY_FILE))?;
        let candidates = discovery::discover(&self.root)?;
        overlay.warn_unknown_entries(candidates.iter().map(|c| c.name.as_str()));

        let previous = self.published.load_full();
        let init_timeout = overlay.settings.init_timeout();
        let shutdown_timeout = overlay.settings.shutdown_timeout();

        let mut outcome = ReloadOutcome::default();
        let mut records: BTreeMap<String, PluginRecord> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut carried: HashSet<String> = HashSet::new();

        for candidate in &candidates {
            if records.contains_key(&candidate.name) {
                tracing::warn!(
                    "Duplicate candidate name '{}', ignoring {}",
                    candidate.name,
                    candidate.source_path.display()
                );
                continue;
            }

            // Disabled candidates still get a record so the introspection
            // surface can report them; they are never instantiated.
            if !overlay.enabled(&candidate.name) {
                tracing::info!(plugin = %candidate.name, "Disabled by overlay");
                records.insert(
                    candidate.name.clone(),
                    PluginRecord {
                        metadata: PluginMetadata::new(candidate.name.clone(), "unknown"),
                        instance: None,
                        state: PluginState::Disabled,
                        source_path: candidate.source_path.clone(),
                        source_kind: candidate.source_kind,
                        signature: candidate.signature,
                        settings: serde_json::Value::Object(Default::default()),
                        activated_at: None,
                        last_error: None,
                    },
                );
                continue;
            }

            let settings = overlay.settings_for(&candidate.name);

            // Unchanged source and settings: carry the record forward
            // without re-running initialize.
            if let Some(prev) = previous.records.get(&candidate.name) {
                if prev.is_active()
                    && prev.signature == candidate.signature
                    && prev.source_kind == candidate.source_kind
                    && prev.settings == settings
                {
                    carried.insert(candidate.name.clone());
                    outcome.carried.push(candidate.name.clone());
                    order.push(candidate.name.clone());
                    records.insert(candidate.name.clone(), prev.clone());
                    continue;
                }
            }

            let record = self.load_candidate(candidate, settings, init_timeout).await;
            match record.state {
                PluginState::Active => outcome.activated.push(candidate.name.clone()),
                _ => outcome.failed.push(candidate.name.clone()),
            }
            order.push(candidate.name.clone());
            records.insert(candidate.name.clone(), record);
        }

        let (commands, dropped, panicked) = build_command_table(&order, &mut records);
        outcome.conflicts = dropped;
        for name in panicked {
            outcome.activated.retain(|n| n != &name);
            outcome.carried.retain(|n| n != &name);
            carried.remove(&name);
            outcome.failed.push(name);
        }

        // Retire previous-generation plugins that are gone, disabled, or
        // rebuilt. This completes (or times out) before publication.
        for (name, prev) in previous.records.iter() {
            if prev.state.is_terminal() || carried.contains(name) {
                continue;
            }
            self.retire(name, prev, shutdown_timeout).await;
            outcome.retired.push(name.clone());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        outcome.generation = generation;

        let registry = Registry {
            generation,
            records,
            commands,
        };
        // The single reader-visible mutation of the whole cycle
        self.published.store(Arc::new(registry));
        *self.overlay.write().expect("overlay lock poisoned") = Arc::new(overlay);

        Ok(outcome)
    }

    /// Shut down every active plugin and publish an empty registry. Used on
    /// host exit.
    pub async fn shutdown_all(&self) {
        let _guard = self.reload_lock.lock().await;
        let previous = self.published.load_full();
        let shutdown_timeout = self.overlay().settings.shutdown_timeout();

        for (name, record) in previous.records.iter() {
            if !record.state.is_terminal() {
                self.retire(name, record, shutdown_timeout).await;
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.published.store(Arc::new(Registry {
            generation,
            records: BTreeMap::new(),
            commands: HashMap::new(),
        }));
    }

    /// Instantiate, validate and initialize one candidate. Every failure is
    /// scoped to the returned record; nothing escapes into the cycle.
    async fn load_candidate(
        &self,
        candidate: &Candidate,
        settings: serde_json::Value,
        init_timeout: Duration,
    ) -> PluginRecord {
        let mut record = PluginRecord {
            metadata: PluginMetadata::new(candidate.name.clone(), "unknown"),
            instance: None,
            state: PluginState::Discovered,
            source_path: candidate.source_path.clone(),
            source_kind: candidate.source_kind,
            signature: candidate.signature,
            settings,
            activated_at: None,
            last_error: None,
        };

        match self.try_load(candidate, &mut record, init_timeout).await {
            Ok(()) => {
                record.state = PluginState::Active;
                record.activated_at = Some(Utc::now());
                tracing::info!(
                    plugin = %record.metadata.name,
                    version = %record.metadata.version,
                    "Plugin active"
                );
            }
            Err(e) => {
                tracing::warn!(plugin = %candidate.name, "Plugin failed: {}", e);
                record.state = PluginState::Failed;
                record.last_error = Some(e.to_string());
            }
        }
        record
    }

    async fn try_load(
        &self,
        candidate: &Candidate,
        record: &mut PluginRecord,
        init_timeout: Duration,
    ) -> Result<(), PluginError> {
        let manifest_path = match candidate.source_kind {
            SourceKind::Unit => candidate.source_path.clone(),
            SourceKind::Package => candidate.source_path.join(PACKAGE_ENTRY),
        };
        let manifest = PluginManifest::from_file(&manifest_path)?;
        let entry = manifest.entry.unwrap_or_else(|| candidate.name.clone());

        record.state = PluginState::Loading;
        // Construction and metadata run plugin code synchronously; a panic
        // there must stay scoped to this record like any other load failure.
        let plugin = catch_unwind(AssertUnwindSafe(|| self.factories.construct(&entry)))
            .map_err(|_| PluginError::Load(format!("constructor for '{}' panicked", entry)))??;

        let metadata = catch_unwind(AssertUnwindSafe(|| plugin.metadata()))
            .map_err(|_| PluginError::Load("metadata() panicked".to_string()))?;
        metadata.validate()?;
        if metadata.name != candidate.name {
            return Err(PluginError::Validation(format!(
                "declared name '{}' does not match candidate '{}'",
                metadata.name, candidate.name
            )));
        }
        record.metadata = metadata;
        record.instance = Some(Arc::clone(&plugin));

        let ctx = HostContext::new(&candidate.name, record.settings.clone());
        let mut task = tokio::spawn(async move { plugin.initialize(&ctx).await });
        match tokio::time::timeout(init_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(PluginError::InitFailed(e.to_string())),
            Ok(Err(join_err)) => Err(PluginError::InitFailed(format!(
                "initialize panicked: {}",
                join_err
            ))),
            Err(_) => {
                task.abort();
                Err(PluginError::InitTimeout(init_timeout.as_secs()))
            }
        }
    }

    /// Drive one departing plugin through `ShuttingDown` to `Retired` under
    /// the bounded timeout. Failures and timeouts are logged; they never
    /// block publication.
    async fn retire(&self, name: &str, record: &PluginRecord, shutdown_timeout: Duration) {
        if !record.state.can_transition_to(PluginState::ShuttingDown) {
            return;
        }
        let Some(plugin) = record.instance.clone() else {
            return;
        };
        tracing::debug!(
            plugin = %name,
            state = PluginState::ShuttingDown.as_str(),
            "Shutting down"
        );

        let mut task = tokio::spawn(async move { plugin.shutdown().await });
        match tokio::time::timeout(shutdown_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => tracing::info!(
                plugin = %name,
                state = PluginState::Retired.as_str(),
                "Plugin retired"
            ),
            Ok(Ok(Err(e))) => tracing::warn!(plugin = %name, "Shutdown failed: {}", e),
            Ok(Err(join_err)) => {
                tracing::warn!(plugin = %name, "Shutdown panicked: {}", join_err)
            }
            Err(_) => {
                task.abort();
                let err = PluginError::ShutdownTimeout(shutdown_timeout.as_secs());
                tracing::warn!(plugin = %name, "{}, abandoning", err);
            }
        }
    }
}

/// Derive the command table from active command-capable records, in
/// discovery order. First claimant of a name wins; later claimants are
/// logged and dropped without affecting their plugin's state. Host built-in
/// names are never granted.
fn build_command_table(
    order: &[String],
    records: &mut BTreeMap<String, PluginRecord>,
) -> (HashMap<String, CommandRegistration>, Vec<String>, Vec<String>) {
    let mut commands: HashMap<String, CommandRegistration> = HashMap::new();
    let mut dropped = Vec::new();
    let mut panicked = Vec::new();

    for name in order {
        let Some(record) = records.get_mut(name) else {
            continue;
        };
        if !record.is_active() || !record.has_capability(Capability::Commands) {
            continue;
        }
        let Some(instance) = record.instance.clone() else {
            continue;
        };

        let specs = match catch_unwind(AssertUnwindSafe(|| instance.commands())) {
            Ok(specs) => specs,
            Err(_) => {
                let err = PluginError::ExecutionFailed("commands() panicked".to_string());
                tracing::warn!(plugin = %name, "Plugin failed: {}", err);
                record.state = PluginState::Failed;
                record.last_error = Some(err.to_string());
                panicked.push(name.clone());
                continue;
            }
        };

        for spec in specs {
            if BUILTIN_COMMANDS.contains(&spec.name.as_str()) {
                tracing::warn!(
                    "Command conflict: '{}' from plugin '{}' collides with a host command",
                    spec.name,
                    name
                );
                dropped.push(spec.name.clone());
                continue;
            }
            if let Some(existing) = commands.get(&spec.name) {
                tracing::warn!(
                    "Command conflict: '{}' already owned by '{}', dropping claim from '{}'",
                    spec.name,
                    existing.plugin_name,
                    name
                );
                dropped.push(spec.name.clone());
                continue;
            }
            commands.insert(
                spec.name.clone(),
                CommandRegistration {
                    command_name: spec.name.clone(),
                    plugin_name: name.clone(),
                    description: spec.description.clone(),
                    handler: Arc::clone(&spec.handler),
                },
            );
        }
    }

    (commands, dropped, panicked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::CommandSpec;
    use crate::plugins::contract::Plugin;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Ok,
        FailInit,
        HangInit,
        HangShutdown,
        PanicCommands,
    }

    struct TestPlugin {
        name: String,
        behavior: Behavior,
        commands: Vec<String>,
        init_calls: Arc<AtomicUsize>,
        shutdown_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new(&self.name, "0.1.0")
                .with_capability(Capability::Commands)
                .with_capability(Capability::Statistics)
        }

        async fn initialize(&self, _ctx: &HostContext) -> Result<(), PluginError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::FailInit => Err(PluginError::InitFailed("boom".to_string())),
                Behavior::HangInit => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                _ => Ok(()),
            }
        }

        async fn shutdown(&self) -> Result<(), PluginError> {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            if self.behavior == Behavior::HangShutdown {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        fn commands(&self) -> Vec<CommandSpec> {
            if self.behavior == Behavior::PanicCommands {
                panic!("command listing blew up");
            }
            let owner = self.name.clone();
            self.commands
                .iter()
                .map(|c| {
                    let owner = owner.clone();
                    let description = format!("{} from {}", c, owner);
                    CommandSpec::new(c.clone(), move |_msg| Ok(format!("{} says hi", owner)))
                        .with_description(description)
                })
                .collect()
        }
    }

    struct Harness {
        root: tempfile::TempDir,
        factories: FactoryRegistry,
        init_calls: HashMap<String, Arc<AtomicUsize>>,
        shutdown_calls: HashMap<String, Arc<AtomicUsize>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                factories: FactoryRegistry::new(),
                init_calls: HashMap::new(),
                shutdown_calls: HashMap::new(),
            }
        }

        fn add_plugin(&mut self, name: &str, behavior: Behavior, commands: &[&str]) {
            let init = Arc::new(AtomicUsize::new(0));
            let down = Arc::new(AtomicUsize::new(0));
            self.init_calls.insert(name.to_string(), init.clone());
            self.shutdown_calls.insert(name.to_string(), down.clone());

            let name_owned = name.to_string();
            let commands: Vec<String> = commands.iter().map(|s| s.to_string()).collect();
            self.factories.register(name, move || {
                Arc::new(TestPlugin {
                    name: name_owned.clone(),
                    behavior,
                    commands: commands.clone(),
                    init_calls: init.clone(),
                    shutdown_calls: down.clone(),
                }) as Arc<dyn Plugin>
            });
            self.write_unit(name, "{}\n");
        }

        fn write_unit(&self, name: &str, content: &str) {
            std::fs::write(
                self.root.path().join(format!("{}.plugin.yaml", name)),
                content,
            )
            .unwrap();
        }

        fn write_overlay(&self, content: &str) {
            std::fs::write(self.root.path().join(OVERLAY_FILE), content).unwrap();
        }

        fn manager(&self) -> Arc<PluginManager> {
            Arc::new(PluginManager::new(
                self.root.path(),
                self.factories.clone(),
            ))
        }

        fn inits(&self, name: &str) -> usize {
            self.init_calls[name].load(Ordering::SeqCst)
        }

        fn shutdowns(&self, name: &str) -> usize {
            self.shutdown_calls[name].load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_cycle_activates_and_builds_command_table() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["top"]);
        h.add_plugin("beta", Behavior::Ok, &["words"]);
        let manager = h.manager();

        let outcome = manager.reload(ReloadRequest::manual()).await.unwrap();
        assert_eq!(outcome.generation, 1);
        assert_eq!(outcome.activated, vec!["alpha", "beta"]);
        assert!(outcome.failed.is_empty());

        let registry = manager.registry();
        assert_eq!(registry.generation, 1);
        assert!(registry.record("alpha").unwrap().is_active());
        assert_eq!(registry.command("top").unwrap().plugin_name, "alpha");
        assert_eq!(registry.command("words").unwrap().plugin_name, "beta");
    }

    #[tokio::test]
    async fn test_command_conflict_first_discovered_wins() {
        let mut h = Harness::new();
        // Registered out of order on purpose; discovery order is
        // lexicographic, so alpha claims ping first.
        h.add_plugin("beta", Behavior::Ok, &["ping"]);
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        let manager = h.manager();

        let outcome = manager.reload(ReloadRequest::manual()).await.unwrap();
        assert_eq!(outcome.conflicts, vec!["ping"]);

        let registry = manager.registry();
        assert_eq!(registry.command("ping").unwrap().plugin_name, "alpha");
        // The losing plugin stays active
        assert!(registry.record("beta").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_no_duplicate_command_owners() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping", "stats-a"]);
        h.add_plugin("beta", Behavior::Ok, &["ping", "stats-b"]);
        let manager = h.manager();
        manager.reload(ReloadRequest::manual()).await.unwrap();

        let registry = manager.registry();
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (name, reg) in registry.commands.iter() {
            if let Some(prev) = seen.insert(name.as_str(), reg.plugin_name.as_str()) {
                panic!("command '{}' owned by both '{}' and '{}'", name, prev, reg.plugin_name);
            }
        }
        assert_eq!(registry.commands.len(), 3);
    }

    #[tokio::test]
    async fn test_overlay_disable_keeps_record_without_loading() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        h.add_plugin("beta", Behavior::Ok, &["words"]);
        h.write_overlay("plugins:\n  alpha:\n    enabled: false\n");
        let manager = h.manager();

        manager.reload(ReloadRequest::manual()).await.unwrap();
        let registry = manager.registry();
        let alpha = registry.record("alpha").unwrap();
        assert_eq!(alpha.state, PluginState::Disabled);
        assert!(alpha.instance.is_none());
        assert_eq!(h.inits("alpha"), 0);
        assert!(registry.command("ping").is_none());
        assert!(registry.record("beta").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_overlay_reenable_loads_plugin() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        h.write_overlay("plugins:\n  alpha:\n    enabled: false\n");
        let manager = h.manager();
        manager.reload(ReloadRequest::manual()).await.unwrap();
        assert_eq!(
            manager.registry().record("alpha").unwrap().state,
            PluginState::Disabled
        );

        h.write_overlay("plugins:\n  alpha:\n    enabled: true\n");
        let outcome = manager.reload(ReloadRequest::config_change(vec![])).await.unwrap();
        assert_eq!(outcome.activated, vec!["alpha"]);
        assert_eq!(h.inits("alpha"), 1);
        assert!(manager.registry().command("ping").is_some());
    }

    #[tokio::test]
    async fn test_failed_init_is_isolated() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        h.add_plugin("beta", Behavior::FailInit, &["words"]);
        let manager = h.manager();

        let outcome = manager.reload(ReloadRequest::manual()).await.unwrap();
        assert_eq!(outcome.activated, vec!["alpha"]);
        assert_eq!(outcome.failed, vec!["beta"]);

        let registry = manager.registry();
        let beta = registry.record("beta").unwrap();
        assert_eq!(beta.state, PluginState::Failed);
        assert!(beta.last_error.as_deref().unwrap().contains("boom"));
        // Failed plugin's commands are simply absent
        assert!(registry.command("words").is_none());
        assert!(registry.command("ping").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout_marks_failed() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        h.add_plugin("beta", Behavior::HangInit, &["words"]);
        h.write_overlay("settings:\n  init-timeout-secs: 1\n");
        let manager = h.manager();

        manager.reload(ReloadRequest::manual()).await.unwrap();
        let registry = manager.registry();
        let beta = registry.record("beta").unwrap();
        assert_eq!(beta.state, PluginState::Failed);
        assert!(beta.last_error.as_deref().unwrap().contains("timed out"));
        assert!(registry.record("alpha").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_missing_factory_is_scoped_load_error() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        // Manifest on disk, but nothing registered for it
        h.write_unit("ghost", "{}\n");
        let manager = h.manager();

        let outcome = manager.reload(ReloadRequest::manual()).await.unwrap();
        assert_eq!(outcome.failed, vec!["ghost"]);
        let registry = manager.registry();
        assert!(registry
            .record("ghost")
            .unwrap()
            .last_error
            .as_deref()
            .unwrap()
            .contains("no factory"));
        assert!(registry.record("alpha").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_constructor_panic_is_scoped() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        h.factories.register("bomb", || panic!("construction blew up"));
        h.write_unit("bomb", "{}\n");
        let manager = h.manager();

        let outcome = manager.reload(ReloadRequest::manual()).await.unwrap();
        assert_eq!(outcome.activated, vec!["alpha"]);
        assert_eq!(outcome.failed, vec!["bomb"]);

        let registry = manager.registry();
        let bomb = registry.record("bomb").unwrap();
        assert_eq!(bomb.state, PluginState::Failed);
        assert!(bomb.last_error.as_deref().unwrap().contains("panicked"));
        assert!(registry.command("ping").is_some());
    }

    #[tokio::test]
    async fn test_commands_panic_is_scoped() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        h.add_plugin("beta", Behavior::PanicCommands, &["words"]);
        let manager = h.manager();

        let outcome = manager.reload(ReloadRequest::manual()).await.unwrap();
        assert_eq!(outcome.activated, vec!["alpha"]);
        assert_eq!(outcome.failed, vec!["beta"]);

        let registry = manager.registry();
        let beta = registry.record("beta").unwrap();
        assert_eq!(beta.state, PluginState::Failed);
        assert!(beta.last_error.as_deref().unwrap().contains("panicked"));
        assert!(registry.command("words").is_none());
        assert!(registry.command("ping").is_some());
    }

    #[tokio::test]
    async fn test_malformed_overlay_aborts_and_preserves_registry() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        let manager = h.manager();
        manager.reload(ReloadRequest::manual()).await.unwrap();
        let before = manager.registry();

        h.write_overlay("plugins: [broken\n");
        let err = manager.reload(ReloadRequest::manual()).await.unwrap_err();
        assert!(matches!(err, CycleError::ConfigParse(_)));

        let after = manager.registry();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.generation, 1);
    }

    #[tokio::test]
    async fn test_missing_root_aborts_and_preserves_registry() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        let manager = h.manager();
        manager.reload(ReloadRequest::manual()).await.unwrap();
        let before = manager.registry();

        let root = h.root.path().to_path_buf();
        drop(h);
        assert!(!root.exists());

        let err = manager.reload(ReloadRequest::manual()).await.unwrap_err();
        assert!(matches!(err, CycleError::Discovery(_)));
        assert!(Arc::ptr_eq(&before, &manager.registry()));
    }

    #[tokio::test]
    async fn test_disable_marker_rename_retires_plugin() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        h.add_plugin("beta", Behavior::Ok, &["words"]);
        let manager = h.manager();
        manager.reload(ReloadRequest::manual()).await.unwrap();
        assert!(manager.registry().command("words").is_some());

        std::fs::rename(
            h.root.path().join("beta.plugin.yaml"),
            h.root.path().join("_beta.plugin.yaml"),
        )
        .unwrap();

        let outcome = manager
            .reload(ReloadRequest::file_change(vec![h
                .root
                .path()
                .join("_beta.plugin.yaml")]))
            .await
            .unwrap();
        assert_eq!(outcome.retired, vec!["beta"]);
        assert_eq!(h.shutdowns("beta"), 1);

        let registry = manager.registry();
        assert!(registry.record("beta").is_none());
        assert!(registry.command("words").is_none());
        assert!(registry.record("alpha").unwrap().is_active());
    }

    #[tokio::test]
    async fn test_changed_source_rebuilds_only_that_plugin() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        h.add_plugin("beta", Behavior::Ok, &["words"]);
        let manager = h.manager();
        manager.reload(ReloadRequest::manual()).await.unwrap();
        let alpha_before = manager.registry().record("alpha").unwrap().instance.clone();

        // Content change to beta's manifest only
        h.write_unit("beta", "description: changed for a rebuild\n");
        let outcome = manager
            .reload(ReloadRequest::file_change(vec![h
                .root
                .path()
                .join("beta.plugin.yaml")]))
            .await
            .unwrap();

        assert_eq!(outcome.carried, vec!["alpha"]);
        assert_eq!(outcome.activated, vec!["beta"]);
        assert_eq!(outcome.retired, vec!["beta"]);
        assert_eq!(h.inits("alpha"), 1);
        assert_eq!(h.inits("beta"), 2);
        assert_eq!(h.shutdowns("beta"), 1);

        let registry = manager.registry();
        let alpha_after = registry.record("alpha").unwrap();
        assert!(alpha_after.is_active());
        assert!(Arc::ptr_eq(
            alpha_before.as_ref().unwrap(),
            alpha_after.instance.as_ref().unwrap()
        ));
        assert_eq!(registry.command("ping").unwrap().plugin_name, "alpha");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_never_blocks_publication() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::HangShutdown, &["ping"]);
        h.write_overlay("settings:\n  shutdown-timeout-secs: 1\n");
        let manager = h.manager();
        manager.reload(ReloadRequest::manual()).await.unwrap();

        std::fs::rename(
            h.root.path().join("alpha.plugin.yaml"),
            h.root.path().join("_alpha.plugin.yaml"),
        )
        .unwrap();

        let outcome = manager.reload(ReloadRequest::manual()).await.unwrap();
        assert_eq!(outcome.retired, vec!["alpha"]);
        assert_eq!(outcome.generation, 2);
        assert!(manager.registry().record("alpha").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_reload_calls_are_serialized() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        let manager = h.manager();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let m = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                m.reload(ReloadRequest::manual()).await.map(|o| o.generation)
            }));
        }

        let mut generations: Vec<u64> = Vec::new();
        for handle in handles {
            generations.push(handle.await.unwrap().unwrap());
        }
        generations.sort_unstable();
        assert_eq!(generations, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_requests_coalesce_into_one_cycle() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        let manager = h.manager();

        // All three requests are already queued when the loop starts; they
        // must produce one cycle, not three.
        manager.request_reload(ReloadRequest::manual());
        manager.request_reload(ReloadRequest::file_change(vec![h
            .root
            .path()
            .join("alpha.plugin.yaml")]));
        manager.request_reload(ReloadRequest::config_change(vec![]));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_handle = tokio::spawn(Arc::clone(&manager).run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.registry().generation, 1);

        shutdown_tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_after_loop_start_triggers_cycle() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        let manager = h.manager();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_handle = tokio::spawn(Arc::clone(&manager).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.registry().generation, 0);

        manager.request_reload(ReloadRequest::manual());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.registry().generation, 1);
        assert!(manager.registry().record("alpha").unwrap().is_active());

        shutdown_tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_merge_accumulates_trigger_paths() {
        let mut request = ReloadRequest::file_change(vec![PathBuf::from("a")]);
        request.merge(ReloadRequest::file_change(vec![
            PathBuf::from("a"),
            PathBuf::from("b"),
        ]));
        assert_eq!(
            request.trigger_paths,
            vec![PathBuf::from("a"), PathBuf::from("b")]
        );
    }

    #[tokio::test]
    async fn test_shutdown_all_publishes_empty_registry() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["ping"]);
        let manager = h.manager();
        manager.reload(ReloadRequest::manual()).await.unwrap();

        manager.shutdown_all().await;
        assert_eq!(h.shutdowns("alpha"), 1);
        let registry = manager.registry();
        assert!(registry.records.is_empty());
        assert!(registry.commands.is_empty());
    }

    #[tokio::test]
    async fn test_builtin_command_names_denied_to_plugins() {
        let mut h = Harness::new();
        h.add_plugin("alpha", Behavior::Ok, &["help", "ping"]);
        let manager = h.manager();

        let outcome = manager.reload(ReloadRequest::manual()).await.unwrap();
        assert_eq!(outcome.conflicts, vec!["help"]);
        let registry = manager.registry();
        assert!(registry.command("help").is_none());
        assert!(registry.command("ping").is_some());
    }
}
