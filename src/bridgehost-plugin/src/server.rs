//! The host process for one bridge.
//!
//! A [`Server`] loads plugins, instantiates the accessories and platforms
//! configured for its bridge, restores that bridge's cache partition and then
//! applies plugin requests as they arrive. The main bridge additionally
//! supervises the configured child bridges and talks to an operator process
//! over the parent channel.

use crate::api::{AccessoryPlugin, HostApi, InternalApiEvent, PlatformPlugin, Plugin};
use crate::manager::{reject_late_registration, PluginManager, ResolveError};
use bridgehost_accessory::{
    generate_uuid, AccessoryCache, AccessoryError, AccessoryFactory, AccessoryRegistry,
    PlatformAccessory, RegistryError,
};
use bridgehost_bridge::{
    BridgeLauncher, ChildBridgeMetadata, ChildBridgeRuntime, ChildBridgeSupervisor, ChildControl,
    ChildExit, IpcIncomingEvent, IpcOutgoingEvent, ParentChannel, ServerStatus,
    ServerStatusUpdate, SupervisorSettings,
};
use bridgehost_core::{
    plugin_span, AccessoryEntry, BridgeUsername, Config, IdentifierError, PlatformEntry,
    PluginIdentifier, StorageError, StorageRoot, TypeIdentifier, ValidationError,
};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMode {
    Main,
    /// Runs only what is configured for this child bridge.
    Child(BridgeUsername),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("no child bridge with username {username} is configured")]
    UnknownChildBridge { username: BridgeUsername },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Why a configured accessory or platform could not be loaded.
#[derive(Debug, Error)]
enum LoadError {
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Accessory(#[from] AccessoryError),
}

struct ActivePlatform {
    plugin: PluginIdentifier,
    platform: String,
    instance: Box<dyn PlatformPlugin>,
}

impl ActivePlatform {
    fn claims(&self, accessory: &PlatformAccessory) -> bool {
        accessory.associated_plugin() == Some(&self.plugin)
            && accessory.associated_platform() == Some(self.platform.as_str())
    }
}

pub struct Server {
    config: Config,
    mode: ServerMode,
    name: String,
    username: BridgeUsername,
    api: HostApi,
    events: mpsc::UnboundedReceiver<InternalApiEvent>,
    factory: Arc<dyn AccessoryFactory>,
    manager: PluginManager,
    registry: AccessoryRegistry,
    parent: Arc<dyn ParentChannel>,
    launcher: Option<Arc<dyn BridgeLauncher>>,
    supervisor: Option<ChildBridgeSupervisor>,
    platforms: Vec<ActivePlatform>,
    /// Accessories built from accessory plugins. Rebuilt every start, never cached.
    bridged: Vec<PlatformAccessory>,
    external: Vec<PlatformAccessory>,
}

impl Server {
    pub fn new(
        config: Config,
        storage: &StorageRoot,
        mode: ServerMode,
        factory: Arc<dyn AccessoryFactory>,
        parent: Arc<dyn ParentChannel>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let (name, username) = match &mode {
            ServerMode::Main => (config.bridge.name.clone(), config.bridge.username.clone()),
            ServerMode::Child(username) => {
                let entry = config
                    .child_bridges()
                    .into_iter()
                    .find(|bridge| &bridge.username == username)
                    .ok_or_else(|| ServerError::UnknownChildBridge {
                        username: username.clone(),
                    })?;
                (entry.name, entry.username)
            }
        };

        let cache_dir = storage.cached_accessory_path()?;
        let cache = match &mode {
            ServerMode::Main => AccessoryCache::main_bridge(&cache_dir),
            ServerMode::Child(username) => AccessoryCache::child_bridge(&cache_dir, username),
        };
        let (api, events) = HostApi::new(factory.clone());

        Ok(Self {
            registry: AccessoryRegistry::new(cache, factory.clone()),
            config,
            mode,
            name,
            username,
            api,
            events,
            factory,
            manager: PluginManager::new(),
            parent,
            launcher: None,
            supervisor: None,
            platforms: Vec::new(),
            bridged: Vec::new(),
            external: Vec::new(),
        })
    }

    /// Run configured child bridges with `launcher`. Only used by the main bridge.
    pub fn with_launcher(mut self, launcher: Arc<dyn BridgeLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn api(&self) -> &HostApi {
        &self.api
    }

    pub fn registry(&self) -> &AccessoryRegistry {
        &self.registry
    }

    pub fn bridged_accessories(&self) -> &[PlatformAccessory] {
        &self.bridged
    }

    pub fn external_accessories(&self) -> &[PlatformAccessory] {
        &self.external
    }

    pub fn supervisor(&self) -> Option<&ChildBridgeSupervisor> {
        self.supervisor.as_ref()
    }

    pub fn username(&self) -> &BridgeUsername {
        &self.username
    }

    pub fn accessory_count(&self) -> usize {
        self.bridged.len() + self.registry.len() + self.external.len()
    }

    pub async fn start(&mut self, plugins: Vec<Box<dyn Plugin>>) -> Result<(), ServerError> {
        self.send_status(ServerStatus::Pending);
        tracing::info!(
            bridge = %self.name,
            username = %self.username,
            version = bridgehost_core::version(),
            "starting"
        );

        let deferred = self.manager.load(plugins, &self.api, &mut self.events);
        self.registry.restore()?;

        self.load_accessories();
        self.load_platforms();
        self.configure_cached_accessories();
        for platform in &mut self.platforms {
            let _span = plugin_span(platform.plugin.as_str()).entered();
            platform.instance.did_finish_launching();
        }

        for event in deferred {
            self.handle_event(event);
        }
        self.drain_events();

        let platforms = &self.platforms;
        self.registry.prune_orphans(
            |accessory| platforms.iter().any(|p| p.claims(accessory)),
            self.config.keep_orphans,
        )?;

        if self.mode == ServerMode::Main {
            self.start_child_bridges();
        }

        tracing::info!(
            accessories = self.accessory_count(),
            platforms = self.platforms.len(),
            "bridge is running"
        );
        self.send_status(ServerStatus::Ok);
        Ok(())
    }

    /// Serve the main bridge until `shutdown` resolves.
    pub async fn run<S>(&mut self, mut inbound: mpsc::UnboundedReceiver<IpcIncomingEvent>, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut inbound_open = true;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                message = inbound.recv(), if inbound_open => match message {
                    Some(event) => self.handle_ipc_event(event),
                    None => {
                        tracing::debug!("parent channel closed");
                        inbound_open = false;
                    }
                },
            }
        }
    }

    /// Serve a child bridge: report ready, then answer the supervisor until told to stop.
    pub async fn serve_child(&mut self, mut controls: mpsc::UnboundedReceiver<ChildControl>) -> ChildExit {
        let runtime = ChildBridgeRuntime::new(self.username.clone(), self.parent.clone());
        runtime.report_ready(self.accessory_count());
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
                control = controls.recv() => match control {
                    Some(control) => {
                        if let Some(exit) = runtime.handle(control, || self.child_metadata()) {
                            return exit;
                        }
                    }
                    None => return runtime.parent_gone(),
                },
            }
        }
    }

    pub async fn shutdown(mut self) {
        for platform in &mut self.platforms {
            let _span = plugin_span(platform.plugin.as_str()).entered();
            platform.instance.shutdown();
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.shutdown().await;
        }
        if let Err(e) = self.registry.save() {
            tracing::error!(error = %e, "failed to save accessory cache");
        }
        self.send_status(ServerStatus::Down);
        tracing::info!(bridge = %self.name, "stopped");
    }

    fn handle_ipc_event(&self, event: IpcIncomingEvent) {
        match &self.supervisor {
            Some(supervisor) => supervisor.handle_ipc_event(event),
            None => match event {
                IpcIncomingEvent::ChildBridgeMetadataRequest => {
                    self.parent.send(&IpcOutgoingEvent::ChildBridgeMetadataResponse(
                        Vec::<ChildBridgeMetadata>::new(),
                    ));
                }
                other => tracing::warn!(event = ?other, "no child bridges are running"),
            },
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: InternalApiEvent) {
        if let Some(e) = reject_late_registration(&event) {
            tracing::error!(error = %e, "ignoring registration");
            return;
        }
        let name = event.name();
        let result = match event {
            InternalApiEvent::PublishExternalAccessories {
                plugin,
                accessories,
            } => {
                self.publish_external(&plugin, accessories);
                Ok(())
            }
            InternalApiEvent::RegisterPlatformAccessories {
                plugin,
                platform,
                accessories,
            } => self.registry.register(&plugin, &platform, accessories),
            InternalApiEvent::UpdatePlatformAccessories(accessories) => {
                self.registry.update(accessories)
            }
            InternalApiEvent::UnregisterPlatformAccessories {
                plugin,
                platform,
                uuids,
            } => self.registry.unregister(&uuids).map(|removed| {
                tracing::info!(
                    plugin = %plugin,
                    platform = %platform,
                    removed = removed.len(),
                    "unregistered platform accessories"
                );
            }),
            InternalApiEvent::RegisterAccessory { .. } | InternalApiEvent::RegisterPlatform { .. } => {
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::error!(error = %e, event = name, "failed to apply plugin request");
        }
    }

    fn publish_external(&mut self, plugin: &PluginIdentifier, accessories: Vec<PlatformAccessory>) {
        for accessory in accessories {
            let taken = self
                .external
                .iter()
                .any(|existing| existing.uuid() == accessory.uuid())
                || self.registry.get(accessory.uuid()).is_some();
            if taken {
                tracing::warn!(
                    plugin = %plugin,
                    uuid = %accessory.uuid(),
                    "external accessory is already published"
                );
                continue;
            }
            tracing::info!(
                plugin = %plugin,
                name = %accessory.display_name(),
                category = accessory.category().0,
                "publishing external accessory"
            );
            self.external.push(accessory);
        }
    }

    fn belongs_here(&self, bridge: Option<&BridgeUsername>) -> bool {
        match &self.mode {
            ServerMode::Main => bridge.is_none(),
            ServerMode::Child(username) => bridge == Some(username),
        }
    }

    fn load_accessories(&mut self) {
        let entries: Vec<AccessoryEntry> = self
            .config
            .accessories
            .iter()
            .filter(|entry| self.belongs_here(entry.bridge.as_ref().map(|b| &b.username)))
            .cloned()
            .collect();
        for entry in &entries {
            if let Err(e) = self.load_accessory(entry) {
                tracing::error!(
                    accessory = %entry.accessory,
                    error = %e,
                    "skipping accessory; make sure the plugin providing it is loaded"
                );
            }
        }
    }

    fn load_accessory(&mut self, entry: &AccessoryEntry) -> Result<(), LoadError> {
        let identifier = TypeIdentifier::parse(&entry.accessory)?;
        let (plugin, constructor) = self.manager.accessory_constructor(&identifier)?;
        let display_name = entry
            .name
            .clone()
            .unwrap_or_else(|| identifier.name().to_string());

        let span = plugin_span(&display_name);
        let _entered = span.enter();
        let instance = constructor(entry, &self.api);

        let uuid = generate_uuid(format!("{plugin}.{}:{display_name}", identifier.name()));
        let mut accessory =
            PlatformAccessory::new(self.factory.as_ref(), &display_name, &uuid, None)?;
        for service in instance.services() {
            if let Err(e) = accessory.add_service(service) {
                tracing::warn!(error = %e, "skipping service");
            }
        }
        accessory.associate(plugin, None);
        forward_identify(accessory.subscribe_identify(), instance);

        tracing::info!(name = %display_name, uuid = %accessory.uuid(), "loaded accessory");
        self.bridged.push(accessory);
        Ok(())
    }

    fn load_platforms(&mut self) {
        let entries: Vec<PlatformEntry> = self
            .config
            .platforms
            .iter()
            .filter(|entry| self.belongs_here(entry.bridge.as_ref().map(|b| &b.username)))
            .cloned()
            .collect();
        for entry in &entries {
            if let Err(e) = self.load_platform(entry) {
                tracing::error!(
                    platform = %entry.platform,
                    error = %e,
                    "skipping platform; make sure the plugin providing it is loaded"
                );
            }
        }
    }

    fn load_platform(&mut self, entry: &PlatformEntry) -> Result<(), LoadError> {
        let identifier = TypeIdentifier::parse(&entry.platform)?;
        let (plugin, constructor) = self.manager.platform_constructor(&identifier)?;

        let _span = plugin_span(entry.name.as_deref().unwrap_or(identifier.name())).entered();
        let instance = constructor(entry, &self.api);
        tracing::info!(plugin = %plugin, platform = identifier.name(), "loaded platform");

        self.platforms.push(ActivePlatform {
            plugin,
            platform: identifier.name().to_string(),
            instance,
        });
        Ok(())
    }

    /// Hand every cached accessory to the platform that owns it.
    fn configure_cached_accessories(&mut self) {
        for accessory in self.registry.iter() {
            match self.platforms.iter_mut().find(|p| p.claims(accessory)) {
                Some(platform) => {
                    let _span = plugin_span(platform.plugin.as_str()).entered();
                    platform.instance.configure_accessory(accessory);
                }
                None => tracing::warn!(
                    name = %accessory.display_name(),
                    platform = ?accessory.associated_platform(),
                    "no loaded platform for cached accessory"
                ),
            }
        }
    }

    fn start_child_bridges(&mut self) {
        let bridges = self.config.child_bridges();
        if bridges.is_empty() {
            return;
        }
        let Some(launcher) = self.launcher.clone() else {
            tracing::warn!(count = bridges.len(), "child bridges are configured but cannot be launched");
            return;
        };

        let mut supervisor = ChildBridgeSupervisor::new(
            launcher,
            self.parent.clone(),
            SupervisorSettings::from(&self.config.supervisor),
        );
        for bridge in bridges {
            if let Err(e) = supervisor.add_bridge(bridge) {
                tracing::error!(error = %e, "skipping child bridge");
            }
        }
        supervisor.start_all();
        self.supervisor = Some(supervisor);
    }

    fn child_metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("name".into(), Value::String(self.name.clone()));
        metadata.insert("username".into(), Value::String(self.username.to_string()));
        metadata.insert("accessories".into(), Value::from(self.accessory_count()));
        metadata.insert(
            "plugins".into(),
            self.manager
                .plugins()
                .map(|p| Value::String(p.identifier().to_string()))
                .collect(),
        );
        metadata.insert(
            "version".into(),
            Value::String(bridgehost_core::version().to_string()),
        );
        metadata
    }

    fn send_status(&self, status: ServerStatus) {
        if self.mode != ServerMode::Main {
            return;
        }
        self.parent
            .send(&IpcOutgoingEvent::ServerStatusUpdate(ServerStatusUpdate {
                status,
                name: self.name.clone(),
                username: self.username.clone(),
                version: bridgehost_core::version().to_string(),
            }));
    }
}

/// Call the plugin's identify hook for every identify request on the accessory.
fn forward_identify(mut requests: broadcast::Receiver<()>, instance: Box<dyn AccessoryPlugin>) {
    tokio::spawn(async move {
        loop {
            match requests.recv().await {
                Ok(()) => instance.identify(),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
