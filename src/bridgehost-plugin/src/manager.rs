use crate::api::{
    AccessoryConstructor, HostApi, InternalApiEvent, PlatformConstructor, Plugin,
};
use bridgehost_core::{plugin_span, PluginIdentifier, TypeIdentifier};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Accessory,
    Platform,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accessory => f.write_str("accessory"),
            Self::Platform => f.write_str("platform"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{identifier}' has an invalid identifier")]
    InvalidIdentifier { identifier: String },
    #[error("plugin '{identifier}' is already loaded")]
    DuplicatePlugin { identifier: PluginIdentifier },
    #[error("plugin '{plugin}' tried to register {kind} '{name}' which has already been registered")]
    DuplicateRegistration {
        plugin: PluginIdentifier,
        kind: TypeKind,
        name: String,
    },
    #[error("{kind} '{name}' was registered outside of plugin initialization")]
    RegistrationOutsideInit { kind: TypeKind, name: String },
    #[error("plugin '{identifier}' failed to initialize: {reason}")]
    Initialize {
        identifier: PluginIdentifier,
        reason: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no plugin '{plugin}' is loaded")]
    PluginNotFound { plugin: PluginIdentifier },
    #[error("no plugin registered {kind} '{identifier}'")]
    NotFound { kind: TypeKind, identifier: String },
    #[error("{kind} '{name}' is registered by several plugins ({}); use the full identifier", .plugins.join(", "))]
    Ambiguous {
        kind: TypeKind,
        name: String,
        plugins: Vec<String>,
    },
}

/// A loaded plugin and the types it registered.
pub struct LoadedPlugin {
    identifier: PluginIdentifier,
    accessories: HashMap<String, AccessoryConstructor>,
    platforms: HashMap<String, PlatformConstructor>,
}

impl LoadedPlugin {
    fn new(identifier: PluginIdentifier) -> Self {
        Self {
            identifier,
            accessories: HashMap::new(),
            platforms: HashMap::new(),
        }
    }

    pub fn identifier(&self) -> &PluginIdentifier {
        &self.identifier
    }

    pub fn accessory_names(&self) -> impl Iterator<Item = &str> {
        self.accessories.keys().map(String::as_str)
    }

    pub fn platform_names(&self) -> impl Iterator<Item = &str> {
        self.platforms.keys().map(String::as_str)
    }

    fn register_accessory(
        &mut self,
        name: String,
        constructor: AccessoryConstructor,
    ) -> Result<(), PluginError> {
        if self.accessories.contains_key(&name) {
            return Err(self.duplicate(TypeKind::Accessory, name));
        }
        tracing::debug!(plugin = %self.identifier, accessory = %name, "registered accessory");
        self.accessories.insert(name, constructor);
        Ok(())
    }

    fn register_platform(
        &mut self,
        name: String,
        constructor: PlatformConstructor,
    ) -> Result<(), PluginError> {
        if self.platforms.contains_key(&name) {
            return Err(self.duplicate(TypeKind::Platform, name));
        }
        tracing::debug!(plugin = %self.identifier, platform = %name, "registered platform");
        self.platforms.insert(name, constructor);
        Ok(())
    }

    fn duplicate(&self, kind: TypeKind, name: String) -> PluginError {
        PluginError::DuplicateRegistration {
            plugin: self.identifier.clone(),
            kind,
            name,
        }
    }
}

/// Loads plugins and resolves configured accessory and platform types to them.
#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<LoadedPlugin>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize each plugin in turn, attributing the registrations it makes.
    ///
    /// A plugin that fails is logged and skipped. Events that are not
    /// registrations are handed back for the host to process.
    pub fn load(
        &mut self,
        plugins: Vec<Box<dyn Plugin>>,
        api: &HostApi,
        events: &mut mpsc::UnboundedReceiver<InternalApiEvent>,
    ) -> Vec<InternalApiEvent> {
        let mut deferred = Vec::new();
        for plugin in plugins {
            if let Err(e) = self.load_one(plugin.as_ref(), api, events, &mut deferred) {
                tracing::error!(error = %e, "failed to load plugin");
            }
        }
        tracing::info!(plugins = self.plugins.len(), "plugins loaded");
        deferred
    }

    fn load_one(
        &mut self,
        plugin: &dyn Plugin,
        api: &HostApi,
        events: &mut mpsc::UnboundedReceiver<InternalApiEvent>,
        deferred: &mut Vec<InternalApiEvent>,
    ) -> Result<(), PluginError> {
        let identifier = PluginIdentifier::parse(plugin.identifier()).map_err(|_| {
            PluginError::InvalidIdentifier {
                identifier: plugin.identifier().to_string(),
            }
        })?;
        if self.is_loaded(&identifier) {
            return Err(PluginError::DuplicatePlugin { identifier });
        }

        let _span = plugin_span(identifier.as_str()).entered();
        let initialized = plugin.initialize(api);

        let mut loaded = LoadedPlugin::new(identifier.clone());
        while let Ok(event) = events.try_recv() {
            let result = match event {
                InternalApiEvent::RegisterAccessory {
                    name,
                    plugin,
                    constructor,
                } => {
                    warn_foreign(&identifier, plugin.as_ref(), &name);
                    loaded.register_accessory(name, constructor)
                }
                InternalApiEvent::RegisterPlatform {
                    name,
                    plugin,
                    constructor,
                } => {
                    warn_foreign(&identifier, plugin.as_ref(), &name);
                    loaded.register_platform(name, constructor)
                }
                other => {
                    deferred.push(other);
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "ignoring registration");
            }
        }

        if let Err(e) = initialized {
            return Err(PluginError::Initialize {
                identifier,
                reason: e.to_string(),
            });
        }
        tracing::info!(
            plugin = %identifier,
            accessories = loaded.accessories.len(),
            platforms = loaded.platforms.len(),
            "loaded plugin"
        );
        self.plugins.push(loaded);
        Ok(())
    }

    pub fn is_loaded(&self, identifier: &PluginIdentifier) -> bool {
        self.plugin(identifier).is_some()
    }

    pub fn plugin(&self, identifier: &PluginIdentifier) -> Option<&LoadedPlugin> {
        self.plugins.iter().find(|p| &p.identifier == identifier)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &LoadedPlugin> {
        self.plugins.iter()
    }

    pub fn accessory_constructor(
        &self,
        identifier: &TypeIdentifier,
    ) -> Result<(PluginIdentifier, AccessoryConstructor), ResolveError> {
        self.resolve(identifier, TypeKind::Accessory, |p| &p.accessories)
    }

    pub fn platform_constructor(
        &self,
        identifier: &TypeIdentifier,
    ) -> Result<(PluginIdentifier, PlatformConstructor), ResolveError> {
        self.resolve(identifier, TypeKind::Platform, |p| &p.platforms)
    }

    fn resolve<C, F>(
        &self,
        identifier: &TypeIdentifier,
        kind: TypeKind,
        table: F,
    ) -> Result<(PluginIdentifier, C), ResolveError>
    where
        C: Clone,
        F: Fn(&LoadedPlugin) -> &HashMap<String, C>,
    {
        let not_found = || ResolveError::NotFound {
            kind,
            identifier: identifier.to_string(),
        };
        match identifier {
            TypeIdentifier::Qualified { plugin, name } => {
                let loaded = self
                    .plugin(plugin)
                    .ok_or_else(|| ResolveError::PluginNotFound {
                        plugin: plugin.clone(),
                    })?;
                let constructor = table(loaded).get(name).ok_or_else(not_found)?;
                Ok((plugin.clone(), constructor.clone()))
            }
            TypeIdentifier::Bare(name) => {
                let mut matches = self
                    .plugins
                    .iter()
                    .filter_map(|p| table(p).get(name).map(|c| (p, c)));
                let (first, constructor) = matches.next().ok_or_else(not_found)?;
                let others: Vec<_> = matches.map(|(p, _)| p.identifier.to_string()).collect();
                if !others.is_empty() {
                    let mut plugins = vec![first.identifier.to_string()];
                    plugins.extend(others);
                    return Err(ResolveError::Ambiguous {
                        kind,
                        name: name.clone(),
                        plugins,
                    });
                }
                Ok((first.identifier.clone(), constructor.clone()))
            }
        }
    }
}

fn warn_foreign(current: &PluginIdentifier, claimed: Option<&PluginIdentifier>, name: &str) {
    if let Some(claimed) = claimed.filter(|claimed| *claimed != current) {
        tracing::warn!(
            plugin = %current,
            claimed = %claimed,
            name,
            "plugin registered a type under another plugin's identifier; using its own"
        );
    }
}

/// Registration events that arrive after loading cannot be attributed to a plugin.
pub fn reject_late_registration(event: &InternalApiEvent) -> Option<PluginError> {
    match event {
        InternalApiEvent::RegisterAccessory { name, .. } => Some(PluginError::RegistrationOutsideInit {
            kind: TypeKind::Accessory,
            name: name.clone(),
        }),
        InternalApiEvent::RegisterPlatform { name, .. } => Some(PluginError::RegistrationOutsideInit {
            kind: TypeKind::Platform,
            name: name.clone(),
        }),
        _ => None,
    }
}
