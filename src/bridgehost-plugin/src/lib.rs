pub mod api;
pub mod dummy;
pub mod manager;
pub mod server;

pub use api::{
    AccessoryConstructor, AccessoryPlugin, ApiError, HostApi, InternalApiEvent,
    PlatformConstructor, PlatformPlugin, Plugin,
};
pub use manager::{LoadedPlugin, PluginError, PluginManager, ResolveError, TypeKind};
pub use server::{Server, ServerError, ServerMode};

/// Plugins compiled into the host binary.
pub fn builtin_plugins() -> Vec<Box<dyn Plugin>> {
    vec![Box::new(dummy::DummyPlugin)]
}
