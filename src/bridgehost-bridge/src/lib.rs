//! Control plane for bridgehost: the `{id, data}` control channel, the
//! optional link to a parent process, and supervision of child bridge
//! processes.

pub mod channel;
pub mod child;
pub mod process;
pub mod protocol;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use channel::{
    detect_parent_channel, has_parent, listen, listen_to_parent, NoopParentChannel, ParentChannel,
    StreamParentChannel,
};
pub use child::{ChildBridgeRuntime, ChildExit};
pub use process::{BridgeLauncher, LaunchError, LaunchedProcess, ProcessEvent, ProcessLauncher};
pub use protocol::{
    ChildBridgeMetadata, ChildBridgeStatus, ChildControl, ChildReady, ChildReport, IpcIncomingEvent,
    IpcMessage, IpcOutgoingEvent, ServerStatus, ServerStatusUpdate,
};
pub use supervisor::{ChildBridgeSupervisor, SupervisorError, SupervisorSettings};
