//! The child side of a child bridge: report readiness, answer metadata
//! requests, and leave when the supervisor says so.

use crate::channel::ParentChannel;
use crate::protocol::{ChildControl, ChildReady, ChildReport};
use bridgehost_core::BridgeUsername;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why [`ChildBridgeRuntime::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    ShutdownRequested,
    /// The control stream closed; the supervisor is gone.
    ParentGone,
}

pub struct ChildBridgeRuntime {
    username: BridgeUsername,
    parent: Arc<dyn ParentChannel>,
}

impl ChildBridgeRuntime {
    pub fn new(username: BridgeUsername, parent: Arc<dyn ParentChannel>) -> Self {
        Self { username, parent }
    }

    pub fn username(&self) -> &BridgeUsername {
        &self.username
    }

    pub fn report_ready(&self, accessories: usize) {
        tracing::info!(username = %self.username, accessories, "child bridge ready");
        self.parent.send(&ChildReport::Ready(ChildReady {
            version: Some(bridgehost_core::version().to_string()),
            accessories,
        }));
    }

    /// Handle control messages until shutdown or until the supervisor disappears.
    pub async fn serve<F>(
        &self,
        mut controls: mpsc::UnboundedReceiver<ChildControl>,
        metadata: F,
    ) -> ChildExit
    where
        F: Fn() -> Map<String, Value>,
    {
        while let Some(control) = controls.recv().await {
            if let Some(exit) = self.handle(control, &metadata) {
                return exit;
            }
        }
        self.parent_gone()
    }

    /// Act on one control message; `Some` means the child should exit.
    pub fn handle<F>(&self, control: ChildControl, metadata: F) -> Option<ChildExit>
    where
        F: FnOnce() -> Map<String, Value>,
    {
        match control {
            ChildControl::MetadataRequest => {
                tracing::debug!(username = %self.username, "answering metadata request");
                self.parent.send(&ChildReport::MetadataResponse(metadata()));
                None
            }
            ChildControl::Shutdown => {
                tracing::info!(username = %self.username, "shutdown requested");
                Some(ChildExit::ShutdownRequested)
            }
        }
    }

    pub fn parent_gone(&self) -> ChildExit {
        tracing::warn!(username = %self.username, "control channel closed");
        ChildExit::ParentGone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamParentChannel;
    use crate::protocol::IpcMessage;
    use serde_json::json;

    fn runtime() -> (ChildBridgeRuntime, mpsc::UnboundedReceiver<IpcMessage>) {
        let (parent, outbound) = StreamParentChannel::queued();
        let username = BridgeUsername::parse("0E:80:9C:B4:E4:C5").unwrap();
        (ChildBridgeRuntime::new(username, Arc::new(parent)), outbound)
    }

    #[tokio::test]
    async fn ready_report_carries_accessory_count() {
        let (runtime, mut outbound) = runtime();
        runtime.report_ready(3);

        let message = outbound.recv().await.unwrap();
        assert_eq!(message.id, "ready");
        assert_eq!(message.data["accessories"], 3);
        assert_eq!(message.data["version"], json!(bridgehost_core::version()));
    }

    #[tokio::test]
    async fn answers_metadata_then_stops() {
        let (runtime, mut outbound) = runtime();
        let (controls, controls_rx) = mpsc::unbounded_channel();
        controls.send(ChildControl::MetadataRequest).unwrap();
        controls.send(ChildControl::Shutdown).unwrap();
        controls.send(ChildControl::MetadataRequest).unwrap();

        let exit = runtime
            .serve(controls_rx, || {
                let mut reported = Map::new();
                reported.insert("plugin".into(), json!("homebridge-test"));
                reported
            })
            .await;
        assert_eq!(exit, ChildExit::ShutdownRequested);

        let response = outbound.recv().await.unwrap();
        assert_eq!(response.id, "metadataResponse");
        assert_eq!(response.data["plugin"], "homebridge-test");
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_controls_mean_parent_gone() {
        let (runtime, _outbound) = runtime();
        let (controls, controls_rx) = mpsc::unbounded_channel::<ChildControl>();
        drop(controls);
        assert_eq!(runtime.serve(controls_rx, Map::new).await, ChildExit::ParentGone);
    }
}
