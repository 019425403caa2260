//! Fakes shared by the supervisor and process tests.

use crate::process::{BridgeLauncher, LaunchError, LaunchedProcess, ProcessEvent};
use crate::protocol::{ChildControl, ChildReady, ChildReport};
use async_trait::async_trait;
use bridgehost_core::{BridgeUsername, BridgedKind, ChildBridgeEntry};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

/// How a fake child behaves once launched.
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    /// Report ready after the delay, exit cleanly on shutdown.
    Ready(Duration),
    /// Never report ready.
    Silent,
    /// Refuse to spawn at all.
    FailSpawn,
    /// Report ready, then exit with an error after the delay.
    CrashAfter(Duration),
    /// Report ready but ignore shutdown requests.
    Stubborn,
    /// Report ready, then answer a shutdown request with metadata before exiting.
    ReportOnShutdown,
}

#[derive(Default)]
struct Counters {
    live: HashMap<BridgeUsername, usize>,
    max_live: HashMap<BridgeUsername, usize>,
}

#[derive(Clone)]
pub struct FakeLauncher {
    default: Behaviour,
    overrides: Arc<Mutex<HashMap<BridgeUsername, Behaviour>>>,
    counters: Arc<Mutex<Counters>>,
    launches: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(default: Behaviour) -> Self {
        Self {
            default,
            overrides: Arc::default(),
            counters: Arc::default(),
            launches: Arc::default(),
        }
    }

    pub fn set_behaviour(&self, username: &BridgeUsername, behaviour: Behaviour) {
        self.overrides
            .lock()
            .unwrap()
            .insert(username.clone(), behaviour);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn live(&self, username: &BridgeUsername) -> usize {
        self.counters
            .lock()
            .unwrap()
            .live
            .get(username)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_live(&self, username: &BridgeUsername) -> usize {
        self.counters
            .lock()
            .unwrap()
            .max_live
            .get(username)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl BridgeLauncher for FakeLauncher {
    async fn launch(&self, bridge: &ChildBridgeEntry) -> Result<LaunchedProcess, LaunchError> {
        let behaviour = self
            .overrides
            .lock()
            .unwrap()
            .get(&bridge.username)
            .copied()
            .unwrap_or(self.default);
        if let Behaviour::FailSpawn = behaviour {
            return Err(LaunchError::Spawn {
                program: PathBuf::from("fake-child"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"),
            });
        }

        let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut counters = self.counters.lock().unwrap();
            let live = counters.live.entry(bridge.username.clone()).or_insert(0);
            *live += 1;
            let live = *live;
            let max = counters.max_live.entry(bridge.username.clone()).or_insert(0);
            *max = (*max).max(live);
        }

        let (handle, mut control, events, mut kill) = LaunchedProcess::channels(Some(launch as u32));
        let counters = self.counters.clone();
        let username = bridge.username.clone();
        tokio::spawn(async move {
            let ready_after = match behaviour {
                Behaviour::Ready(delay) => Some(delay),
                Behaviour::CrashAfter(_) | Behaviour::Stubborn | Behaviour::ReportOnShutdown => {
                    Some(Duration::ZERO)
                }
                Behaviour::Silent | Behaviour::FailSpawn => None,
            };
            if let Some(delay) = ready_after {
                tokio::time::sleep(delay).await;
                let _ = events
                    .send(ProcessEvent::Report(ChildReport::Ready(ChildReady::default())))
                    .await;
            }
            let _ = events.send(ProcessEvent::Stderr("fake child up".into())).await;

            let crash = async {
                match behaviour {
                    Behaviour::CrashAfter(delay) => tokio::time::sleep(delay).await,
                    _ => std::future::pending().await,
                }
            };
            tokio::pin!(crash);

            let code = loop {
                tokio::select! {
                    message = control.recv() => match message {
                        Some(ChildControl::Shutdown) if matches!(behaviour, Behaviour::ReportOnShutdown) => {
                            let mut reported = serde_json::Map::new();
                            reported.insert("launch".into(), launch.into());
                            let _ = events
                                .send(ProcessEvent::Report(ChildReport::MetadataResponse(reported)))
                                .await;
                            break Some(0);
                        }
                        Some(ChildControl::Shutdown) if !matches!(behaviour, Behaviour::Stubborn) => break Some(0),
                        Some(ChildControl::Shutdown) => continue,
                        Some(ChildControl::MetadataRequest) => {
                            let mut reported = serde_json::Map::new();
                            reported.insert("launch".into(), launch.into());
                            let _ = events
                                .send(ProcessEvent::Report(ChildReport::MetadataResponse(reported)))
                                .await;
                        }
                        None => break None,
                    },
                    _ = &mut kill => break None,
                    _ = &mut crash => break Some(1),
                }
            };

            if let Some(live) = counters.lock().unwrap().live.get_mut(&username) {
                *live -= 1;
            }
            let _ = events.send(ProcessEvent::Exited { code }).await;
        });

        Ok(handle)
    }
}

pub fn entry(username: &str, name: &str) -> ChildBridgeEntry {
    ChildBridgeEntry {
        username: BridgeUsername::parse(username).unwrap(),
        name: name.into(),
        kind: BridgedKind::Platform,
        identifier: format!("homebridge-{}.Platform", name.to_lowercase()),
    }
}

/// Shell script that speaks the child side of the control protocol.
#[cfg(unix)]
pub fn create_test_child_script() -> tempfile::TempPath {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"#!/bin/bash
echo "booting" >&2
echo '{{"id":"ready","data":{{"accessories":2}}}}'
while IFS= read -r line; do
    case "$line" in
        *metadataRequest*) echo '{{"id":"metadataResponse","data":{{"plugin":"homebridge-test"}}}}' ;;
        *shutdown*) exit 0 ;;
    esac
done
"#
    )
    .unwrap();
    file.flush().unwrap();

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

    file.into_temp_path()
}
