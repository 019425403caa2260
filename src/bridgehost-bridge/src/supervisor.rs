//! Child bridge supervision.
//!
//! Each child bridge is owned by its own actor task. Lifecycle requests for a
//! bridge are queued to its actor and run one at a time, to completion, so a
//! restart can never overlap two processes for the same identity. Different
//! bridges run fully in parallel.

use crate::channel::ParentChannel;
use crate::process::{BridgeLauncher, ProcessEvent};
use crate::protocol::{
    ChildBridgeMetadata, ChildBridgeStatus, ChildControl, ChildReport, IpcIncomingEvent,
    IpcOutgoingEvent,
};
use bridgehost_core::{plugin_span, BridgeUsername, ChildBridgeEntry, SupervisorConfig};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::Instrument;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown child bridge {username}")]
    UnknownBridge { username: String },
    #[error("child bridge {username} is already supervised")]
    DuplicateBridge { username: BridgeUsername },
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub ready_timeout: Duration,
    pub shutdown_grace: Duration,
    pub restart_delay: Duration,
    pub max_restarts: u32,
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            ready_timeout: config.ready_timeout(),
            shutdown_grace: config.shutdown_grace(),
            restart_delay: config.restart_delay(),
            max_restarts: config.max_restarts,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

type StatusTable = Arc<RwLock<HashMap<BridgeUsername, ChildBridgeMetadata>>>;

#[derive(Debug)]
enum Command {
    Start,
    Stop,
    Restart,
    RequestMetadata,
    AutoRestart { generation: u64 },
    Shutdown(oneshot::Sender<()>),
}

struct BridgeHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

pub struct ChildBridgeSupervisor {
    bridges: HashMap<BridgeUsername, BridgeHandle>,
    table: StatusTable,
    updates: broadcast::Sender<ChildBridgeMetadata>,
    launcher: Arc<dyn BridgeLauncher>,
    parent: Arc<dyn ParentChannel>,
    settings: SupervisorSettings,
}

impl ChildBridgeSupervisor {
    pub fn new(
        launcher: Arc<dyn BridgeLauncher>,
        parent: Arc<dyn ParentChannel>,
        settings: SupervisorSettings,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            bridges: HashMap::new(),
            table: Arc::default(),
            updates,
            launcher,
            parent,
            settings,
        }
    }

    /// Put a bridge under supervision in the `stopped` state.
    pub fn add_bridge(&mut self, entry: ChildBridgeEntry) -> Result<(), SupervisorError> {
        if self.bridges.contains_key(&entry.username) {
            return Err(SupervisorError::DuplicateBridge {
                username: entry.username,
            });
        }

        let metadata = ChildBridgeMetadata {
            username: entry.username.clone(),
            name: entry.name.clone(),
            kind: entry.kind,
            identifier: entry.identifier.clone(),
            status: ChildBridgeStatus::Stopped,
            pid: None,
            restart_count: 0,
            manually_stopped: false,
            failure_reason: None,
            reported: Map::new(),
        };
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.username.clone(), metadata.clone());

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let span = plugin_span(&entry.name);
        let username = entry.username.clone();
        let actor = BridgeActor {
            entry,
            metadata,
            process: None,
            generation: 0,
            commands: commands.downgrade(),
            table: self.table.clone(),
            updates: self.updates.clone(),
            launcher: self.launcher.clone(),
            parent: self.parent.clone(),
            settings: self.settings.clone(),
        };
        let task = tokio::spawn(actor.run(commands_rx).instrument(span));
        self.bridges.insert(username, BridgeHandle { commands, task });
        Ok(())
    }

    pub fn start(&self, username: &str) -> Result<(), SupervisorError> {
        self.enqueue(username, Command::Start)
    }

    pub fn stop(&self, username: &str) -> Result<(), SupervisorError> {
        self.enqueue(username, Command::Stop)
    }

    pub fn restart(&self, username: &str) -> Result<(), SupervisorError> {
        self.enqueue(username, Command::Restart)
    }

    /// Ask a running child for fresh metadata; the answer is merged when it arrives.
    pub fn request_metadata(&self, username: &str) -> Result<(), SupervisorError> {
        self.enqueue(username, Command::RequestMetadata)
    }

    pub fn start_all(&self) {
        for handle in self.bridges.values() {
            let _ = handle.commands.send(Command::Start);
        }
    }

    pub fn request_metadata_all(&self) {
        for handle in self.bridges.values() {
            let _ = handle.commands.send(Command::RequestMetadata);
        }
    }

    fn enqueue(&self, username: &str, command: Command) -> Result<(), SupervisorError> {
        let unknown = || SupervisorError::UnknownBridge {
            username: username.to_string(),
        };
        let key = BridgeUsername::parse(username).map_err(|_| unknown())?;
        let handle = self.bridges.get(&key).ok_or_else(unknown)?;
        handle.commands.send(command).map_err(|_| unknown())
    }

    pub fn status(&self, username: &str) -> Option<ChildBridgeStatus> {
        self.bridge_metadata(username).map(|m| m.status)
    }

    pub fn bridge_metadata(&self, username: &str) -> Option<ChildBridgeMetadata> {
        let key = BridgeUsername::parse(username).ok()?;
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Snapshot of every supervised bridge, ordered by username.
    pub fn metadata(&self) -> Vec<ChildBridgeMetadata> {
        let mut all: Vec<_> = self
            .table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        all
    }

    /// Every status change and metadata merge, as it happens.
    pub fn subscribe(&self) -> broadcast::Receiver<ChildBridgeMetadata> {
        self.updates.subscribe()
    }

    /// Act on a request from the operator process. Unknown bridges are logged, not fatal.
    pub fn handle_ipc_event(&self, event: IpcIncomingEvent) {
        let result = match &event {
            IpcIncomingEvent::RestartChildBridge(username) => self.restart(username),
            IpcIncomingEvent::StopChildBridge(username) => self.stop(username),
            IpcIncomingEvent::StartChildBridge(username) => self.start(username),
            IpcIncomingEvent::ChildBridgeMetadataRequest => {
                self.parent
                    .send(&IpcOutgoingEvent::ChildBridgeMetadataResponse(self.metadata()));
                self.request_metadata_all();
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, event = ?event, "ignoring child bridge request");
        }
    }

    /// Stop every bridge and wait for the actors to finish.
    pub async fn shutdown(self) {
        let mut pending = Vec::with_capacity(self.bridges.len());
        for (username, handle) in self.bridges {
            let (ack_tx, ack_rx) = oneshot::channel();
            if handle.commands.send(Command::Shutdown(ack_tx)).is_ok() {
                pending.push((username, ack_rx, handle.task));
            }
        }
        for (username, ack, task) in pending {
            let _ = ack.await;
            if let Err(e) = task.await {
                tracing::warn!(username = %username, error = %e, "child bridge actor failed");
            }
        }
    }
}

/// The process currently owned by an actor.
struct ActiveProcess {
    control: mpsc::UnboundedSender<ChildControl>,
    events: mpsc::Receiver<ProcessEvent>,
    kill: Option<oneshot::Sender<()>>,
}

struct BridgeActor {
    entry: ChildBridgeEntry,
    metadata: ChildBridgeMetadata,
    process: Option<ActiveProcess>,
    /// Bumped on every launch so a stale auto-restart can be recognised.
    generation: u64,
    commands: mpsc::WeakUnboundedSender<Command>,
    table: StatusTable,
    updates: broadcast::Sender<ChildBridgeMetadata>,
    launcher: Arc<dyn BridgeLauncher>,
    parent: Arc<dyn ParentChannel>,
    settings: SupervisorSettings,
}

impl BridgeActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if let Command::Shutdown(ack) = command {
                        self.stop(false).await;
                        let _ = ack.send(());
                        break;
                    }
                    self.handle(command).await;
                }
                event = next_event(&mut self.process) => self.on_event(event),
            }
        }
        tracing::debug!(username = %self.entry.username, "child bridge actor finished");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start => self.start().await,
            Command::Stop => self.stop(true).await,
            Command::Restart => self.restart().await,
            Command::RequestMetadata => self.request_metadata(),
            Command::AutoRestart { generation } => {
                if generation == self.generation
                    && self.metadata.status == ChildBridgeStatus::Crashed
                    && !self.metadata.manually_stopped
                {
                    self.metadata.restart_count += 1;
                    tracing::info!(
                        username = %self.entry.username,
                        attempt = self.metadata.restart_count,
                        "restarting crashed child bridge"
                    );
                    self.launch().await;
                }
            }
            Command::Shutdown(_) => {}
        }
    }

    async fn start(&mut self) {
        if !self.metadata.status.can_start() {
            tracing::warn!(
                username = %self.entry.username,
                status = %self.metadata.status,
                "ignoring start request"
            );
            return;
        }
        self.metadata.manually_stopped = false;
        self.metadata.restart_count = 0;
        self.launch().await;
    }

    async fn restart(&mut self) {
        if matches!(
            self.metadata.status,
            ChildBridgeStatus::Starting | ChildBridgeStatus::Running
        ) {
            self.stop(false).await;
        }
        self.start().await;
    }

    /// Spawn the process and hold the queue until it is ready or has failed.
    async fn launch(&mut self) {
        self.generation += 1;
        self.metadata.failure_reason = None;
        self.metadata.reported.clear();

        let launched = match self.launcher.launch(&self.entry).await {
            Ok(launched) => launched,
            Err(e) => {
                tracing::error!(username = %self.entry.username, error = %e, "failed to launch child bridge");
                self.crash(e.to_string());
                return;
            }
        };
        self.metadata.pid = launched.pid;
        self.process = Some(ActiveProcess {
            control: launched.control,
            events: launched.events,
            kill: Some(launched.kill),
        });
        self.transition(ChildBridgeStatus::Starting);

        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, next_event(&mut self.process)).await {
                Ok(event) => event,
                Err(_) => {
                    tracing::warn!(
                        username = %self.entry.username,
                        timeout = ?self.settings.ready_timeout,
                        "child bridge did not report ready in time"
                    );
                    self.kill_process().await;
                    self.crash(format!(
                        "did not become ready within {:?}",
                        self.settings.ready_timeout
                    ));
                    return;
                }
            };
            match event {
                ProcessEvent::Report(ChildReport::Ready(ready)) => {
                    self.metadata
                        .reported
                        .insert("accessories".into(), Value::from(ready.accessories));
                    if let Some(version) = ready.version {
                        self.metadata
                            .reported
                            .insert("version".into(), Value::String(version));
                    }
                    self.transition(ChildBridgeStatus::Running);
                    return;
                }
                ProcessEvent::Exited { code } => {
                    self.process = None;
                    self.crash(format!("exited with code {code:?} before becoming ready"));
                    return;
                }
                other => self.on_event(other),
            }
        }
    }

    async fn stop(&mut self, manual: bool) {
        match self.metadata.status {
            ChildBridgeStatus::Stopped => return,
            ChildBridgeStatus::Crashed => {
                if manual {
                    self.metadata.manually_stopped = true;
                }
                self.transition(ChildBridgeStatus::Stopped);
                return;
            }
            ChildBridgeStatus::Starting
            | ChildBridgeStatus::Running
            | ChildBridgeStatus::Stopping => {}
        }

        if manual {
            self.metadata.manually_stopped = true;
        }
        self.transition(ChildBridgeStatus::Stopping);

        if let Some(process) = &self.process {
            let _ = process.control.send(ChildControl::Shutdown);
        }
        if timeout(self.settings.shutdown_grace, self.wait_for_exit())
            .await
            .is_err()
        {
            tracing::warn!(
                username = %self.entry.username,
                grace = ?self.settings.shutdown_grace,
                "child bridge ignored shutdown; killing"
            );
            self.kill_process().await;
        }

        self.process = None;
        self.metadata.pid = None;
        self.transition(ChildBridgeStatus::Stopped);
    }

    fn request_metadata(&self) {
        match &self.process {
            Some(process) if self.metadata.status == ChildBridgeStatus::Running => {
                let _ = process.control.send(ChildControl::MetadataRequest);
            }
            _ => tracing::debug!(
                username = %self.entry.username,
                status = %self.metadata.status,
                "not requesting metadata from a bridge that is not running"
            ),
        }
    }

    async fn wait_for_exit(&mut self) {
        while self.process.is_some() {
            match next_event(&mut self.process).await {
                ProcessEvent::Exited { .. } => {
                    self.process = None;
                }
                other => self.on_event(other),
            }
        }
    }

    async fn kill_process(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if let Some(kill) = process.kill.take() {
            let _ = kill.send(());
        }
        while let Some(event) = process.events.recv().await {
            if matches!(event, ProcessEvent::Exited { .. }) {
                break;
            }
        }
    }

    /// Events that arrive outside a start or stop sequence.
    fn on_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Report(ChildReport::MetadataResponse(reported)) => {
                // Only a running bridge was asked; anything else is left over from a stop.
                if self.metadata.status != ChildBridgeStatus::Running {
                    tracing::debug!(
                        username = %self.entry.username,
                        status = %self.metadata.status,
                        "discarding stale metadata"
                    );
                    return;
                }
                self.metadata.reported.extend(reported);
                self.store();
            }
            ProcessEvent::Report(ChildReport::Ready(_)) => {
                tracing::debug!(username = %self.entry.username, "ignoring repeated ready report");
            }
            ProcessEvent::Stderr(line) => {
                tracing::info!(username = %self.entry.username, "{line}");
            }
            ProcessEvent::Exited { code } => {
                self.process = None;
                tracing::error!(username = %self.entry.username, code = ?code, "child bridge exited unexpectedly");
                self.crash(format!("exited unexpectedly with code {code:?}"));
            }
        }
    }

    fn crash(&mut self, reason: String) {
        self.metadata.pid = None;
        self.metadata.failure_reason = Some(reason);
        self.transition(ChildBridgeStatus::Crashed);
        self.schedule_auto_restart();
    }

    fn schedule_auto_restart(&self) {
        if self.metadata.manually_stopped {
            return;
        }
        if self.metadata.restart_count >= self.settings.max_restarts {
            tracing::warn!(
                username = %self.entry.username,
                restarts = self.metadata.restart_count,
                "child bridge keeps crashing; not restarting again"
            );
            return;
        }

        let commands = self.commands.clone();
        let delay = self.settings.restart_delay;
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::AutoRestart { generation });
            }
        });
    }

    fn transition(&mut self, status: ChildBridgeStatus) {
        let previous = self.metadata.status;
        self.metadata.status = status;
        tracing::info!(
            username = %self.entry.username,
            from = %previous,
            to = %status,
            "child bridge status changed"
        );
        self.store();
        self.parent
            .send(&IpcOutgoingEvent::ChildBridgeStatusUpdate(self.metadata.clone()));
    }

    fn store(&self) {
        self.table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.entry.username.clone(), self.metadata.clone());
        let _ = self.updates.send(self.metadata.clone());
    }
}

/// Next event from the active process; pends forever when there is none.
async fn next_event(process: &mut Option<ActiveProcess>) -> ProcessEvent {
    match process {
        Some(process) => process
            .events
            .recv()
            .await
            .unwrap_or(ProcessEvent::Exited { code: None }),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamParentChannel;
    use crate::protocol::IpcMessage;
    use crate::test_support::{entry, Behaviour, FakeLauncher};

    const A: &str = "0E:80:9C:B4:E4:C5";
    const B: &str = "61:67:0F:6E:B0:48";

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            ready_timeout: Duration::from_millis(500),
            shutdown_grace: Duration::from_millis(500),
            restart_delay: Duration::from_millis(50),
            max_restarts: 0,
        }
    }

    fn supervisor(
        launcher: &FakeLauncher,
        settings: SupervisorSettings,
    ) -> (ChildBridgeSupervisor, mpsc::UnboundedReceiver<IpcMessage>) {
        let (parent, outbound) = StreamParentChannel::queued();
        let mut supervisor =
            ChildBridgeSupervisor::new(Arc::new(launcher.clone()), Arc::new(parent), settings);
        supervisor.add_bridge(entry(A, "A")).unwrap();
        supervisor.add_bridge(entry(B, "B")).unwrap();
        (supervisor, outbound)
    }

    fn username(value: &str) -> BridgeUsername {
        BridgeUsername::parse(value).unwrap()
    }

    async fn wait_for(
        supervisor: &ChildBridgeSupervisor,
        username: &str,
        status: ChildBridgeStatus,
    ) -> ChildBridgeMetadata {
        let poll = async {
            loop {
                if let Some(metadata) = supervisor.bridge_metadata(username) {
                    if metadata.status == status {
                        return metadata;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        timeout(Duration::from_secs(5), poll)
            .await
            .unwrap_or_else(|_| panic!("{username} never reached {status}"))
    }

    #[tokio::test]
    async fn bridges_start_stopped() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::ZERO));
        let (supervisor, _outbound) = supervisor(&launcher, settings());
        assert_eq!(supervisor.status(A), Some(ChildBridgeStatus::Stopped));
        assert_eq!(supervisor.metadata().len(), 2);
        assert_eq!(supervisor.metadata()[0].username.as_str(), A);
    }

    #[tokio::test]
    async fn start_reaches_running_and_reports_transitions() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::from_millis(20)));
        let (supervisor, mut outbound) = supervisor(&launcher, settings());

        supervisor.start(A).unwrap();
        let metadata = wait_for(&supervisor, A, ChildBridgeStatus::Running).await;
        assert!(metadata.pid.is_some());
        assert_eq!(supervisor.status(B), Some(ChildBridgeStatus::Stopped));

        let first = outbound.recv().await.unwrap();
        let second = outbound.recv().await.unwrap();
        assert_eq!(first.id, "childBridgeStatusUpdate");
        assert_eq!(first.data["status"], "starting");
        assert_eq!(second.data["status"], "running");
        assert_eq!(second.data["username"], A);
    }

    #[tokio::test]
    async fn unknown_bridges_are_reported() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::ZERO));
        let (supervisor, _outbound) = supervisor(&launcher, settings());

        let err = supervisor.start("AA:BB:CC:DD:EE:FF").unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownBridge { .. }));
        assert!(supervisor.restart("garbage").is_err());

        supervisor.handle_ipc_event(IpcIncomingEvent::StopChildBridge("garbage".into()));
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn duplicate_bridge_rejected() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::ZERO));
        let (mut supervisor, _outbound) = supervisor(&launcher, settings());
        let err = supervisor.add_bridge(entry(A, "Again")).unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateBridge { .. }));
    }

    #[tokio::test]
    async fn stop_while_starting_ends_stopped() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::from_millis(100)));
        let (supervisor, _outbound) = supervisor(&launcher, settings());

        supervisor.start(A).unwrap();
        wait_for(&supervisor, A, ChildBridgeStatus::Starting).await;
        supervisor.stop(A).unwrap();

        let metadata = wait_for(&supervisor, A, ChildBridgeStatus::Stopped).await;
        assert!(metadata.manually_stopped);
        assert!(metadata.pid.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.status(A), Some(ChildBridgeStatus::Stopped));
        assert_eq!(launcher.live(&username(A)), 0);
    }

    #[tokio::test]
    async fn rapid_restarts_never_overlap() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::from_millis(10)));
        let (supervisor, _outbound) = supervisor(&launcher, settings());

        supervisor.start(A).unwrap();
        wait_for(&supervisor, A, ChildBridgeStatus::Running).await;

        supervisor.restart(A).unwrap();
        supervisor.restart(A).unwrap();

        let poll = async {
            while launcher.launches() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        timeout(Duration::from_secs(5), poll).await.unwrap();
        wait_for(&supervisor, A, ChildBridgeStatus::Running).await;

        assert_eq!(launcher.max_live(&username(A)), 1);
        assert_eq!(launcher.live(&username(A)), 1);
    }

    #[tokio::test]
    async fn bridges_progress_independently() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::ZERO));
        launcher.set_behaviour(&username(A), Behaviour::Stubborn);
        let (supervisor, _outbound) = supervisor(
            &launcher,
            SupervisorSettings {
                shutdown_grace: Duration::from_millis(300),
                ..settings()
            },
        );

        supervisor.start(A).unwrap();
        wait_for(&supervisor, A, ChildBridgeStatus::Running).await;

        let mut updates = supervisor.subscribe();
        supervisor.restart(A).unwrap();
        supervisor.start(B).unwrap();

        wait_for(&supervisor, B, ChildBridgeStatus::Running).await;
        assert_eq!(supervisor.status(A), Some(ChildBridgeStatus::Stopping));

        let mut seen = Vec::new();
        let collect = async {
            while let Ok(update) = updates.recv().await {
                if update.username.as_str() != A {
                    continue;
                }
                if seen.last() != Some(&update.status) {
                    seen.push(update.status);
                }
                if update.status == ChildBridgeStatus::Running {
                    break;
                }
            }
        };
        timeout(Duration::from_secs(5), collect).await.unwrap();
        assert_eq!(
            seen,
            vec![
                ChildBridgeStatus::Stopping,
                ChildBridgeStatus::Stopped,
                ChildBridgeStatus::Starting,
                ChildBridgeStatus::Running,
            ]
        );
        assert_eq!(launcher.max_live(&username(A)), 1);
    }

    #[tokio::test]
    async fn ready_timeout_is_a_crash() {
        let launcher = FakeLauncher::new(Behaviour::Silent);
        let (supervisor, _outbound) = supervisor(
            &launcher,
            SupervisorSettings {
                ready_timeout: Duration::from_millis(50),
                ..settings()
            },
        );

        supervisor.start(A).unwrap();
        let metadata = wait_for(&supervisor, A, ChildBridgeStatus::Crashed).await;
        assert!(metadata
            .failure_reason
            .unwrap()
            .contains("did not become ready"));
        assert_eq!(launcher.live(&username(A)), 0);
    }

    #[tokio::test]
    async fn spawn_failure_is_a_crash() {
        let launcher = FakeLauncher::new(Behaviour::FailSpawn);
        let (supervisor, _outbound) = supervisor(&launcher, settings());

        supervisor.start(A).unwrap();
        let metadata = wait_for(&supervisor, A, ChildBridgeStatus::Crashed).await;
        assert!(metadata.failure_reason.unwrap().contains("no such program"));
    }

    #[tokio::test]
    async fn crashed_bridge_is_restarted_up_to_limit() {
        let launcher = FakeLauncher::new(Behaviour::CrashAfter(Duration::from_millis(30)));
        let (supervisor, _outbound) = supervisor(
            &launcher,
            SupervisorSettings {
                max_restarts: 1,
                ..settings()
            },
        );

        supervisor.start(A).unwrap();
        let poll = async {
            loop {
                let metadata = supervisor.bridge_metadata(A).unwrap();
                if metadata.restart_count == 1 && metadata.status == ChildBridgeStatus::Crashed {
                    return metadata;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        let metadata = timeout(Duration::from_secs(5), poll).await.unwrap();
        assert!(metadata.failure_reason.unwrap().contains("unexpectedly"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn stopping_a_crashed_bridge_cancels_restart() {
        let launcher = FakeLauncher::new(Behaviour::CrashAfter(Duration::from_millis(10)));
        let (supervisor, _outbound) = supervisor(
            &launcher,
            SupervisorSettings {
                restart_delay: Duration::from_millis(100),
                max_restarts: 3,
                ..settings()
            },
        );

        supervisor.start(A).unwrap();
        wait_for(&supervisor, A, ChildBridgeStatus::Crashed).await;
        supervisor.stop(A).unwrap();
        wait_for(&supervisor, A, ChildBridgeStatus::Stopped).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(launcher.launches(), 1);
        assert_eq!(supervisor.status(A), Some(ChildBridgeStatus::Stopped));
    }

    #[tokio::test]
    async fn metadata_responses_are_merged() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::ZERO));
        let (supervisor, mut outbound) = supervisor(&launcher, settings());

        supervisor.start(A).unwrap();
        wait_for(&supervisor, A, ChildBridgeStatus::Running).await;
        while outbound.try_recv().is_ok() {}

        supervisor.handle_ipc_event(IpcIncomingEvent::ChildBridgeMetadataRequest);

        let response = outbound.recv().await.unwrap();
        assert_eq!(response.id, "childBridgeMetadataResponse");
        assert_eq!(response.data.as_array().unwrap().len(), 2);

        let poll = async {
            loop {
                let metadata = supervisor.bridge_metadata(A).unwrap();
                if metadata.reported.contains_key("launch") {
                    return metadata;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        let metadata = timeout(Duration::from_secs(5), poll).await.unwrap();
        assert_eq!(metadata.reported["launch"], 1);
        assert!(!supervisor
            .bridge_metadata(B)
            .unwrap()
            .reported
            .contains_key("launch"));
    }

    #[tokio::test]
    async fn metadata_sent_while_stopping_is_discarded() {
        let launcher = FakeLauncher::new(Behaviour::ReportOnShutdown);
        let (supervisor, _outbound) = supervisor(&launcher, settings());

        supervisor.start(A).unwrap();
        wait_for(&supervisor, A, ChildBridgeStatus::Running).await;
        supervisor.stop(A).unwrap();

        let metadata = wait_for(&supervisor, A, ChildBridgeStatus::Stopped).await;
        assert!(!metadata.reported.contains_key("launch"));
        assert_eq!(launcher.live(&username(A)), 0);
    }

    #[tokio::test]
    async fn ipc_events_drive_lifecycle() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::ZERO));
        let (supervisor, _outbound) = supervisor(&launcher, settings());

        supervisor.handle_ipc_event(IpcIncomingEvent::StartChildBridge(B.into()));
        wait_for(&supervisor, B, ChildBridgeStatus::Running).await;
        supervisor.handle_ipc_event(IpcIncomingEvent::RestartChildBridge(B.into()));
        supervisor.handle_ipc_event(IpcIncomingEvent::StopChildBridge(B.into()));
        wait_for(&supervisor, B, ChildBridgeStatus::Stopped).await;
        assert_eq!(launcher.launches(), 2);
        assert_eq!(launcher.max_live(&username(B)), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let launcher = FakeLauncher::new(Behaviour::Ready(Duration::ZERO));
        let (supervisor, _outbound) = supervisor(&launcher, settings());
        supervisor.start_all();
        wait_for(&supervisor, A, ChildBridgeStatus::Running).await;
        wait_for(&supervisor, B, ChildBridgeStatus::Running).await;

        supervisor.shutdown().await;
        assert_eq!(launcher.live(&username(A)), 0);
        assert_eq!(launcher.live(&username(B)), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn supervises_real_processes() {
        use crate::process::ProcessLauncher;
        use crate::test_support::create_test_child_script;

        let script = create_test_child_script();
        let mut supervisor = ChildBridgeSupervisor::new(
            Arc::new(ProcessLauncher::new(script.to_path_buf())),
            Arc::new(crate::channel::NoopParentChannel),
            SupervisorSettings {
                ready_timeout: Duration::from_secs(5),
                shutdown_grace: Duration::from_secs(5),
                ..settings()
            },
        );
        supervisor.add_bridge(entry(A, "A")).unwrap();

        supervisor.start(A).unwrap();
        let metadata = wait_for(&supervisor, A, ChildBridgeStatus::Running).await;
        assert_eq!(metadata.reported["accessories"], 2);

        supervisor.request_metadata(A).unwrap();
        let poll = async {
            while !supervisor
                .bridge_metadata(A)
                .unwrap()
                .reported
                .contains_key("plugin")
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(Duration::from_secs(5), poll).await.unwrap();

        supervisor.stop(A).unwrap();
        wait_for(&supervisor, A, ChildBridgeStatus::Stopped).await;
        supervisor.shutdown().await;
    }
}
