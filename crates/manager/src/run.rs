//! Run supervisor: owns the child script process and its state machine.
//!
//! Exactly one package runs at a time. The supervisor spawns the script
//! from the canonical project path, reads its newline-delimited JSON
//! events, injects control codes on pause/resume and walks the stop
//! path (SIGTERM, bounded wait, SIGKILL).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use arcor_catalog::{BuildClient, PublishOutcome};
use arcor_domain::config::ExecutionConfig;
use arcor_domain::{Error, Result};
use arcor_protocol::events;
use arcor_protocol::execution::{PackageState, PackageStateData};
use arcor_protocol::script::{self, ScriptEvent};
use arcor_protocol::EventFrame;

use crate::clients::ClientHub;
use crate::packages::{copy_tree, PackageStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct RunState {
    state: PackageState,
    package_id: Option<String>,
    current_action: Option<script::ActionStateBefore>,
    current_action_result: Option<script::ActionStateAfter>,
    last_exception: Option<script::ProjectException>,
    /// Control codes travel to the child through a writer task.
    control_tx: Option<mpsc::Sender<&'static [u8]>>,
    /// Asks the monitor task to SIGKILL the child.
    kill_tx: Option<mpsc::Sender<()>>,
    pid: Option<i32>,
}

pub struct RunSupervisor {
    project_path: PathBuf,
    stop_deadline: Duration,
    hub: Arc<ClientHub>,
    store: Arc<PackageStore>,
    build: BuildClient,
    inner: Arc<Mutex<RunState>>,
    state_tx: watch::Sender<PackageState>,
}

impl RunSupervisor {
    pub fn new(
        cfg: &ExecutionConfig,
        project_path: PathBuf,
        hub: Arc<ClientHub>,
        store: Arc<PackageStore>,
        build: BuildClient,
    ) -> Self {
        let (state_tx, _) = watch::channel(PackageState::Undefined);
        Self {
            project_path,
            stop_deadline: Duration::from_secs(cfg.stop_deadline_secs),
            hub,
            store,
            build,
            inner: Arc::new(Mutex::new(RunState::default())),
            state_tx,
        }
    }

    // ── snapshots ────────────────────────────────────────────────────

    pub fn state_data(&self) -> PackageStateData {
        let inner = self.inner.lock();
        PackageStateData {
            state: inner.state,
            package_id: inner.package_id.clone(),
            action_point_id: None,
        }
    }

    /// Id of the package currently in flight, if any.
    pub fn running_package(&self) -> Option<String> {
        let inner = self.inner.lock();
        if inner.state.can_run() {
            None
        } else {
            inner.package_id.clone()
        }
    }

    /// Events a freshly connected peer needs to converge.
    pub fn snapshot_events(&self) -> Vec<EventFrame> {
        let inner = self.inner.lock();
        let mut frames = vec![EventFrame::new(
            events::PACKAGE_STATE,
            serde_json::to_value(PackageStateData {
                state: inner.state,
                package_id: inner.package_id.clone(),
                action_point_id: None,
            })
            .unwrap_or_default(),
        )];
        if let Some(ref before) = inner.current_action {
            frames.push(EventFrame::new(
                events::ACTION_STATE_BEFORE,
                serde_json::to_value(before).unwrap_or_default(),
            ));
        }
        if let Some(ref exception) = inner.last_exception {
            frames.push(EventFrame::new(
                events::PROJECT_EXCEPTION,
                serde_json::to_value(exception).unwrap_or_default(),
            ));
        }
        frames
    }

    // ── start ────────────────────────────────────────────────────────

    /// Walk the start sequence: fetch the package zip, stage it into the
    /// canonical path, spawn the script and start the reader tasks.
    pub async fn run_package(
        &self,
        id: &str,
        breakpoints: Vec<String>,
        start_paused: bool,
    ) -> Result<()> {
        // Reserve the slot before the first await so two concurrent run
        // requests cannot both pass the state check.
        let previous = {
            let mut inner = self.inner.lock();
            if !inner.state.can_run() {
                return Err(Error::State(inner.state.refuse("run")));
            }
            let previous = inner.state;
            inner.state = PackageState::Starting;
            previous
        };

        match self.start_reserved(id, breakpoints, start_paused).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.lock().state = previous;
                Err(e)
            }
        }
    }

    async fn start_reserved(
        &self,
        id: &str,
        breakpoints: Vec<String>,
        start_paused: bool,
    ) -> Result<()> {
        self.stage_package(id).await?;
        if self.store.exists(id) {
            if let Err(e) = self.store.mark_executed(id) {
                tracing::warn!(package = id, error = %e, "failed to stamp executed");
            }
        }

        let script_path = self.project_path.join("script");
        if !script_path.is_file() {
            return Err(Error::State(format!("Package {id} has no script.")));
        }

        tracing::info!(package = id, path = %script_path.display(), "starting script");
        let mut command = Command::new(&script_path);
        command
            .current_dir(&self.project_path)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("ARCOR2_PROJECT_PATH", &self.project_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !breakpoints.is_empty() {
            command.arg("--breakpoints").arg(breakpoints.join(","));
        }
        if start_paused {
            command.arg("--start-paused");
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::State(format!("Failed to start package: {e}")))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let mut stdin = child.stdin.take().expect("stdin piped");
        let pid = child.id().map(|p| p as i32);

        let (control_tx, mut control_rx) = mpsc::channel::<&'static [u8]>(8);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        {
            let mut inner = self.inner.lock();
            inner.state = PackageState::Starting;
            inner.package_id = Some(id.to_owned());
            inner.current_action = None;
            inner.current_action_result = None;
            inner.last_exception = None;
            inner.control_tx = Some(control_tx);
            inner.kill_tx = Some(kill_tx);
            inner.pid = pid;
        }
        self.state_tx.send_replace(PackageState::Starting);
        self.broadcast_state(PackageState::Starting, Some(id.to_owned()), None);

        // Control-code writer: owns the child's stdin.
        tokio::spawn(async move {
            while let Some(code) = control_rx.recv().await {
                if stdin.write_all(code).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // stderr is folded into the same log stream as malformed stdout.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "script", "{line}");
            }
        });

        // Event reader: consumes stdout until EOF.
        let reader = {
            let inner = self.inner.clone();
            let hub = self.hub.clone();
            let state_tx = self.state_tx.clone();
            let package_id = id.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match ScriptEvent::parse_line(&line) {
                        Ok(Some(event)) => {
                            handle_script_event(&inner, &hub, &state_tx, &package_id, event);
                        }
                        Ok(None) => {
                            tracing::debug!(target: "script", line, "ignoring non-event output");
                        }
                        Err(e) => {
                            tracing::warn!(target: "script", error = %e, line, "malformed event line");
                        }
                    }
                }
            })
        };

        // Monitor: owns the child handle; reaps it and finalizes state.
        {
            let inner = self.inner.clone();
            let hub = self.hub.clone();
            let state_tx = self.state_tx.clone();
            let package_id = id.to_owned();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(s) => tracing::info!(package = %package_id, code = ?s.code(), "script finished"),
                            Err(e) => tracing::error!(package = %package_id, error = %e, "wait failed"),
                        }
                    }
                    _ = kill_rx.recv() => {
                        tracing::warn!(package = %package_id, "stop deadline passed, killing script");
                        let _ = child.kill().await;
                    }
                }
                let _ = reader.await;

                {
                    let mut inner = inner.lock();
                    inner.state = PackageState::Stopped;
                    inner.package_id = None;
                    inner.current_action = None;
                    inner.current_action_result = None;
                    inner.control_tx = None;
                    inner.kill_tx = None;
                    inner.pid = None;
                }
                state_tx.send_replace(PackageState::Stopped);
                let data = PackageStateData {
                    state: PackageState::Stopped,
                    package_id: Some(package_id),
                    action_point_id: None,
                };
                hub.broadcast(&EventFrame::new(
                    events::PACKAGE_STATE,
                    serde_json::to_value(data).unwrap_or_default(),
                ));
            });
        }

        Ok(())
    }

    /// Fetch the package zip from the build service; fall back to a
    /// previously uploaded copy when no current build is available.
    async fn stage_package(&self, id: &str) -> Result<()> {
        let fetched = match self.build.publish(id, id).await {
            Ok(PublishOutcome::Package(bytes)) => Some(bytes),
            Ok(PublishOutcome::NeedsRebuild(reason)) => {
                tracing::warn!(package = id, reason, "build service has no package");
                None
            }
            Err(e @ Error::Http(_)) => {
                tracing::warn!(package = id, error = %e, "build service unreachable");
                None
            }
            Err(e) => return Err(e),
        };

        let project_path = self.project_path.clone();
        let store_dir = self.store.dir(id);
        let have_local = self.store.exists(id);
        let id_owned = id.to_owned();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let parent = project_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&parent)?;

            let staging = tempfile::Builder::new()
                .prefix(".staging-")
                .tempdir_in(&parent)?;

            match fetched {
                Some(bytes) => {
                    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
                        .map_err(|e| Error::Validation(format!("Invalid zip file: {e}")))?;
                    archive
                        .extract(staging.path())
                        .map_err(|e| Error::Validation(format!("Invalid zip file: {e}")))?;
                }
                None if have_local => {
                    copy_tree(&store_dir, staging.path())?;
                }
                None => {
                    return Err(Error::NotFound(format!("Package {id_owned}")));
                }
            }

            use std::os::unix::fs::PermissionsExt;
            let script = staging.path().join("script");
            if script.is_file() {
                std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;
            }

            if project_path.exists() {
                std::fs::remove_dir_all(&project_path)?;
            }
            std::fs::rename(staging.keep(), &project_path)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Other(format!("staging task failed: {e}")))?
    }

    // ── steering ─────────────────────────────────────────────────────

    pub async fn pause(&self) -> Result<()> {
        let control = {
            let inner = self.inner.lock();
            if !inner.state.can_pause() {
                return Err(Error::State(inner.state.refuse("pause")));
            }
            inner.control_tx.clone()
        };
        let control = control.ok_or_else(|| Error::State("Package not running.".to_owned()))?;
        control
            .send(script::CONTROL_PAUSE)
            .await
            .map_err(|_| Error::State("Package not running.".to_owned()))
    }

    pub async fn resume(&self) -> Result<()> {
        let control = {
            let inner = self.inner.lock();
            if !inner.state.can_resume() {
                return Err(Error::State(inner.state.refuse("resume")));
            }
            inner.control_tx.clone()
        };
        let control = control.ok_or_else(|| Error::State("Package not running.".to_owned()))?;
        control
            .send(script::CONTROL_RESUME)
            .await
            .map_err(|_| Error::State("Package not running.".to_owned()))
    }

    /// SIGTERM, bounded wait for the monitor to report `Stopped`, then
    /// SIGKILL through the monitor's kill channel.
    pub async fn stop(&self) -> Result<()> {
        let (pid, kill_tx, package_id) = {
            let mut inner = self.inner.lock();
            if !inner.state.can_stop() {
                return Err(Error::State(inner.state.refuse("stop")));
            }
            inner.state = PackageState::Stopping;
            (inner.pid, inner.kill_tx.clone(), inner.package_id.clone())
        };
        self.state_tx.send_replace(PackageState::Stopping);
        self.broadcast_state(PackageState::Stopping, package_id, None);

        if let Some(pid) = pid {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                tracing::warn!(pid, error = %e, "SIGTERM failed");
            }
        }

        if self.wait_for_stopped(self.stop_deadline).await {
            return Ok(());
        }

        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(()).await;
        }
        // The SIGKILL path is prompt; a short grace period suffices.
        self.wait_for_stopped(Duration::from_secs(2)).await;
        Ok(())
    }

    async fn wait_for_stopped(&self, deadline: Duration) -> bool {
        let mut state_rx = self.state_tx.subscribe();
        tokio::time::timeout(deadline, async {
            loop {
                if *state_rx.borrow_and_update() == PackageState::Stopped {
                    return;
                }
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    fn broadcast_state(
        &self,
        state: PackageState,
        package_id: Option<String>,
        action_point_id: Option<String>,
    ) {
        let data = PackageStateData {
            state,
            package_id,
            action_point_id,
        };
        self.hub.broadcast(&EventFrame::new(
            events::PACKAGE_STATE,
            serde_json::to_value(data).unwrap_or_default(),
        ));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Script event dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn handle_script_event(
    inner: &Mutex<RunState>,
    hub: &ClientHub,
    state_tx: &watch::Sender<PackageState>,
    package_id: &str,
    event: ScriptEvent,
) {
    match event {
        ScriptEvent::PackageState { mut data } => {
            if data.package_id.is_none() {
                data.package_id = Some(package_id.to_owned());
            }
            {
                let mut inner = inner.lock();
                // The stop path owns the Stopping/Stopped transitions; a
                // late child event must not reorder the observed sequence.
                if inner.state == PackageState::Stopping {
                    tracing::debug!(state = ?data.state, "ignoring child state during stop");
                    return;
                }
                inner.state = data.state;
            }
            state_tx.send_replace(data.state);
            hub.broadcast(&EventFrame::new(
                events::PACKAGE_STATE,
                serde_json::to_value(data).unwrap_or_default(),
            ));
        }
        ScriptEvent::ActionStateBefore { data } => {
            inner.lock().current_action = Some(data.clone());
            hub.broadcast(&EventFrame::new(
                events::ACTION_STATE_BEFORE,
                serde_json::to_value(data).unwrap_or_default(),
            ));
        }
        ScriptEvent::ActionStateAfter { data } => {
            inner.lock().current_action_result = Some(data.clone());
            hub.broadcast(&EventFrame::new(
                events::ACTION_STATE_AFTER,
                serde_json::to_value(data).unwrap_or_default(),
            ));
        }
        ScriptEvent::ProjectException { data } => {
            tracing::error!(
                package = package_id,
                exception = %data.exception_type,
                message = %data.message,
                "script raised"
            );
            inner.lock().last_exception = Some(data.clone());
            hub.broadcast(&EventFrame::new(
                events::PROJECT_EXCEPTION,
                serde_json::to_value(data).unwrap_or_default(),
            ));
        }
    }
}
