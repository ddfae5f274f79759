use crate::config::{BackendSpec, Config, ExitPolicy};
use crate::error::SupervisorError;
use parking_lot::Mutex;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Capacity of the activity/control command queue
const COMMAND_BUFFER: usize = 64;

/// State of the backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// No backend process is running
    Stopped,
    /// A backend process has been launched and not yet stopped
    Running,
}

/// Snapshot of the supervisor's view of the backend
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub state: BackendState,
    /// Process id of the running backend
    pub pid: Option<u32>,
    /// Number of times the backend has been launched
    pub launches: u64,
    /// Time since the last recorded activity
    pub idle_for: Duration,
    /// Stopped backends that have not exited yet
    pub stopping: usize,
}

/// Messages understood by the supervisor's event loop
#[derive(Debug)]
pub enum Command {
    /// Launch the backend unless it is already running
    Start,
    /// Reset the idle clock
    RecordActivity,
    /// Stop the backend if it has been idle for longer than the timeout
    TickIdleCheck,
    Status(oneshot::Sender<BackendStatus>),
    /// Stop the backend and end the event loop
    Shutdown(oneshot::Sender<()>),
}

/// Timing and policy knobs for the supervisor
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    /// How long a stopped backend gets to exit before it is killed
    pub stop_grace_period: Duration,
    pub exit_policy: ExitPolicy,
}

impl From<&Config> for SupervisorSettings {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            idle_check_interval: config.idle_check_interval,
            stop_grace_period: config.stop_grace_period,
            exit_policy: config.exit_policy,
        }
    }
}

/// A launched backend. Present in the shared slot only while the backend
/// is believed to be running.
struct ProcessHandle {
    pid: u32,
    /// The backend leads its own process group
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: u32,
    /// Launch number, used by the exit watcher to tell its own process apart
    generation: u64,
    started_at: Instant,
    /// Tells the exit watcher a stop was requested and the grace period runs
    stop_tx: oneshot::Sender<()>,
}

impl ProcessHandle {
    /// Ask the backend and everything it spawned to shut down
    fn terminate(self) {
        #[cfg(unix)]
        signal_group(self.pgid, libc::SIGTERM);

        let _ = self.stop_tx.send(());
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    if pgid == 0 {
        return;
    }
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(-(pgid as i32), signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pgid, signal, error = %err, "Failed to signal backend process group");
    } else {
        debug!(pgid, signal, "Signaled backend process group");
    }
}

/// The running backend, shared with the exit watcher of the current launch
type SharedHandle = Arc<Mutex<Option<ProcessHandle>>>;

/// Reported by an exit watcher once its backend has been reaped
#[derive(Debug)]
struct BackendExit {
    pid: u32,
    generation: u64,
    status: Option<ExitStatus>,
    /// The backend had already been stopped by the supervisor
    planned: bool,
}

enum Event {
    Command(Command),
    Exited(BackendExit),
    Closed,
}

/// Cloneable front end to a [`Supervisor`]
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    starts: mpsc::Sender<()>,
}

impl SupervisorHandle {
    /// Ask for the backend to be started without waiting.
    ///
    /// Returns false if a start request is already queued, in which case
    /// this one is dropped.
    pub fn request_start(&self) -> bool {
        self.starts.try_send(()).is_ok()
    }

    /// Report connection activity
    pub async fn record_activity(&self) {
        let _ = self.commands.send(Command::RecordActivity).await;
    }

    /// Run an idle check now instead of waiting for the next tick
    pub async fn check_idle(&self) {
        let _ = self.commands.send(Command::TickIdleCheck).await;
    }

    /// Current backend status, or `None` once the supervisor has stopped
    pub async fn status(&self) -> Option<BackendStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Status(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Stop the backend and the supervisor loop, waiting for both
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Owns the backend lifecycle.
///
/// All state transitions happen inside [`run`](Supervisor::run), one
/// command at a time. Connection handlers talk to it only through a
/// [`SupervisorHandle`]. The exit watcher of the current launch is the
/// only other party touching the process handle, and it does so under
/// the slot's mutex.
pub struct Supervisor {
    spec: BackendSpec,
    settings: SupervisorSettings,
    handle: SharedHandle,
    last_activity: Instant,
    launches: u64,
    /// Stopped generations whose process has not been reaped yet
    stopping: usize,
    /// A start arrived while a stopped backend was still exiting
    start_deferred: bool,
    commands: mpsc::Receiver<Command>,
    starts: mpsc::Receiver<()>,
    exits_tx: mpsc::UnboundedSender<BackendExit>,
    exits: mpsc::UnboundedReceiver<BackendExit>,
}

impl Supervisor {
    pub fn new(spec: BackendSpec, settings: SupervisorSettings) -> (Self, SupervisorHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        // One pending start is enough: starting is idempotent
        let (starts_tx, starts) = mpsc::channel(1);
        let (exits_tx, exits) = mpsc::unbounded_channel();

        let supervisor = Self {
            spec,
            settings,
            handle: Arc::new(Mutex::new(None)),
            last_activity: Instant::now(),
            launches: 0,
            stopping: 0,
            start_deferred: false,
            commands,
            starts,
            exits_tx,
            exits,
        };
        let handle = SupervisorHandle {
            commands: commands_tx,
            starts: starts_tx,
        };
        (supervisor, handle)
    }

    /// Create a supervisor and run it on a new task
    pub fn spawn(
        spec: BackendSpec,
        settings: SupervisorSettings,
    ) -> (SupervisorHandle, JoinHandle<Result<(), SupervisorError>>) {
        let (supervisor, handle) = Self::new(spec, settings);
        (handle, tokio::spawn(supervisor.run()))
    }

    /// Process commands, exit reports and idle ticks until shut down.
    ///
    /// Returns an error when the backend cannot be launched, or when it
    /// exits on its own under [`ExitPolicy::Terminate`].
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        let period = self.settings.idle_check_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            idle_timeout_ms = self.settings.idle_timeout.as_millis(),
            check_interval_ms = period.as_millis(),
            "Process supervisor started"
        );

        loop {
            let event = tokio::select! {
                Some(()) = self.starts.recv() => Event::Command(Command::Start),
                command = self.commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => Event::Closed,
                },
                Some(exit) = self.exits.recv() => Event::Exited(exit),
                _ = ticker.tick() => Event::Command(Command::TickIdleCheck),
            };

            match event {
                Event::Command(Command::Start) => self.start_backend()?,
                Event::Command(Command::RecordActivity) => {
                    self.last_activity = Instant::now();
                }
                Event::Command(Command::TickIdleCheck) => self.check_idle(),
                Event::Command(Command::Status(reply)) => {
                    let _ = reply.send(self.status());
                }
                Event::Command(Command::Shutdown(reply)) => {
                    self.stop_backend("proxy shutting down");
                    let _ = reply.send(());
                    return Ok(());
                }
                Event::Exited(exit) if exit.planned => self.on_stopped_exit(exit)?,
                Event::Exited(exit) => self.on_unexpected_exit(exit)?,
                Event::Closed => {
                    debug!("All supervisor handles dropped");
                    self.stop_backend("supervisor handles dropped");
                    return Ok(());
                }
            }
        }
    }

    fn status(&self) -> BackendStatus {
        let pid = self.handle.lock().as_ref().map(|p| p.pid);
        BackendStatus {
            state: if pid.is_some() {
                BackendState::Running
            } else {
                BackendState::Stopped
            },
            pid,
            launches: self.launches,
            idle_for: self.last_activity.elapsed(),
            stopping: self.stopping,
        }
    }

    fn start_backend(&mut self) -> Result<(), SupervisorError> {
        let mut slot = self.handle.lock();
        if let Some(ref running) = *slot {
            debug!(pid = running.pid, "Backend already running");
            return Ok(());
        }

        // The old backend may still hold the forward address
        if self.stopping > 0 {
            if !self.start_deferred {
                debug!(stopping = self.stopping, "Previous backend still exiting, deferring start");
            }
            self.start_deferred = true;
            return Ok(());
        }

        let mut cmd = ProcessCommand::new(&self.spec.program);
        cmd.args(&self.spec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        if let Some(ref working_dir) = self.spec.working_dir {
            cmd.current_dir(working_dir);
        }
        if let Some(port) = self.spec.forward_port() {
            cmd.env("PORT", port.to_string());
        }
        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }

        // Own process group so the whole tree can be signaled at once
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| {
            error!(program = %self.spec.program, error = %source, "Failed to start backend");
            SupervisorError::Spawn {
                program: self.spec.program.clone(),
                source,
            }
        })?;

        let pid = child.id().unwrap_or(0);
        self.launches += 1;
        let generation = self.launches;

        let (stop_tx, stop_rx) = oneshot::channel();

        *slot = Some(ProcessHandle {
            pid,
            pgid: pid,
            generation,
            started_at: Instant::now(),
            stop_tx,
        });
        drop(slot);

        self.last_activity = Instant::now();
        info!(
            pid,
            generation,
            program = %self.spec.program,
            args = ?self.spec.args,
            "Backend process started"
        );

        self.spawn_exit_watcher(child, pid, generation, stop_rx);
        Ok(())
    }

    /// Wait for the child to exit and report it to the loop. Once a stop is
    /// requested the child gets the grace period, then the group is killed.
    /// If the slot still holds this launch the exit was not requested.
    fn spawn_exit_watcher(
        &self,
        mut child: Child,
        pid: u32,
        generation: u64,
        stop_rx: oneshot::Receiver<()>,
    ) {
        let slot = Arc::clone(&self.handle);
        let exits = self.exits_tx.clone();
        let grace_period = self.settings.stop_grace_period;

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = stop_rx => {
                    #[cfg(not(unix))]
                    let _ = child.start_kill();

                    match tokio::time::timeout(grace_period, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!(
                                pid,
                                grace_period_ms = grace_period.as_millis(),
                                "Grace period exceeded, killing backend"
                            );
                            #[cfg(unix)]
                            signal_group(pid, libc::SIGKILL);
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    }
                }
            };

            let status = match status {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait for backend process");
                    None
                }
            };

            let planned = {
                let mut guard = slot.lock();
                match guard.as_ref() {
                    Some(current) if current.generation == generation => {
                        *guard = None;
                        false
                    }
                    _ => true,
                }
            };

            let _ = exits.send(BackendExit {
                pid,
                generation,
                status,
                planned,
            });
        });
    }

    fn check_idle(&mut self) {
        let idle_for = self.last_activity.elapsed();
        let process = {
            let mut slot = self.handle.lock();
            if slot.is_none() || idle_for <= self.settings.idle_timeout {
                return;
            }
            slot.take()
        };

        if let Some(process) = process {
            info!(
                pid = process.pid,
                idle_ms = idle_for.as_millis(),
                uptime_secs = process.started_at.elapsed().as_secs(),
                "Idle timeout reached, stopping backend"
            );
            self.stopping += 1;
            process.terminate();
        }
    }

    fn stop_backend(&mut self, reason: &str) {
        let process = self.handle.lock().take();
        if let Some(process) = process {
            info!(pid = process.pid, reason, "Stopping backend");
            self.stopping += 1;
            process.terminate();
        }
    }

    fn on_stopped_exit(&mut self, exit: BackendExit) -> Result<(), SupervisorError> {
        self.stopping = self.stopping.saturating_sub(1);
        debug!(pid = exit.pid, status = ?exit.status, "Stopped backend process exited");

        if self.stopping == 0 && std::mem::take(&mut self.start_deferred) {
            self.start_backend()?;
        }
        Ok(())
    }

    fn on_unexpected_exit(&mut self, exit: BackendExit) -> Result<(), SupervisorError> {
        match self.settings.exit_policy {
            ExitPolicy::Terminate => {
                error!(
                    pid = exit.pid,
                    generation = exit.generation,
                    status = ?exit.status,
                    "Backend exited unexpectedly"
                );
                Err(SupervisorError::BackendExited {
                    pid: exit.pid,
                    status: exit.status,
                })
            }
            ExitPolicy::Restart => {
                warn!(
                    pid = exit.pid,
                    generation = exit.generation,
                    status = ?exit.status,
                    "Backend exited unexpectedly, next connection will start it again"
                );
                Ok(())
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(process) = self.handle.lock().take() {
            process.terminate();
        }
    }
}
