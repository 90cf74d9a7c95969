//! Supervises the out-of-process renderer agent: owns the child process,
//! serves the local IPC endpoint, and ferries messages between the agent
//! and the main loop.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::monlog::MonitorLog;
use crate::worker::ipc::{self, AgentListener};
use crate::worker::messages::{AgentToMonitor, MonitorToAgent, TaskMessage};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Shared {
    inbound: Mutex<VecDeque<String>>,
    connected: AtomicBool,
    agent_pid: AtomicU32,
    agent_state: Mutex<String>,
    child: Mutex<Option<Child>>,
}

/// Handle to the agent supervisor; cheap to clone.
#[derive(Debug, Clone)]
pub struct AgentSupervisor {
    node_id: String,
    log: MonitorLog,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<String>,
    last_ping: Arc<Mutex<Instant>>,
}

impl AgentSupervisor {
    /// Create the supervisor and spawn its IPC task. The task serves one
    /// agent connection at a time and re-accepts after a disconnect.
    pub fn start(node_id: String, log: MonitorLog, cancel: CancellationToken) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            inbound: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            agent_pid: AtomicU32::new(0),
            agent_state: Mutex::new(String::new()),
            child: Mutex::new(None),
        });

        let supervisor = Self {
            node_id: node_id.clone(),
            log: log.clone(),
            shared: shared.clone(),
            outbound: outbound_tx,
            last_ping: Arc::new(Mutex::new(Instant::now())),
        };

        tokio::spawn(ipc_loop(node_id, log, shared, outbound_rx, cancel));
        supervisor
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub fn agent_pid(&self) -> u32 {
        self.shared.agent_pid.load(Ordering::Relaxed)
    }

    pub fn agent_state(&self) -> String {
        self.shared.agent_state.lock().unwrap().clone()
    }

    pub fn send_task(&self, task: TaskMessage) {
        self.send(&MonitorToAgent::Task(task));
    }

    pub fn send_abort(&self, reason: &str) {
        self.send(&MonitorToAgent::Abort {
            reason: reason.to_string(),
        });
    }

    fn send(&self, msg: &MonitorToAgent) {
        match serde_json::to_string(msg) {
            Ok(json) => {
                let _ = self.outbound.send(json);
            }
            Err(e) => self
                .log
                .error("agent", format!("Failed to encode agent message: {e}")),
        }
    }

    /// Drain queued agent messages on the main loop. `status` and `pong`
    /// are consumed here; everything else is returned for the render
    /// coordinator. Also sends the periodic ping while connected.
    pub fn process_messages(&self) -> Vec<AgentToMonitor> {
        let raw: Vec<String> = {
            let mut inbound = self.shared.inbound.lock().unwrap();
            inbound.drain(..).collect()
        };

        let mut forwarded = Vec::new();
        for line in raw {
            match serde_json::from_str::<AgentToMonitor>(&line) {
                Ok(AgentToMonitor::Status { state, pid }) => {
                    if pid != 0 {
                        self.shared.agent_pid.store(pid, Ordering::Relaxed);
                    }
                    self.log
                        .info("agent", format!("Agent status: state={state} pid={pid}"));
                    *self.shared.agent_state.lock().unwrap() = state;
                }
                Ok(AgentToMonitor::Pong) => {}
                Ok(msg) => forwarded.push(msg),
                Err(e) => self
                    .log
                    .error("agent", format!("Failed to parse message: {e}")),
            }
        }

        let mut last_ping = self.last_ping.lock().unwrap();
        if self.is_connected() && last_ping.elapsed() >= PING_INTERVAL {
            self.send(&MonitorToAgent::Ping);
            *last_ping = Instant::now();
        }

        forwarded
    }

    /// Launch the renderer binary next to our own executable, with no
    /// console window.
    pub fn spawn_agent(&self) -> bool {
        let agent_path = match std::env::current_exe() {
            Ok(exe) => exe.with_file_name(agent_binary_name()),
            Err(e) => {
                self.log
                    .error("agent", format!("Cannot resolve executable path: {e}"));
                return false;
            }
        };

        if !agent_path.exists() {
            self.log.error(
                "agent",
                format!("Renderer agent not found at: {}", agent_path.display()),
            );
            return false;
        }

        let mut cmd = Command::new(&agent_path);
        cmd.arg("--node-id")
            .arg(&self.node_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                self.shared.agent_pid.store(pid, Ordering::Relaxed);
                *self.shared.child.lock().unwrap() = Some(child);
                self.log.info("agent", format!("Agent spawned, PID={pid}"));
                true
            }
            Err(e) => {
                self.log.error("agent", format!("Failed to spawn agent: {e}"));
                false
            }
        }
    }

    /// Ask the agent to exit, wait for the grace period, then terminate.
    pub async fn shutdown_agent(&self) {
        if self.is_connected() {
            self.send(&MonitorToAgent::Shutdown);
        }

        let child = self.shared.child.lock().unwrap().take();
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    self.log
                        .warn("agent", "Agent didn't exit gracefully, terminating");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.shared.agent_pid.store(0, Ordering::Relaxed);
        self.shared.agent_state.lock().unwrap().clear();
        self.log.info("agent", "Agent shut down");
    }

    /// Terminate the agent immediately.
    pub fn kill_agent(&self) {
        if let Some(child) = self.shared.child.lock().unwrap().as_mut() {
            let _ = child.start_kill();
        }
        self.shared.agent_pid.store(0, Ordering::Relaxed);
        self.shared.agent_state.lock().unwrap().clear();
        self.log.info("agent", "Agent killed");
    }
}

fn agent_binary_name() -> &'static str {
    if cfg!(windows) {
        "sr-agent.exe"
    } else {
        "sr-agent"
    }
}

/// Accept/receive loop: one client at a time, 1s read timeout so
/// cancellation is observed promptly, reconnects after any IPC error.
async fn ipc_loop(
    node_id: String,
    log: MonitorLog,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let mut listener = match AgentListener::bind(&node_id) {
        Ok(l) => l,
        Err(e) => {
            log.error("agent", format!("Failed to create IPC endpoint: {e}"));
            return;
        }
    };

    log.info("agent", format!("Started for node {node_id}"));

    loop {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    log.error("agent", format!("IPC accept failed: {e}"));
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            },
        };

        shared.connected.store(true, Ordering::Relaxed);
        log.info("agent", "Agent connected via IPC");

        // Reader and writer run on split halves so a mid-frame read is
        // never torn down by outbound traffic; the select resolves only
        // when a side disconnects or the supervisor is cancelled.
        let (mut reader, mut writer) = tokio::io::split(stream);

        let cancelled = {
            let read_side = async {
                loop {
                    match ipc::read_frame(&mut reader).await {
                        Ok(bytes) => match String::from_utf8(bytes) {
                            Ok(text) => shared.inbound.lock().unwrap().push_back(text),
                            Err(_) => {
                                log.error("agent", "Agent sent non-UTF8 frame, disconnecting");
                                break;
                            }
                        },
                        Err(e) => {
                            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                                log.warn("agent", format!("IPC read failed: {e}"));
                            }
                            break;
                        }
                    }
                }
            };

            let write_side = async {
                loop {
                    let Some(json) = outbound.recv().await else {
                        break;
                    };
                    if let Err(e) = ipc::write_frame(&mut writer, json.as_bytes()).await {
                        log.warn("agent", format!("IPC write failed: {e}"));
                        break;
                    }
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = read_side => false,
                _ = write_side => false,
            }
        };

        shared.connected.store(false, Ordering::Relaxed);

        if cancelled {
            // Best-effort goodbye before the endpoint goes away.
            if let Ok(json) = serde_json::to_string(&MonitorToAgent::Shutdown) {
                let mut stream = reader.unsplit(writer);
                let _ = ipc::write_frame(&mut stream, json.as_bytes()).await;
            }
            break;
        }
        log.warn("agent", "Agent disconnected from IPC");
    }

    shared.connected.store(false, Ordering::Relaxed);
    log.info("agent", "Stopped");
}
