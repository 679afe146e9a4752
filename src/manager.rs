use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::config::{Config, STDERR_RING_CAPACITY};
use crate::ipc::{self, ProtocolError, WorkerEvent, WorkerRequest};
use crate::queue::JobQueue;
use crate::registry::ScanRegistry;
use crate::types::{Job, ScanError, ScanErrorCode, ScanStatus};

/// Environment variables a worker child is allowed to inherit. Everything
/// else in the parent environment is treated as untrusted and withheld.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "TMPDIR",
    "RUST_LOG",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
];

/// Stderr fingerprints of a worker that died of heap exhaustion.
const OOM_FINGERPRINTS: &[&str] = &["memory allocation of", "out of memory"];

/// How long to keep draining a connected IPC channel after the child exits,
/// so frames the child flushed right before exiting are not lost.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Binary to spawn for each job; normally this executable itself.
    pub worker_bin: PathBuf,
    /// Arguments placed before `--socket <path>` (normally `["worker"]`).
    pub worker_args: Vec<String>,
    /// Directory that holds the per-job IPC sockets.
    pub socket_dir: PathBuf,
    /// Wall-clock budget for one job, clone + scan + parse included.
    pub timeout: Duration,
    /// Soft address-space cap applied to the child.
    pub memory_limit_bytes: Option<u64>,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            worker_bin: std::env::current_exe().context("cannot resolve own executable")?,
            worker_args: vec!["worker".to_string()],
            socket_dir: std::env::temp_dir().join("repo-sentry"),
            timeout: config.worker_timeout,
            memory_limit_bytes: config.worker_memory_limit,
        })
    }
}

/// Spawns one isolated child process per job, mirrors its IPC into the
/// registry, classifies its exit, and releases the queue slot exactly once.
pub struct WorkerManager {
    config: WorkerConfig,
    registry: Arc<ScanRegistry>,
    queue: Arc<JobQueue>,
    children: Mutex<HashMap<String, u32>>,
}

impl WorkerManager {
    pub fn new(config: WorkerConfig, registry: Arc<ScanRegistry>, queue: Arc<JobQueue>) -> Self {
        Self {
            config,
            registry,
            queue,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn live_workers(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    /// Fire-and-forget: spawns the job task and returns immediately. Every
    /// accepted call leads to exactly one `queue.on_job_complete`.
    pub fn run_job(self: Arc<Self>, job: Job) {
        tokio::spawn(async move {
            self.job_task(job).await;
        });
    }

    async fn job_task(self: Arc<Self>, job: Job) {
        let Job { scan_id, repo_url } = job;
        let socket_path = self.config.socket_dir.join(format!("scan-{scan_id}.sock"));
        let mut settled = false;

        let listener = match self.bind_listener(&socket_path) {
            Ok(listener) => listener,
            Err(err) => {
                self.fail_and_settle(&mut settled, &scan_id, &socket_path, &err);
                return;
            }
        };

        let mut child = match self.spawn_worker(&socket_path) {
            Ok(child) => child,
            Err(err) => {
                self.fail_and_settle(&mut settled, &scan_id, &socket_path, &err);
                return;
            }
        };

        let pid = child.id().unwrap_or_default();
        self.children.lock().unwrap().insert(scan_id.clone(), pid);
        tracing::info!(%scan_id, pid, "worker spawned");

        // Newest-bytes stderr capture for OOM classification.
        let stderr_ring = Arc::new(Mutex::new(ByteRing::new(STDERR_RING_CAPACITY)));
        if let Some(stderr) = child.stderr.take() {
            let ring = Arc::clone(&stderr_ring);
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut stderr = stderr;
                let mut buf = [0u8; 1024];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    ring.lock().unwrap().extend(&buf[..n]);
                }
            });
        }

        let io = {
            let registry = Arc::clone(&self.registry);
            let scan_id = scan_id.clone();
            let repo_url = repo_url.clone();
            async move {
                let (mut stream, _) = listener.accept().await?;
                let start = WorkerRequest::Start {
                    scan_id: scan_id.clone(),
                    repo_url,
                };
                ipc::write_frame(&mut stream, &start).await?;
                loop {
                    match ipc::read_frame(&mut stream).await? {
                        None => return Ok::<(), ProtocolError>(()),
                        Some(payload) => match ipc::decode_event(&payload) {
                            Ok(Some(event)) => apply_event(&registry, &scan_id, event),
                            Ok(None) => {}
                            Err(err) => {
                                tracing::warn!(%scan_id, error = %err, "dropping invalid worker message");
                            }
                        },
                    }
                }
            }
        };
        tokio::pin!(io);
        let mut io_done = false;

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        let mut timer_fired = false;

        let exit_status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = &mut deadline, if !timer_fired => {
                    timer_fired = true;
                    tracing::warn!(%scan_id, "worker timed out, killing");
                    self.registry.set_error(
                        &scan_id,
                        ScanError::new(
                            ScanErrorCode::Timeout,
                            format!("Worker timed out after {} ms", self.config.timeout.as_millis()),
                        ),
                    );
                    let _ = child.start_kill();
                    self.settle(&mut settled, &scan_id, &socket_path);
                    // Anything else the worker says is late IPC; drop it.
                    io_done = true;
                }
                result = &mut io, if !io_done => {
                    io_done = true;
                    if let Err(err) = result {
                        if !settled {
                            tracing::warn!(%scan_id, error = %err, "worker channel error");
                            self.registry.set_error(
                                &scan_id,
                                ScanError::new(
                                    ScanErrorCode::Unknown,
                                    format!("Worker process error: {err}"),
                                ),
                            );
                            let _ = child.start_kill();
                            self.settle(&mut settled, &scan_id, &socket_path);
                        }
                    }
                }
            }
        };

        // Frames the child flushed just before exiting may still be in
        // flight; drain them before classifying the exit.
        if !settled && !io_done {
            let _ = tokio::time::timeout(EXIT_DRAIN_GRACE, &mut io).await;
        }

        if !settled {
            match self.registry.get(&scan_id) {
                None => {
                    // Evicted under load; the outcome has nowhere to go.
                    tracing::debug!(%scan_id, "worker exited for an evicted scan");
                }
                Some(record) if record.status.is_terminal() => {
                    // Child reported its own outcome over IPC.
                }
                Some(_) => {
                    let stderr_tail = stderr_ring.lock().unwrap().to_string_lossy();
                    let error = match &exit_status {
                        Ok(status) => classify_exit(status, &stderr_tail),
                        Err(err) => ScanError::new(
                            ScanErrorCode::Unknown,
                            format!("Worker process error: {err}"),
                        ),
                    };
                    tracing::warn!(%scan_id, error = %error, "worker exited without reporting");
                    self.registry.set_error(&scan_id, error);
                }
            }
            self.settle(&mut settled, &scan_id, &socket_path);
        }

        if let Ok(status) = exit_status {
            tracing::info!(%scan_id, code = ?status.code(), "worker exited");
        }
    }

    fn bind_listener(&self, socket_path: &Path) -> Result<tokio::net::UnixListener> {
        std::fs::create_dir_all(&self.config.socket_dir)
            .context("cannot create worker socket directory")?;
        let _ = std::fs::remove_file(socket_path);
        tokio::net::UnixListener::bind(socket_path)
            .with_context(|| format!("cannot bind worker socket {}", socket_path.display()))
    }

    fn spawn_worker(&self, socket_path: &Path) -> Result<Child> {
        let mut cmd = Command::new(&self.config.worker_bin);
        cmd.args(&self.config.worker_args);
        cmd.arg("--socket").arg(socket_path);

        // Allowlist, never denylist: the parent environment may hold secrets.
        cmd.env_clear();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        if let Some(limit) = self.config.memory_limit_bytes {
            unsafe {
                cmd.pre_exec(move || {
                    // Soft cap only: the engine raises it back to the hard
                    // limit for its own subprocesses, which need headroom.
                    nix::sys::resource::setrlimit(
                        nix::sys::resource::Resource::RLIMIT_AS,
                        limit,
                        nix::sys::resource::RLIM_INFINITY,
                    )
                    .map_err(std::io::Error::from)
                });
            }
        }

        cmd.spawn()
            .with_context(|| format!("cannot spawn worker {}", self.config.worker_bin.display()))
    }

    fn fail_and_settle(
        &self,
        settled: &mut bool,
        scan_id: &str,
        socket_path: &Path,
        err: &anyhow::Error,
    ) {
        tracing::error!(scan_id, error = %err, "worker setup failed");
        self.registry.set_error(
            scan_id,
            ScanError::new(ScanErrorCode::Unknown, format!("Worker process error: {err:#}")),
        );
        self.settle(settled, scan_id, socket_path);
    }

    /// Idempotent: removes the child from the live set, removes the socket
    /// file, and releases the queue slot exactly once.
    fn settle(&self, settled: &mut bool, scan_id: &str, socket_path: &Path) {
        if *settled {
            return;
        }
        *settled = true;
        self.children.lock().unwrap().remove(scan_id);
        let _ = std::fs::remove_file(socket_path);
        self.queue.on_job_complete();
    }

    /// Cooperative shutdown: SIGTERM every live worker, wait up to `grace`,
    /// then SIGKILL survivors and wait for the live set to empty.
    pub async fn shutdown_workers(&self, grace: Duration) {
        let pids: Vec<(String, u32)> = self
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|(id, pid)| (id.clone(), *pid))
            .collect();
        if pids.is_empty() {
            return;
        }

        tracing::info!(count = pids.len(), "shutting down live workers");
        #[cfg(unix)]
        for (scan_id, pid) in &pids {
            tracing::debug!(%scan_id, pid, "sending SIGTERM");
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(*pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }

        if self.await_drained(grace).await {
            return;
        }

        #[cfg(unix)]
        for (scan_id, pid) in &pids {
            if self.children.lock().unwrap().contains_key(scan_id) {
                tracing::warn!(%scan_id, pid, "grace expired, sending SIGKILL");
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(*pid as i32),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }

        if !self.await_drained(Duration::from_secs(2)).await {
            tracing::error!(
                remaining = self.live_workers(),
                "workers still live after SIGKILL"
            );
        }
    }

    async fn await_drained(&self, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            if self.live_workers() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.live_workers() == 0
    }
}

/// Mirror one validated worker event into the registry. Events whose scan id
/// does not match the current job are dropped, as are statuses a worker is
/// not allowed to report.
fn apply_event(registry: &ScanRegistry, expected_scan_id: &str, event: WorkerEvent) {
    if event.scan_id() != expected_scan_id {
        tracing::warn!(
            expected = expected_scan_id,
            got = event.scan_id(),
            "dropping event with mismatched scan id"
        );
        return;
    }
    match event {
        WorkerEvent::Status { status, .. } => match status {
            ScanStatus::Scanning | ScanStatus::Finished => {
                registry.update_status(expected_scan_id, status)
            }
            other => {
                tracing::warn!(scan_id = expected_scan_id, status = %other, "dropping illegal worker status");
            }
        },
        WorkerEvent::Vulns {
            vulnerabilities, ..
        } => registry.append_vulnerabilities(expected_scan_id, vulnerabilities),
        WorkerEvent::Error { error, .. } => registry.set_error(expected_scan_id, error),
    }
}

fn classify_exit(status: &std::process::ExitStatus, stderr_tail: &str) -> ScanError {
    if OOM_FINGERPRINTS
        .iter()
        .any(|fingerprint| stderr_tail.contains(fingerprint))
    {
        return ScanError::new(
            ScanErrorCode::Oom,
            "Worker ran out of memory (heap limit exceeded)",
        );
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGKILL without the allocator fingerprint and without our own
        // timer (which settles before this runs) points at the OS.
        if status.signal() == Some(nix::libc::SIGKILL) {
            return ScanError::new(
                ScanErrorCode::Oom,
                "Worker was killed by the OS (likely container OOM killer)",
            );
        }
    }

    let code = status
        .code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "none".to_string());
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status
            .signal()
            .map(|signal| signal.to_string())
            .unwrap_or_else(|| "none".to_string())
    };
    #[cfg(not(unix))]
    let signal = "none".to_string();

    ScanError::new(
        ScanErrorCode::Unknown,
        format!("Worker exited unexpectedly (code={code}, signal={signal})"),
    )
}

/// Fixed-capacity byte buffer that keeps the newest bytes written.
struct ByteRing {
    capacity: usize,
    bytes: std::collections::VecDeque<u8>,
}

impl ByteRing {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        for &byte in chunk {
            if self.bytes.len() == self.capacity {
                self.bytes.pop_front();
            }
            self.bytes.push_back(byte);
        }
    }

    fn to_string_lossy(&self) -> String {
        let bytes: Vec<u8> = self.bytes.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
