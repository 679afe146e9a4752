//! Engine pipeline, run inside the isolated worker process: clone the
//! repository, run the external scanner, stream the report back as batches.
//!
//! The engine reports every failure it can classify as an `Error` frame and
//! then exits 0, so the manager can tell reported failures apart from silent
//! crashes. The scratch directory is owned by a `TempDir` guard and removed
//! on every exit path, including when the manager's SIGTERM drops the
//! in-flight pipeline future.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::Command;

use crate::config::{Config, EXEC_MAX_BUFFER, VULN_BATCH_SIZE};
use crate::ipc::{self, WorkerEvent, WorkerRequest};
use crate::report::{self, ReportError, ReportSummary};
use crate::types::{ScanError, ScanErrorCode, ScanStatus, Vulnerability};

const DISK_FULL_FINGERPRINTS: &[&str] = &["no space left on device", "disk quota exceeded"];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub git_bin: String,
    pub trivy_bin: String,
    pub clone_timeout: Duration,
    pub scan_timeout: Duration,
    pub batch_size: usize,
    pub max_capture: usize,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            git_bin: "git".to_string(),
            trivy_bin: "trivy".to_string(),
            clone_timeout: config.clone_timeout,
            scan_timeout: config.scan_timeout,
            batch_size: VULN_BATCH_SIZE,
            max_capture: EXEC_MAX_BUFFER,
        }
    }
}

/// Worker entrypoint: connect back to the orchestrator, run one job, report
/// the outcome, exit.
pub async fn run_worker(socket_path: &Path, config: EngineConfig) -> Result<()> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("cannot connect to {}", socket_path.display()))?;

    let payload = ipc::read_frame(&mut stream)
        .await
        .context("reading start message")?
        .context("channel closed before start message")?;
    let WorkerRequest::Start { scan_id, repo_url } = ipc::decode_request(&payload)
        .context("decoding start message")?
        .context("unexpected message before start")?;

    ipc::write_frame(
        &mut stream,
        &WorkerEvent::Status {
            scan_id: scan_id.clone(),
            status: ScanStatus::Scanning,
        },
    )
    .await
    .context("reporting scan start")?;

    #[cfg(unix)]
    let mut term =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;

    // A SIGTERM from the manager drops the pipeline future, which drops the
    // scratch directory guard and with it the clone and the report file.
    let outcome = tokio::select! {
        outcome = run_pipeline(&mut stream, &scan_id, &repo_url, &config) => outcome,
        _ = term.recv() => {
            tracing::warn!(%scan_id, "terminated while scanning");
            return Ok(());
        }
    };

    let terminal = match outcome {
        Ok(summary) => {
            tracing::info!(%scan_id, kept = summary.kept, seen = summary.seen, "scan finished");
            WorkerEvent::Status {
                scan_id: scan_id.clone(),
                status: ScanStatus::Finished,
            }
        }
        Err(error) => {
            tracing::warn!(%scan_id, %error, "scan failed");
            WorkerEvent::Error {
                scan_id: scan_id.clone(),
                error,
            }
        }
    };
    ipc::write_frame(&mut stream, &terminal)
        .await
        .context("sending terminal message")?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// Clone → scan → stream-parse. The scratch directory lives exactly as long
/// as this future.
async fn run_pipeline<W: AsyncWrite + Unpin>(
    stream: &mut W,
    scan_id: &str,
    repo_url: &str,
    config: &EngineConfig,
) -> Result<ReportSummary, ScanError> {
    let workspace = tempfile::Builder::new()
        .prefix("repo-sentry-")
        .tempdir()
        .map_err(|err| classify_workspace_failure(&err))?;

    let repo_dir = workspace.path().join("repo");
    clone_repository(config, repo_url, &repo_dir).await?;

    let report_path = workspace.path().join("trivy-report.json");
    run_scanner(config, &repo_dir, &report_path).await?;

    stream_report(stream, scan_id, &report_path, config.batch_size).await
}

fn classify_workspace_failure(err: &std::io::Error) -> ScanError {
    let message = err.to_string();
    if is_disk_full(&message) {
        ScanError::new(ScanErrorCode::DiskFull, format!("cannot create scratch directory: {message}"))
    } else {
        ScanError::new(ScanErrorCode::CloneFailed, format!("cannot create scratch directory: {message}"))
    }
}

async fn clone_repository(config: &EngineConfig, repo_url: &str, dest: &Path) -> Result<(), ScanError> {
    let mut cmd = Command::new(&config.git_bin);
    cmd.args(["clone", "--depth", "1", "--single-branch", "--no-tags"])
        .arg(repo_url)
        .arg(dest)
        // Fail fast instead of hanging on a credential prompt.
        .env("GIT_TERMINAL_PROMPT", "0");

    match run_command(&mut cmd, config.clone_timeout, config.max_capture).await {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => {
            if is_disk_full(&output.stderr) {
                Err(ScanError::new(
                    ScanErrorCode::DiskFull,
                    format!("disk full while cloning: {}", stderr_excerpt(&output.stderr)),
                ))
            } else {
                Err(ScanError::new(
                    ScanErrorCode::CloneFailed,
                    format!(
                        "git clone failed (exit {}): {}",
                        describe_exit(&output.status),
                        stderr_excerpt(&output.stderr)
                    ),
                ))
            }
        }
        Err(ExecFailure::TimedOut) => Err(ScanError::new(
            ScanErrorCode::Timeout,
            format!("Clone timed out after {} s", config.clone_timeout.as_secs()),
        )),
        Err(ExecFailure::Spawn(err)) if err.kind() == std::io::ErrorKind::NotFound => Err(
            ScanError::new(
                ScanErrorCode::CloneFailed,
                format!("{} binary not found on PATH", config.git_bin),
            ),
        ),
        Err(ExecFailure::Spawn(err)) | Err(ExecFailure::Io(err)) => Err(ScanError::new(
            ScanErrorCode::CloneFailed,
            format!("git clone failed: {err}"),
        )),
    }
}

async fn run_scanner(config: &EngineConfig, repo_dir: &Path, report_path: &Path) -> Result<(), ScanError> {
    let mut cmd = Command::new(&config.trivy_bin);
    cmd.args(["fs", "--format", "json", "--output"])
        .arg(report_path)
        .args(["--severity", "CRITICAL", "--scanners", "vuln", "--quiet"])
        .arg(repo_dir);

    match run_command(&mut cmd, config.scan_timeout, config.max_capture).await {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => {
            if is_disk_full(&output.stderr) {
                Err(ScanError::new(
                    ScanErrorCode::DiskFull,
                    format!("disk full while scanning: {}", stderr_excerpt(&output.stderr)),
                ))
            } else {
                Err(ScanError::new(
                    ScanErrorCode::TrivyFailed,
                    format!(
                        "trivy failed (exit {}): {}",
                        describe_exit(&output.status),
                        stderr_excerpt(&output.stderr)
                    ),
                ))
            }
        }
        Err(ExecFailure::TimedOut) => Err(ScanError::new(
            ScanErrorCode::Timeout,
            format!("Scan timed out after {} s", config.scan_timeout.as_secs()),
        )),
        Err(ExecFailure::Spawn(err)) if err.kind() == std::io::ErrorKind::NotFound => Err(
            ScanError::new(
                ScanErrorCode::TrivyFailed,
                format!(
                    "{} binary not found on PATH. Is trivy installed?",
                    config.trivy_bin
                ),
            ),
        ),
        Err(ExecFailure::Spawn(err)) | Err(ExecFailure::Io(err)) => Err(ScanError::new(
            ScanErrorCode::TrivyFailed,
            format!("trivy failed: {err}"),
        )),
    }
}

/// Stream the report file through the severity filter into `Vulns` frames.
/// The parser runs on a blocking thread; a bounded channel of one batch
/// keeps the engine's footprint flat regardless of report size.
async fn stream_report<W: AsyncWrite + Unpin>(
    stream: &mut W,
    scan_id: &str,
    report_path: &Path,
    batch_size: usize,
) -> Result<ReportSummary, ScanError> {
    let file = std::fs::File::open(report_path).map_err(|err| {
        ScanError::new(
            ScanErrorCode::ParseFailed,
            format!("scanner report missing: {err}"),
        )
    })?;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<Vulnerability>>(1);
    let parser = tokio::task::spawn_blocking(move || {
        let reader = std::io::BufReader::new(file);
        let mut sink = |batch: Vec<Vulnerability>| {
            tx.blocking_send(batch)
                .map_err(|_| "orchestrator channel closed".to_string())
        };
        report::parse_report(reader, batch_size, &mut sink)
    });

    while let Some(batch) = rx.recv().await {
        ipc::write_frame(
            stream,
            &WorkerEvent::Vulns {
                scan_id: scan_id.to_string(),
                vulnerabilities: batch,
            },
        )
        .await
        .map_err(|err| ScanError::new(ScanErrorCode::Unknown, format!("IPC write failed: {err}")))?;
    }

    match parser.await {
        Ok(Ok(summary)) => Ok(summary),
        Ok(Err(ReportError::Sink(message))) => Err(ScanError::new(
            ScanErrorCode::Unknown,
            format!("batch delivery failed: {message}"),
        )),
        Ok(Err(err @ ReportError::Json(_))) => {
            Err(ScanError::new(ScanErrorCode::ParseFailed, err.to_string()))
        }
        Err(join_err) => Err(ScanError::new(
            ScanErrorCode::ParseFailed,
            format!("report parser crashed: {join_err}"),
        )),
    }
}

struct ExecOutput {
    status: std::process::ExitStatus,
    stderr: String,
}

#[derive(Debug)]
enum ExecFailure {
    TimedOut,
    Spawn(std::io::Error),
    Io(std::io::Error),
}

/// Run a subprocess with a wall-clock timeout and a size-bounded stderr
/// capture. Stdout is discarded; both external tools write their results to
/// files. On timeout the child is killed and reaped.
async fn run_command(
    cmd: &mut Command,
    timeout: Duration,
    max_capture: usize,
) -> Result<ExecOutput, ExecFailure> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // The manager caps this process's address space; the tools we shell out
    // to need the headroom back.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            use nix::sys::resource::{getrlimit, setrlimit, Resource};
            let (_, hard) = getrlimit(Resource::RLIMIT_AS).map_err(std::io::Error::from)?;
            setrlimit(Resource::RLIMIT_AS, hard, hard).map_err(std::io::Error::from)
        });
    }

    let mut child = cmd.spawn().map_err(ExecFailure::Spawn)?;
    let stderr_pipe = child.stderr.take();

    let capture = async {
        let mut captured = Vec::new();
        if let Some(mut pipe) = stderr_pipe {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        // Keep the head, but keep draining so the child
                        // never blocks on a full pipe.
                        let room = max_capture.saturating_sub(captured.len());
                        captured.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
        }
        captured
    };

    let wait_both = async { tokio::join!(child.wait(), capture) };
    let waited = tokio::time::timeout(timeout, wait_both).await;
    match waited {
        Ok((status, stderr)) => {
            let status = status.map_err(ExecFailure::Io)?;
            Ok(ExecOutput {
                status,
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(ExecFailure::TimedOut)
        }
    }
}

fn is_disk_full(text: &str) -> bool {
    let lower = text.to_lowercase();
    DISK_FULL_FINGERPRINTS
        .iter()
        .any(|fingerprint| lower.contains(fingerprint))
}

fn describe_exit(status: &std::process::ExitStatus) -> String {
    status
        .code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

/// Last chunk of stderr, trimmed to keep error messages readable.
fn stderr_excerpt(stderr: &str) -> String {
    const MAX: usize = 400;
    let trimmed = stderr.trim();
    if trimmed.len() <= MAX {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - MAX;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("… {}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn engine_config(git_bin: &str, trivy_bin: &str) -> EngineConfig {
        EngineConfig {
            git_bin: git_bin.to_string(),
            trivy_bin: trivy_bin.to_string(),
            clone_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(5),
            batch_size: 50,
            max_capture: EXEC_MAX_BUFFER,
        }
    }

    /// Write an executable shell script into `dir` and return its path.
    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn run_command_times_out_and_kills() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 30"]);
        let result = run_command(&mut cmd, Duration::from_millis(100), 1024).await;
        assert!(matches!(result, Err(ExecFailure::TimedOut)));
    }

    #[tokio::test]
    async fn run_command_caps_stderr_capture() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "head -c 100000 /dev/zero 1>&2"]);
        let output = run_command(&mut cmd, Duration::from_secs(5), 1000)
            .await
            .unwrap();
        assert!(output.status.success());
        assert!(output.stderr.len() <= 1000);
    }

    #[tokio::test]
    async fn clone_classifies_disk_full() {
        let dir = tempfile::tempdir().unwrap();
        let fake_git = script(
            dir.path(),
            "git",
            "echo 'fatal: write error: No space left on device' >&2\nexit 128",
        );
        let config = engine_config(&fake_git, "trivy");
        let err = clone_repository(&config, "https://github.com/o/r", &dir.path().join("repo"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ScanErrorCode::DiskFull);
    }

    #[tokio::test]
    async fn clone_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let fake_git = script(
            dir.path(),
            "git",
            "echo 'fatal: repository not found' >&2\nexit 128",
        );
        let config = engine_config(&fake_git, "trivy");
        let err = clone_repository(&config, "https://github.com/o/r", &dir.path().join("repo"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ScanErrorCode::CloneFailed);
        assert!(err.message.contains("repository not found"));
    }

    #[tokio::test]
    async fn clone_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let fake_git = script(dir.path(), "git", "sleep 30");
        let mut config = engine_config(&fake_git, "trivy");
        config.clone_timeout = Duration::from_millis(100);
        let err = clone_repository(&config, "https://github.com/o/r", &dir.path().join("repo"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ScanErrorCode::Timeout);
    }

    #[tokio::test]
    async fn missing_scanner_binary_gets_install_hint() {
        let dir = tempfile::tempdir().unwrap();
        let config = engine_config("git", "/nonexistent/trivy");
        let err = run_scanner(&config, dir.path(), &dir.path().join("report.json"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ScanErrorCode::TrivyFailed);
        assert!(err.message.contains("Is trivy installed?"));
    }

    #[tokio::test]
    async fn missing_report_is_parse_failed() {
        let (mut tx, _rx) = tokio::io::duplex(4096);
        let err = stream_report(&mut tx, "s1", Path::new("/nonexistent/report.json"), 50)
            .await
            .unwrap_err();
        assert_eq!(err.code, ScanErrorCode::ParseFailed);
    }

    #[tokio::test]
    async fn pipeline_streams_batches_from_fake_tools() {
        let dir = tempfile::tempdir().unwrap();
        let fake_git = script(dir.path(), "git", "mkdir -p \"$7\"");
        let fake_trivy = script(
            dir.path(),
            "trivy",
            r#"out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--output" ]; then out="$arg"; fi
  prev="$arg"
done
cat > "$out" <<'EOF'
{"Results":[{"Target":"Cargo.lock","Vulnerabilities":[
  {"VulnerabilityID":"CVE-2021-44228","PkgName":"log4j-core","InstalledVersion":"2.14.1","FixedVersion":"2.17.0","Severity":"CRITICAL","Title":"Log4Shell","Description":"rce"},
  {"VulnerabilityID":"CVE-1","PkgName":"a","InstalledVersion":"1","Severity":"HIGH"},
  {"VulnerabilityID":"CVE-2","PkgName":"b","InstalledVersion":"2","Severity":"CRITICAL"}
]}]}
EOF"#,
        );

        let mut config = engine_config(&fake_git, &fake_trivy);
        config.batch_size = 1;

        let (mut tx, mut rx) = tokio::io::duplex(64 * 1024);
        let summary = run_pipeline(&mut tx, "s1", "https://github.com/o/r", &config)
            .await
            .unwrap();
        assert_eq!(summary.kept, 2);
        assert_eq!(summary.seen, 3);
        drop(tx);

        let mut ids = Vec::new();
        while let Some(payload) = ipc::read_frame(&mut rx).await.unwrap() {
            if let Some(WorkerEvent::Vulns { vulnerabilities, .. }) =
                ipc::decode_event(&payload).unwrap()
            {
                ids.extend(vulnerabilities.into_iter().map(|vuln| vuln.id));
            }
        }
        assert_eq!(ids, ["CVE-2021-44228", "CVE-2"]);
    }
}
