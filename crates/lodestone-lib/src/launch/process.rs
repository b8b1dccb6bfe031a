//! Spawning and supervision of game processes.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use super::encoding::decode_output;
use super::types::LaunchCommand;
use crate::utils::process::LauncherCommandExt;

const CRASH_REPORT_MARKER: &str = "Crash report saved to:";
/// Lines the client logs once its window is up and the sound system starts.
const WINDOW_READY_MARKERS: &[&str] = &["Sound engine started", "OpenAL initialized"];
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts the game process. Implementations must pipe stdout and stderr.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &LaunchCommand) -> io::Result<Child>;
}

/// Spawns the game detached from the launcher so it outlives it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSpawner;

impl ProcessSpawner for DetachedSpawner {
    fn spawn(&self, command: &LaunchCommand) -> io::Result<Child> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .suppress_console()
            .detach();
        cmd.spawn()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn event_name(self) -> &'static str {
        match self {
            OutputStream::Stdout => "minecraft-stdout",
            OutputStream::Stderr => "minecraft-stderr",
        }
    }
}

pub type LineCallback = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

#[derive(Debug, Default)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub duration: Duration,
    pub stderr: Vec<String>,
    pub crash_report_location: Option<String>,
    pub killed: bool,
}

#[derive(Default)]
struct Drained {
    lines: Vec<String>,
    crash_report_location: Option<String>,
}

/// Wait for `child` to exit while forwarding its output line by line.
/// A message on `kill` terminates the process.
pub async fn watch(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    on_line: LineCallback,
) -> io::Result<ProcessExit> {
    let started = Instant::now();
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, OutputStream::Stdout, on_line.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, OutputStream::Stderr, on_line)));

    let exited = tokio::select! {
        status = child.wait() => Some(status?),
        _ = kill_requested(kill) => None,
    };
    let killed = exited.is_none();
    let status = match exited {
        Some(status) => status,
        None => {
            log::info!("[launch] Killing game process {:?}", child.id());
            child.start_kill()?;
            child.wait().await?
        }
    };

    let mut exit = ProcessExit {
        code: status.code(),
        signal: exit_signal(&status),
        killed,
        ..Default::default()
    };
    for (handle, is_stderr) in [(stdout, false), (stderr, true)] {
        let Some(handle) = handle else { continue };
        match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
            Ok(Ok(drained)) => {
                if drained.crash_report_location.is_some() {
                    exit.crash_report_location = drained.crash_report_location;
                }
                if is_stderr {
                    exit.stderr = drained.lines;
                }
            }
            Ok(Err(e)) => log::warn!("[launch] Output reader failed: {}", e),
            Err(_) => log::warn!("[launch] Output did not drain within {:?}", DRAIN_TIMEOUT),
        }
    }
    exit.duration = started.elapsed();
    Ok(exit)
}

async fn kill_requested(kill: oneshot::Receiver<()>) {
    if kill.await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn pump<R>(reader: R, stream: OutputStream, on_line: LineCallback) -> Drained
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut drained = Drained::default();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                let line = decode_output(&buf);
                if let Some(location) = crash_report_location(&line) {
                    drained.crash_report_location = Some(location);
                }
                on_line(stream, &line);
                if stream == OutputStream::Stderr {
                    drained.lines.push(line);
                }
            }
            Err(e) => {
                log::warn!("[launch] Failed to read game {:?}: {}", stream, e);
                break;
            }
        }
    }
    drained
}

/// Extract the crash report path from a game log line.
pub fn crash_report_location(line: &str) -> Option<String> {
    let (_, rest) = line.split_once(CRASH_REPORT_MARKER)?;
    let path = trim_crash_report_path(rest.trim().trim_start_matches("#@!@#").trim());
    (!path.is_empty()).then(|| path.to_string())
}

/// Whether a game log line shows the client window is ready.
pub fn is_window_ready(line: &str) -> bool {
    WINDOW_READY_MARKERS.iter().any(|marker| line.contains(marker))
}

/// Cut everything after the `.txt` suffix; the game sometimes appends
/// trailing markers to the path.
pub fn trim_crash_report_path(location: &str) -> &str {
    match location.rfind(".txt") {
        Some(idx) => &location[..idx + 4],
        None => location,
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_report_path_is_trimmed_after_txt() {
        assert_eq!(
            trim_crash_report_path("/games/crash-reports/crash-2024-01-01_client.txt#@?@#"),
            "/games/crash-reports/crash-2024-01-01_client.txt"
        );
        assert_eq!(trim_crash_report_path("/no/suffix"), "/no/suffix");
        assert_eq!(
            crash_report_location(
                "#@!@# Game crashed! Crash report saved to: #@!@# /g/crash-reports/c.txt#@?@#"
            )
            .as_deref(),
            Some("/g/crash-reports/c.txt")
        );
        assert!(crash_report_location("[Render thread/INFO]: Stopping!").is_none());
    }

    #[test]
    fn window_ready_lines_are_recognized() {
        assert!(is_window_ready("[12:01:33] [Render thread/INFO]: Sound engine started"));
        assert!(is_window_ready("[Client thread/INFO]: OpenAL initialized."));
        assert!(!is_window_ready("[Render thread/INFO]: Setting user: Steve"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_forwarded_and_stderr_collected() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("echo out; echo err 1>&2; echo 'Crash report saved to: /tmp/c.txt!' 1>&2; exit 3")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (_kill_tx, kill_rx) = oneshot::channel();
        let exit = watch(
            child,
            kill_rx,
            Arc::new(move |stream, line: &str| sink.lock().unwrap().push((stream, line.to_string()))),
        )
        .await
        .unwrap();

        assert_eq!(exit.code, Some(3));
        assert!(!exit.killed);
        assert_eq!(exit.stderr, vec!["err", "Crash report saved to: /tmp/c.txt!"]);
        assert_eq!(exit.crash_report_location.as_deref(), Some("/tmp/c.txt"));
        assert!(seen.lock().unwrap().contains(&(OutputStream::Stdout, "out".to_string())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_the_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30").stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = cmd.spawn().unwrap();
        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(child, kill_rx, Arc::new(|_, _: &str| {})));
        kill_tx.send(()).unwrap();
        let exit = watcher.await.unwrap().unwrap();
        assert!(exit.killed);
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(libc::SIGKILL));
    }
}
