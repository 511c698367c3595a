//! Subprocess execution with captured output and a hard wall-clock bound.

use crate::error::BuildContext;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use wait_timeout::ChildExt;

type PipeReader = mpsc::Receiver<io::Result<Vec<u8>>>;
type StdinWriter = thread::JoinHandle<io::Result<()>>;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    pub fn context(&self) -> BuildContext {
        BuildContext::from_output(&self.stdout, &self.stderr, self.status.code())
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

#[derive(Debug)]
pub enum Completion {
    Finished(CommandOutput),
    /// The process was killed once the timeout expired
    TimedOut,
}

/// Runs `command` to completion, capturing stdout and stderr.
pub fn run(mut command: Command) -> io::Result<CommandOutput> {
    debug!(command = %describe(&command), "running");
    Ok(command.stdin(Stdio::null()).output()?.into())
}

/// Runs `command`, force-killing it when `timeout` expires.
///
/// On unix the child leads its own process group and the whole group is
/// killed, so processes it spawned die with it. Pipes are drained on
/// background threads and share the deadline: a background process still
/// holding stdout open when it passes counts as a timeout.
pub fn run_with_timeout(command: Command, timeout: Option<Duration>) -> io::Result<Completion> {
    let (completion, _) = spawn_bounded(command, None, timeout)?;
    Ok(completion)
}

/// Like [`run_with_timeout`], with `input` written to the child's stdin.
///
/// A failed write is returned only when the command failed too; a command
/// that succeeded has read all it needed.
pub fn run_with_input(command: Command, input: Vec<u8>, timeout: Option<Duration>) -> io::Result<Completion> {
    let (completion, writer) = spawn_bounded(command, Some(input), timeout)?;
    if let (Completion::Finished(output), Some(writer)) = (&completion, writer) {
        if !output.success() {
            writer
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "stdin writer thread panicked"))??;
        }
    }
    Ok(completion)
}

fn spawn_bounded(
    mut command: Command,
    input: Option<Vec<u8>>,
    timeout: Option<Duration>,
) -> io::Result<(Completion, Option<StdinWriter>)> {
    debug!(command = %describe(&command), ?timeout, "running with timeout");
    let deadline = timeout.map(|t| Instant::now() + t);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let stdin = if input.is_some() { Stdio::piped() } else { Stdio::null() };
    let mut child = command
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let writer = child.stdin.take().zip(input).map(|(mut stdin, input)| {
        thread::spawn(move || stdin.write_all(&input))
    });
    let stdout = spawn_pipe_reader(child.stdout.take());
    let stderr = spawn_pipe_reader(child.stderr.take());

    let status = match deadline {
        Some(deadline) => match child.wait_timeout(remaining(deadline))? {
            Some(status) => status,
            None => {
                kill(&mut child)?;
                return Ok((Completion::TimedOut, None));
            }
        },
        None => child.wait()?,
    };

    let (Some(stdout), Some(stderr)) = (
        collect_pipe(stdout, deadline)?,
        collect_pipe(stderr, deadline)?,
    ) else {
        debug!(pid = child.id(), "output still open at the deadline, killing process group");
        kill_group(&child)?;
        return Ok((Completion::TimedOut, None));
    };

    let output = CommandOutput {
        status,
        stdout,
        stderr,
    };
    Ok((Completion::Finished(output), writer))
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn kill(child: &mut Child) -> io::Result<()> {
    kill_group(child)?;
    match child.kill() {
        Ok(()) => {}
        // already exited between the timeout and the kill
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait()?;
    Ok(())
}

/// Kills the process group `child` leads.
#[cfg(unix)]
fn kill_group(child: &Child) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let pgid = i32::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // the group is already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) -> io::Result<()> {
    Ok(())
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Option<PipeReader>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut stream| {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = Vec::new();
            let read = stream.read_to_end(&mut buf).map(|_| buf);
            // nobody listens once the deadline passed
            tx.send(read).ok();
        });
        rx
    })
}

/// The pipe's contents, or `None` when it is still open at `deadline`.
fn collect_pipe(reader: Option<PipeReader>, deadline: Option<Instant>) -> io::Result<Option<Vec<u8>>> {
    let Some(reader) = reader else {
        return Ok(Some(Vec::new()));
    };
    let panicked = || io::Error::new(io::ErrorKind::Other, "pipe reader thread panicked");

    let read = match deadline {
        Some(deadline) => match reader.recv_timeout(remaining(deadline)) {
            Ok(read) => read,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => return Err(panicked()),
        },
        None => reader.recv().map_err(|_| panicked())?,
    };
    read.map(Some)
}

/// Human-readable command line, for logs and error messages
pub fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether `program` can be started at all
pub fn is_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        match run_with_timeout(cmd, Some(Duration::from_secs(10))).unwrap() {
            Completion::Finished(output) => {
                assert_eq!(output.stdout_str(), "out");
                assert_eq!(output.stderr_str(), "err");
                assert_eq!(output.status.code(), Some(3));
            }
            Completion::TimedOut => panic!("should not time out"),
        }
    }

    #[test]
    fn test_kills_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let completion = run_with_timeout(cmd, Some(Duration::from_millis(200))).unwrap();
        assert!(matches!(completion, Completion::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_background_output_holder_times_out() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 6 & echo hi"]);
        let started = Instant::now();
        let completion = run_with_timeout(cmd, Some(Duration::from_secs(1))).unwrap();
        assert!(matches!(completion, Completion::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_timeout_kills_spawned_processes() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!(
            "(sleep 2; touch '{}') >/dev/null 2>&1 & sleep 30",
            marker.display()
        ));

        let completion = run_with_timeout(cmd, Some(Duration::from_millis(500))).unwrap();
        assert!(matches!(completion, Completion::TimedOut));

        thread::sleep(Duration::from_secs(3));
        assert!(!marker.exists(), "background process outlived the timeout");
    }

    #[test]
    fn test_fast_command_with_deadline_finishes() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo done"]);
        match run_with_timeout(cmd, Some(Duration::from_secs(10))).unwrap() {
            Completion::Finished(output) => assert_eq!(output.stdout_str(), "done"),
            Completion::TimedOut => panic!("should not time out"),
        }
    }

    #[test]
    fn test_input_is_written_to_stdin() {
        let completion =
            run_with_input(Command::new("cat"), b"context".to_vec(), Some(Duration::from_secs(10))).unwrap();
        match completion {
            Completion::Finished(output) => assert_eq!(output.stdout, b"context"),
            Completion::TimedOut => panic!("should not time out"),
        }
    }

    #[test]
    fn test_failed_write_is_reported_when_command_fails() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        // larger than a pipe buffer, so the write can't complete
        let err = run_with_input(cmd, vec![0; 4 << 20], Some(Duration::from_secs(10))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_describe() {
        let mut cmd = Command::new("git");
        cmd.args(["fetch", "origin", "master"]);
        assert_eq!(describe(&cmd), "git fetch origin master");
    }
}
