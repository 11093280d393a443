//! Bounded child-process calls used by the command-backed collaborators.
//!
//! Each call writes one request to stdin, waits with a timeout, and drains
//! stdout/stderr on helper threads so a chatty child cannot block on a full
//! pipe.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Maximum stderr bytes quoted in an error message.
const STDERR_EXCERPT_BYTES: usize = 2_000;

/// One command invocation.
#[derive(Debug, Clone)]
pub struct CommandCall<'a> {
    /// Program followed by its fixed arguments.
    pub argv: &'a [String],
    /// Extra arguments appended after `argv` (e.g. a gate verb).
    pub extra_args: &'a [&'a str],
    pub stdin: &'a [u8],
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Bytes kept from one output stream plus the count dropped past the limit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Capture {
    pub bytes: Vec<u8>,
    pub dropped: u64,
}

impl Capture {
    fn read_from<R: Read>(reader: R, limit: usize) -> io::Result<Self> {
        let mut bytes = Vec::new();
        let mut limited = reader.take(limit as u64);
        limited.read_to_end(&mut bytes)?;
        let dropped = io::copy(&mut limited.into_inner(), &mut io::sink())?;
        Ok(Self { bytes, dropped })
    }

    fn excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.bytes);
        let text = text.trim();
        if text.len() <= STDERR_EXCERPT_BYTES {
            return text.to_string();
        }
        let mut end = STDERR_EXCERPT_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

/// Finished child process.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub stdout: Capture,
    pub stderr: Capture,
}

impl CommandOutput {
    /// Stdout as UTF-8 after checking for timeout, failure and truncation.
    ///
    /// A truncated stdout is an error: the caller would otherwise judge a
    /// partial response.
    pub fn into_stdout(self, label: &str) -> Result<String> {
        if self.timed_out {
            bail!("{label} timed out");
        }
        if !self.status.success() {
            bail!(
                "{label} exited with status {:?}: {}",
                self.status.code(),
                self.stderr.excerpt()
            );
        }
        if self.stdout.dropped > 0 {
            bail!(
                "{label} stdout exceeded limit ({} bytes dropped)",
                self.stdout.dropped
            );
        }
        String::from_utf8(self.stdout.bytes).with_context(|| format!("{label} stdout is not UTF-8"))
    }
}

/// Run a command with a timeout and bounded output capture.
#[instrument(skip_all, fields(program = %call.argv.first().map(String::as_str).unwrap_or(""), timeout_secs = call.timeout.as_secs()))]
pub fn run_command(call: &CommandCall<'_>) -> Result<CommandOutput> {
    let (program, fixed_args) = call
        .argv
        .split_first()
        .ok_or_else(|| anyhow!("command must be a non-empty array"))?;

    let mut child = Command::new(program)
        .args(fixed_args)
        .args(call.extra_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn command {program}"))?;
    debug!("child spawned");

    let (stdout_reader, stderr_reader) = spawn_readers(&mut child, call.output_limit_bytes)?;
    let writer = spawn_writer(&mut child, call.stdin)?;

    let (status, timed_out) = match child.wait_timeout(call.timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = call.timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill timed-out command")?;
            (child.wait().context("reap killed command")?, true)
        }
    };

    // A killed child closes its end of the pipe, so the writer always ends.
    writer
        .join()
        .map_err(|_| anyhow!("stdin writer thread panicked"))?;
    let stdout = collect(stdout_reader).context("collect stdout")?;
    let stderr = collect(stderr_reader).context("collect stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output beyond limit discarded"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "command finished");

    Ok(CommandOutput {
        status,
        timed_out,
        stdout,
        stderr,
    })
}

type Reader = JoinHandle<io::Result<Capture>>;

fn spawn_readers(child: &mut Child, limit: usize) -> Result<(Reader, Reader)> {
    let stdout: ChildStdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout not captured"))?;
    let stderr: ChildStderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child stderr not captured"))?;
    Ok((
        thread::spawn(move || Capture::read_from(stdout, limit)),
        thread::spawn(move || Capture::read_from(stderr, limit)),
    ))
}

/// Write the request on a helper thread, then close stdin so the child sees
/// EOF. The timeout covers a child that never drains a large request.
fn spawn_writer(child: &mut Child, payload: &[u8]) -> Result<JoinHandle<()>> {
    let mut stdin: ChildStdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("child stdin not captured"))?;
    let payload = payload.to_vec();
    Ok(thread::spawn(move || {
        if let Err(err) = stdin.write_all(&payload) {
            // A child that exits without reading its input is judged by its status.
            warn!(err = %err, "child closed stdin early");
        }
    }))
}

fn collect(reader: Reader) -> Result<Capture> {
    reader
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
        .context("read child output")
}
