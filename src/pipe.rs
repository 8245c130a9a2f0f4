//! Owned ffmpeg/ffprobe subprocesses.

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::ffi::OsStr;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use tracing::debug;

const STDERR_TAIL_LINES: usize = 20;
const STDIN_BUFFER: usize = 4 * 1024 * 1024;

/// A running subprocess with piped stdin and/or stdout.
///
/// `finish` closes stdin and waits for a successful exit. Dropping an
/// unfinished pipe kills and reaps the child, so early returns never leave a
/// process behind.
pub struct ProcessPipe {
    label: String,
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: Option<ChildStdout>,
    stderr_tail: Option<JoinHandle<Vec<String>>>,
}

impl ProcessPipe {
    /// Start `program` with stdin piped (stdout discarded).
    pub fn spawn_writer<I, S>(program: &str, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self::spawn(program, args, true, false)
    }

    /// Start `program` with stdout piped (stdin closed).
    pub fn spawn_reader<I, S>(program: &str, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self::spawn(program, args, false, true)
    }

    fn spawn<I, S>(program: &str, args: I, pipe_in: bool, pipe_out: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if pipe_in { Stdio::piped() } else { Stdio::null() })
            .stdout(if pipe_out { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped());
        debug!("spawn {:?}", cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", program))?;
        let stdin = child
            .stdin
            .take()
            .map(|s| BufWriter::with_capacity(STDIN_BUFFER, s));
        let stdout = child.stdout.take();
        let stderr_tail = child.stderr.take().map(spawn_stderr_collector);

        Ok(Self {
            label: program.to_string(),
            child: Some(child),
            stdin,
            stdout,
            stderr_tail,
        })
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .with_context(|| format!("{} stdin already closed", self.label))?;
        stdin
            .write_all(buf)
            .with_context(|| format!("write to {} stdin", self.label))
    }

    /// Fill `buf` from stdout. Returns the byte count, which is short only at
    /// end of stream.
    pub fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stdout = self
            .stdout
            .as_mut()
            .with_context(|| format!("{} stdout not piped", self.label))?;
        read_exact_or_eof(stdout, buf)
    }

    /// Close stdin, wait, and fail on a non-zero exit.
    pub fn finish(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .flush()
                .with_context(|| format!("flush {} stdin", self.label))?;
        }
        self.stdout.take();
        let status = self.wait()?;
        let tail = self.take_stderr();
        if !status.success() {
            bail!(
                "{} failed status={} stderr_tail={}",
                self.label,
                status,
                fmt_tail(&tail)
            );
        }
        Ok(())
    }

    /// Stop a reader early (only the first frame was wanted) and reap it.
    pub fn abandon(mut self) {
        self.kill_and_reap();
    }

    fn wait(&mut self) -> Result<ExitStatus> {
        let mut child = self
            .child
            .take()
            .with_context(|| format!("{} already reaped", self.label))?;
        child
            .wait()
            .with_context(|| format!("wait for {}", self.label))
    }

    fn take_stderr(&mut self) -> Vec<String> {
        self.stderr_tail
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default()
    }

    fn kill_and_reap(&mut self) {
        self.stdin.take();
        self.stdout.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = self.take_stderr();
    }
}

impl Drop for ProcessPipe {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.kill_and_reap();
        }
    }
}

/// Run a short-lived tool to completion and return its stdout as text.
pub fn run_capture<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    debug!("run {:?}", cmd);
    let out = cmd
        .output()
        .with_context(|| format!("failed to run {}", program))?;
    if !out.status.success() {
        bail!(
            "{} failed status={} stderr={}",
            program,
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

pub fn read_exact_or_eof(r: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut got = 0usize;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) => return Ok(got),
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(got)
}

/// Last [`STDERR_TAIL_LINES`] non-blank stderr lines, for error messages.
fn spawn_stderr_collector(stderr: impl Read + Send + 'static) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES + 1);
        for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
        Vec::from(tail)
    })
}

fn fmt_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        "<no stderr>".to_string()
    } else {
        lines.join(" | ")
    }
}
