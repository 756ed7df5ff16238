// src/worker/install/mod.rs

//! Install supervisor
//!
//! Runs the package-manager child that unpacks and configures packages. The
//! child gets a pseudo-terminal as its controlling terminal (maintainer
//! scripts expect one) and a second descriptor, the status channel, on which
//! it writes the line protocol decoded by [`status`].
//!
//! The supervisor exclusively owns the pty master, the status channel and
//! the child. Every exit path releases them: if the supervisor is dropped
//! before the child has been reaped, the child is killed and reaped.
//!
//! # Child contract
//!
//! - The status channel descriptor number is exported as
//!   `PKGWORKER_STATUS_FD`, and `{status_fd}` in the arguments is replaced
//!   with it.
//! - Configuration file questions are answered on the same channel with
//!   `Y\n` (install the new file) or `N\n` (keep the old one).
//! - Exit code 0 means completed, 1 failed, 2 incomplete.

pub mod status;

pub use status::{StatusDecoder, StatusEvent, parse_line};

use crate::error::{Error, Result};
use crate::transaction::Transaction;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Environment variable carrying the status channel descriptor
pub const STATUS_FD_ENV: &str = "PKGWORKER_STATUS_FD";

/// Placeholder in child arguments replaced by the status descriptor
pub const STATUS_FD_PLACEHOLDER: &str = "{status_fd}";

/// The child to run
#[derive(Debug, Clone, Default)]
pub struct InstallCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl InstallCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Exit code 0
    Completed,
    /// Exit code 1, or any code outside the taxonomy
    Failed(i32),
    /// Exit code 2: some packages were left unconfigured
    Incomplete,
    /// Terminated by a signal
    Killed(Signal),
}

impl InstallOutcome {
    fn from_code(code: i32) -> Self {
        match code {
            0 => InstallOutcome::Completed,
            2 => InstallOutcome::Incomplete,
            other => InstallOutcome::Failed(other),
        }
    }
}

/// Text codec for terminal output, picked from the locale codeset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCodec {
    Utf8,
    Latin1,
}

impl TextCodec {
    /// Codec for `lang_COUNTRY.CODESET@modifier`
    ///
    /// A locale without a codeset (`C`, `POSIX`, `de_DE`) decodes as UTF-8
    /// with replacement of invalid sequences.
    pub fn from_locale(locale: &str) -> Self {
        let codeset = locale
            .split_once('.')
            .map(|(_, rest)| rest.split('@').next().unwrap_or(rest))
            .unwrap_or("")
            .to_ascii_lowercase()
            .replace(['-', '_'], "");

        match codeset.as_str() {
            "iso88591" | "iso885915" | "latin1" | "latin9" => TextCodec::Latin1,
            _ => TextCodec::Utf8,
        }
    }

    /// Decode as much of `pending` as forms complete characters
    ///
    /// An incomplete UTF-8 sequence at the end stays in `pending` for the
    /// next read.
    pub fn decode(&self, pending: &mut Vec<u8>) -> String {
        match self {
            TextCodec::Latin1 => pending.drain(..).map(char::from).collect(),
            TextCodec::Utf8 => {
                let keep = match std::str::from_utf8(pending) {
                    Ok(_) => 0,
                    Err(e) if e.error_len().is_none() => pending.len() - e.valid_up_to(),
                    Err(_) => 0,
                };
                let split = pending.len() - keep;
                let text = String::from_utf8_lossy(&pending[..split]).into_owned();
                pending.drain(..split);
                text
            }
        }
    }
}

/// Effective locale for the child: the transaction's, else the daemon's
fn effective_locale(requested: &str) -> String {
    if !requested.is_empty() {
        return requested.to_string();
    }
    ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "C".to_string())
}

/// Data collected by one non-blocking poll
#[derive(Debug, Default)]
pub struct PollBatch {
    pub events: Vec<Result<StatusEvent>>,
    pub output: String,
}

/// Owner of a running install child
pub struct InstallSupervisor {
    pid: Pid,
    master: File,
    master_open: bool,
    status: UnixStream,
    status_open: bool,
    decoder: StatusDecoder,
    codec: TextCodec,
    pending_output: Vec<u8>,
    outcome: Option<InstallOutcome>,
}

impl InstallSupervisor {
    /// Poll cadence of the supervision loop (20 Hz)
    pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Spawn the child attached to a fresh pty
    pub fn spawn(command: &InstallCommand, locale: &str) -> Result<Self> {
        let pty = nix::pty::openpty(None, None)
            .map_err(|e| Error::SpawnError(format!("Failed to open pty: {}", e)))?;
        let (status, child_status) = UnixStream::pair()
            .map_err(|e| Error::SpawnError(format!("Failed to create status channel: {}", e)))?;

        let child_fd = child_status.as_raw_fd();
        let locale = effective_locale(locale);
        let codec = TextCodec::from_locale(&locale);

        let args: Vec<String> = command
            .args
            .iter()
            .map(|a| a.replace(STATUS_FD_PLACEHOLDER, &child_fd.to_string()))
            .collect();

        let mut cmd = Command::new(&command.program);
        cmd.args(&args)
            .stdin(stdio_for(&pty.slave)?)
            .stdout(stdio_for(&pty.slave)?)
            .stderr(stdio_for(&pty.slave)?)
            .env(STATUS_FD_ENV, child_fd.to_string())
            .env("LANG", &locale)
            .env("LC_ALL", &locale)
            .env("TERM", "xterm");
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(io::Error::from)?;
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                let flags = libc::fcntl(child_fd, libc::F_GETFD);
                if flags == -1 || libc::fcntl(child_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            Error::SpawnError(format!("Failed to spawn {}: {}", command.program.display(), e))
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        info!("Started install child {} (pid {})", command.program.display(), pid);

        // Parent copies of the child ends must go, or EOF never arrives
        drop(cmd);
        drop(child_status);
        drop(pty.slave);

        let master = File::from(pty.master);
        set_nonblocking(&master)?;
        status.set_nonblocking(true)?;

        Ok(Self {
            pid,
            master,
            master_open: true,
            status,
            status_open: true,
            decoder: StatusDecoder::new(),
            codec,
            pending_output: Vec::new(),
            outcome: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Read whatever both streams have ready without blocking
    pub fn poll(&mut self) -> Result<PollBatch> {
        let mut batch = PollBatch::default();

        let mut raw = Vec::new();
        read_available(&mut self.status, &mut self.status_open, &mut raw)?;
        batch.events = self.decoder.feed(&raw);
        if !self.status_open
            && let Some(last) = self.decoder.finish()
        {
            batch.events.push(last);
        }

        read_available(&mut self.master, &mut self.master_open, &mut self.pending_output)?;
        batch.output = self.codec.decode(&mut self.pending_output);
        Ok(batch)
    }

    /// Non-blocking exit check; reaps the child once
    pub fn try_exit(&mut self) -> Result<Option<InstallOutcome>> {
        if let Some(outcome) = self.outcome {
            return Ok(Some(outcome));
        }
        let outcome = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => InstallOutcome::from_code(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => InstallOutcome::Killed(signal),
            Ok(_) => return Ok(None),
            Err(e) => return Err(Error::SpawnError(format!("Wait failed: {}", e))),
        };
        debug!("Install child {} exited: {:?}", self.pid, outcome);
        self.outcome = Some(outcome);
        Ok(Some(outcome))
    }

    /// Answer a configuration file question
    pub fn answer_config_file(&mut self, replace: bool) -> Result<()> {
        let reply: &[u8] = if replace { b"Y\n" } else { b"N\n" };
        // The socket is non-blocking; a two-byte reply fits any buffer
        self.status.write_all(reply)?;
        Ok(())
    }

    /// Kill and reap the child if it is still running
    pub fn kill(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        warn!("Killing install child {}", self.pid);
        let _ = kill(self.pid, Signal::SIGKILL);
        match waitpid(self.pid, None) {
            Ok(WaitStatus::Signaled(_, signal, _)) => self.outcome = Some(InstallOutcome::Killed(signal)),
            Ok(WaitStatus::Exited(_, code)) => self.outcome = Some(InstallOutcome::from_code(code)),
            _ => self.outcome = Some(InstallOutcome::Killed(Signal::SIGKILL)),
        }
    }
}

impl Drop for InstallSupervisor {
    fn drop(&mut self) {
        self.kill();
    }
}

fn stdio_for(fd: &OwnedFd) -> Result<Stdio> {
    let dup = fd
        .try_clone()
        .map_err(|e| Error::SpawnError(format!("Failed to duplicate pty: {}", e)))?;
    Ok(Stdio::from(dup))
}

fn set_nonblocking(file: &File) -> Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: plain fcntl on a descriptor we own
    let ok = unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        flags != -1 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != -1
    };
    if ok {
        Ok(())
    } else {
        Err(io::Error::last_os_error().into())
    }
}

fn read_available<R: Read>(reader: &mut R, open: &mut bool, sink: &mut Vec<u8>) -> Result<()> {
    let mut buf = [0u8; 4096];
    while *open {
        match reader.read(&mut buf) {
            Ok(0) => *open = false,
            Ok(n) => sink.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // Linux reports a closed pty slave as EIO on the master
            Err(e) if e.raw_os_error() == Some(libc::EIO) => *open = false,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Run `command` for `transaction`, mapping child progress into
/// `[begin, end]`
///
/// Blocks the calling (worker) thread until the child exits. Cancellation
/// is not honored here: the worker clears `cancellable` before calling.
pub fn supervise(
    transaction: &Transaction,
    command: &InstallCommand,
    begin: u32,
    end: u32,
) -> Result<InstallOutcome> {
    let mut supervisor = InstallSupervisor::spawn(command, &transaction.locale())?;

    loop {
        // Check for exit before draining so the final lines are not lost
        let exited = supervisor.try_exit()?;
        let batch = supervisor.poll()?;
        handle_batch(transaction, &mut supervisor, batch, begin, end)?;

        if let Some(outcome) = exited {
            let batch = supervisor.poll()?;
            handle_batch(transaction, &mut supervisor, batch, begin, end)?;
            info!("Install child finished: {:?}", outcome);
            return Ok(outcome);
        }
        std::thread::sleep(InstallSupervisor::POLL_INTERVAL);
    }
}

fn handle_batch(
    transaction: &Transaction,
    supervisor: &mut InstallSupervisor,
    batch: PollBatch,
    begin: u32,
    end: u32,
) -> Result<()> {
    if !batch.output.is_empty() {
        for line in batch.output.lines().filter(|l| !l.trim().is_empty()) {
            debug!("[pm] {}", line.trim_end());
        }
        transaction.append_terminal_output(&batch.output);
    }

    for event in batch.events {
        match event {
            Ok(StatusEvent::Progress { package, percent, detail }) => {
                trace!("pmstatus {} {}%", package, percent);
                transaction.set_progress(begin + percent * end.saturating_sub(begin) / 100);
                transaction.set_status_details(detail);
            }
            Ok(StatusEvent::Error { package, message, .. }) => {
                transaction.append_error_detail(format!("{}: {}", package, message));
            }
            Ok(StatusEvent::ConfigFile { old_path, new_path, .. }) => {
                info!("Configuration file conflict: {} vs {}", old_path, new_path);
                let replace = transaction
                    .prompt_config_file(&old_path, &new_path)
                    .unwrap_or(false);
                supervisor.answer_config_file(replace)?;
            }
            Ok(StatusEvent::Other { tag, .. }) => trace!("Ignoring status tag {}", tag),
            Err(e) => warn!("Unreadable status line: {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_from_locale() {
        assert_eq!(TextCodec::from_locale("de_DE.UTF-8"), TextCodec::Utf8);
        assert_eq!(TextCodec::from_locale("de_DE.ISO-8859-1"), TextCodec::Latin1);
        assert_eq!(TextCodec::from_locale("fr_FR.iso885915@euro"), TextCodec::Latin1);
        assert_eq!(TextCodec::from_locale("C"), TextCodec::Utf8);
    }

    #[test]
    fn test_utf8_decode_keeps_partial_sequence() {
        let mut pending = "Größe".as_bytes().to_vec();
        // Cut in the middle of the two-byte 'ö'
        let tail = pending.split_off(3);
        let text = TextCodec::Utf8.decode(&mut pending);
        assert_eq!(text, "Gr");
        assert_eq!(pending.len(), 1);

        pending.extend_from_slice(&tail);
        assert_eq!(TextCodec::Utf8.decode(&mut pending), "öße");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_latin1_decode() {
        let mut pending = vec![b'G', 0xF6, b'l'];
        assert_eq!(TextCodec::Latin1.decode(&mut pending), "Göl");
    }

    #[test]
    fn test_outcome_from_code() {
        assert_eq!(InstallOutcome::from_code(0), InstallOutcome::Completed);
        assert_eq!(InstallOutcome::from_code(1), InstallOutcome::Failed(1));
        assert_eq!(InstallOutcome::from_code(2), InstallOutcome::Incomplete);
        assert_eq!(InstallOutcome::from_code(100), InstallOutcome::Failed(100));
    }

    fn script(body: &str) -> InstallCommand {
        InstallCommand::new("/bin/sh").arg("-c").arg(body)
    }

    fn run_to_exit(supervisor: &mut InstallSupervisor) -> (Vec<StatusEvent>, String, InstallOutcome) {
        let mut events = Vec::new();
        let mut output = String::new();
        loop {
            let exited = supervisor.try_exit().unwrap();
            let batch = supervisor.poll().unwrap();
            events.extend(batch.events.into_iter().filter_map(|e| e.ok()));
            output.push_str(&batch.output);
            if let Some(outcome) = exited {
                let batch = supervisor.poll().unwrap();
                events.extend(batch.events.into_iter().filter_map(|e| e.ok()));
                output.push_str(&batch.output);
                return (events, output, outcome);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_child_reports_on_status_channel() {
        let command = script(
            "echo 'pmstatus:foo:50:Unpacking foo' >&$PKGWORKER_STATUS_FD; \
             echo hello from the terminal; \
             echo 'pmerror:foo:60:broken' >&$PKGWORKER_STATUS_FD; exit 1",
        );
        let mut supervisor = InstallSupervisor::spawn(&command, "C.UTF-8").unwrap();
        let (events, output, outcome) = run_to_exit(&mut supervisor);

        assert_eq!(outcome, InstallOutcome::Failed(1));
        assert!(output.contains("hello from the terminal"));
        assert_eq!(
            events[0],
            StatusEvent::Progress {
                package: "foo".into(),
                percent: 50,
                detail: "Unpacking foo".into(),
            }
        );
        assert!(matches!(events[1], StatusEvent::Error { .. }));
    }

    #[test]
    fn test_child_has_controlling_terminal() {
        let mut supervisor = InstallSupervisor::spawn(&script("test -t 0 && exit 0; exit 2"), "").unwrap();
        let (_, _, outcome) = run_to_exit(&mut supervisor);
        assert_eq!(outcome, InstallOutcome::Completed);
    }

    #[test]
    fn test_config_file_reply_reaches_child() {
        let command = script(
            "echo \"pmconffile:/etc/x:10:'/etc/x' '/etc/x.new'\" >&$PKGWORKER_STATUS_FD; \
             read answer <&$PKGWORKER_STATUS_FD; \
             test \"$answer\" = Y",
        );
        let mut supervisor = InstallSupervisor::spawn(&command, "").unwrap();
        let mut answered = false;
        loop {
            let exited = supervisor.try_exit().unwrap();
            let batch = supervisor.poll().unwrap();
            for event in batch.events.into_iter().flatten() {
                if let StatusEvent::ConfigFile { .. } = event {
                    supervisor.answer_config_file(true).unwrap();
                    answered = true;
                }
            }
            if let Some(outcome) = exited {
                assert!(answered);
                assert_eq!(outcome, InstallOutcome::Completed);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_drop_kills_child() {
        let supervisor = InstallSupervisor::spawn(&script("sleep 30"), "").unwrap();
        let pid = supervisor.pid();
        drop(supervisor);
        // Reaped: the pid no longer refers to our child
        assert!(waitpid(pid, Some(WaitPidFlag::WNOHANG)).is_err());
    }

    #[test]
    fn test_spawn_failure() {
        let result = InstallSupervisor::spawn(&InstallCommand::new("/nonexistent/pm-helper"), "");
        assert!(matches!(result, Err(Error::SpawnError(_))));
    }
}
