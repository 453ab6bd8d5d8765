//! Wraps a child process and feeds its output to a [`ProcessLogger`].
//!
//! Reader threads echo each read to the console, reassemble whole lines and
//! push them into a bounded queue. The calling thread drains the queue and
//! owns every store write, so a slow store only stalls the readers once the
//! queue is full. Interrupt and termination signals are recorded and then
//! passed on to the child.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::ingest::{ExitKind, ProcessLogger};
use crate::models::{LogSource, NewProcess};
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::thread;
use tracing::{error, warn};

#[cfg(unix)]
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};

#[cfg(not(unix))]
const SIGINT: i32 = 2;

const QUEUE_CAPACITY: usize = 1024;
const READ_BUFFER: usize = 8 * 1024;

/// A partial line longer than this is stored without waiting for its end.
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Exit status reported for a command that could not be started.
pub const SPAWN_FAILURE_EXIT: i32 = 127;

enum RunEvent {
    Chunk(LogSource, String),
    Closed,
    Interrupt(i32),
}

/// Run `argv` under `name`, capturing its output until it exits.
/// Returns the exit status to hand back to the shell.
pub fn run_command(db: &Database, name: &str, argv: &[String]) -> Result<i32> {
    supervise(db, name, argv, install_signal_listener)
}

fn supervise<L>(db: &Database, name: &str, argv: &[String], listen: L) -> Result<i32>
where
    L: FnOnce(SyncSender<RunEvent>) -> SignalListener,
{
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::validation("no command given"))?;
    let command_line = argv.join(" ");

    let spawned = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let mut logger = ProcessLogger::register(
                db,
                &NewProcess {
                    name: name.to_string(),
                    command: command_line,
                    pid: None,
                },
            )?;
            logger.spawn_failed(&e.to_string())?;
            eprintln!("Failed to start '{}': {}", program, e);
            return Ok(SPAWN_FAILURE_EXIT);
        }
    };

    let mut logger = ProcessLogger::start(
        db,
        NewProcess {
            name: name.to_string(),
            command: command_line,
            pid: Some(child.id()),
        },
    )?;

    let (tx, rx) = sync_channel::<RunEvent>(QUEUE_CAPACITY);

    let mut open_streams = 0;
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, LogSource::Stdout, tx.clone());
        open_streams += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, LogSource::Stderr, tx.clone());
        open_streams += 1;
    }

    let _listener = listen(tx.clone());
    drop(tx);

    let mut received: Option<i32> = None;
    while open_streams > 0 {
        let Ok(event) = rx.recv() else { break };
        match event {
            RunEvent::Chunk(source, chunk) => {
                if let Err(e) = logger.log_chunk(&chunk, source) {
                    error!(error = %e, "failed to store output");
                }
            }
            RunEvent::Closed => open_streams -= 1,
            RunEvent::Interrupt(signal) if received.is_some() => {
                warn!(signal = %signal_name(signal), "second signal, killing child");
                if let Err(e) = child.kill() {
                    warn!(error = %e, "could not kill child");
                }
            }
            RunEvent::Interrupt(signal) => {
                received = Some(signal);
                if let Err(e) = logger.interrupted(&signal_name(signal)) {
                    error!(error = %e, "failed to record interrupt");
                }
                if let Err(e) = forward_signal(&mut child, signal) {
                    warn!(error = %e, "could not signal child");
                }
            }
        }
    }

    let status = child.wait()?;
    let exit = match status.code() {
        Some(code) => ExitKind::Code(code),
        None => ExitKind::Signal(exit_signal(&status)),
    };

    if !logger.is_finished() {
        logger.exited(exit)?;
    }

    Ok(match (received, exit) {
        (Some(signal), _) => 128 + signal,
        (None, ExitKind::Code(code)) => code,
        (None, ExitKind::Signal(signal)) => 128 + signal,
    })
}

/// Keeps interrupt and termination signals flowing into the run loop
/// until dropped.
struct SignalListener {
    #[cfg(unix)]
    handle: Option<signal_hook::iterator::Handle>,
}

impl SignalListener {
    fn inactive() -> Self {
        SignalListener {
            #[cfg(unix)]
            handle: None,
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Some(handle) = self.handle.take() {
                handle.close();
            }
        }
    }
}

#[cfg(unix)]
fn install_signal_listener(tx: SyncSender<RunEvent>) -> SignalListener {
    let mut signals = match signal_hook::iterator::Signals::new([SIGINT, SIGTERM, SIGHUP]) {
        Ok(signals) => signals,
        Err(e) => {
            warn!(error = %e, "could not install signal handlers");
            return SignalListener::inactive();
        }
    };
    let handle = signals.handle();

    let spawned = thread::Builder::new()
        .name("proclog-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                if tx.send(RunEvent::Interrupt(signal)).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "could not start signal listener");
        handle.close();
        return SignalListener::inactive();
    }

    SignalListener {
        handle: Some(handle),
    }
}

#[cfg(not(unix))]
fn install_signal_listener(tx: SyncSender<RunEvent>) -> SignalListener {
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(RunEvent::Interrupt(SIGINT));
    }) {
        warn!(error = %e, "could not install interrupt handler");
    }
    SignalListener::inactive()
}

fn signal_name(signal: i32) -> String {
    match signal {
        SIGINT => "SIGINT".to_string(),
        #[cfg(unix)]
        SIGTERM => "SIGTERM".to_string(),
        #[cfg(unix)]
        SIGHUP => "SIGHUP".to_string(),
        other => format!("signal {}", other),
    }
}

#[cfg(unix)]
fn forward_signal(child: &mut Child, signal: i32) -> io::Result<()> {
    let pid = child.id() as libc::pid_t;
    // SAFETY: the child has not been waited on, so its pid is still ours.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn forward_signal(child: &mut Child, _signal: i32) -> io::Result<()> {
    child.kill()
}

fn spawn_reader<R>(mut stream: R, source: LogSource, tx: SyncSender<RunEvent>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; READ_BUFFER];
        let mut lines = LineAssembler::default();
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    echo(source, &buf[..n]);
                    if let Some(chunk) = lines.push(&buf[..n]) {
                        if tx.send(RunEvent::Chunk(source, chunk)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, source = %source, "read from child failed");
                    break;
                }
            }
        }
        if let Some(rest) = lines.finish() {
            let _ = tx.send(RunEvent::Chunk(source, rest));
        }
        let _ = tx.send(RunEvent::Closed);
    });
}

/// Holds back a trailing partial line until the rest of it is read, so a
/// line split across reads is stored once and multibyte characters stay
/// whole.
#[derive(Default)]
struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    /// Every complete line buffered so far, as one chunk.
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let end = match self.pending.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None if self.pending.len() >= MAX_PENDING_LINE => utf8_boundary(&self.pending),
            None => return None,
        };
        if end == 0 {
            return None;
        }
        let ready: Vec<u8> = self.pending.drain(..end).collect();
        Some(String::from_utf8_lossy(&ready).into_owned())
    }

    /// Whatever is left once the stream closes.
    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

fn echo(source: LogSource, bytes: &[u8]) {
    let _ = match source {
        LogSource::Stdout => {
            let mut out = io::stdout().lock();
            out.write_all(bytes).and_then(|_| out.flush())
        }
        LogSource::Stderr => {
            let mut err = io::stderr().lock();
            err.write_all(bytes).and_then(|_| err.flush())
        }
    };
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> i32 {
    0
}

#[cfg(test)]
mod line_tests {
    use super::*;

    #[test]
    fn split_line_is_emitted_once() {
        let mut lines = LineAssembler::default();
        assert_eq!(lines.push(b"first half, "), None);
        assert_eq!(
            lines.push(b"second half\nnext"),
            Some("first half, second half\n".to_string())
        );
        assert_eq!(lines.finish(), Some("next".to_string()));
    }

    #[test]
    fn multibyte_character_split_across_reads_stays_whole() {
        let bytes = "größe\n".as_bytes();
        let mut lines = LineAssembler::default();
        assert_eq!(lines.push(&bytes[..3]), None);
        assert_eq!(lines.push(&bytes[3..]), Some("größe\n".to_string()));
    }

    #[test]
    fn oversized_partial_line_keeps_incomplete_character() {
        let mut bytes = vec![b'a'; MAX_PENDING_LINE - 1];
        bytes.extend_from_slice(&"é".as_bytes()[..1]);
        let mut lines = LineAssembler::default();

        let flushed = lines.push(&bytes).unwrap();
        assert_eq!(flushed.len(), MAX_PENDING_LINE - 1);
        assert!(!flushed.contains('\u{FFFD}'));
        assert_eq!(lines.push(&"é".as_bytes()[1..]), None);
        assert_eq!(lines.finish(), Some("é".to_string()));
    }

    #[test]
    fn empty_stream_leaves_nothing() {
        assert_eq!(LineAssembler::default().finish(), None);
    }
}
