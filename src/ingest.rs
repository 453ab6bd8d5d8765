use crate::classify::{classify, split_lines};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{now, LogEntry, LogLevel, LogSource, NewProcess, Process, ProcessStatus};
use tracing::{debug, info};

/// How a wrapped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
}

/// Records the output and lifecycle of one wrapped process.
pub struct ProcessLogger<'a> {
    db: &'a Database,
    process: Process,
}

impl<'a> ProcessLogger<'a> {
    /// Create the process row and its start entry.
    pub fn start(db: &'a Database, new: NewProcess) -> Result<Self> {
        let logger = Self::register(db, &new)?;

        let pid = new
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        logger.synthetic(
            LogLevel::Info,
            LogSource::Stdout,
            &format!("Started process: {} (PID: {})", new.command, pid),
        )?;

        info!(process_id = %logger.process.id, name = %logger.process.name, "capturing process output");
        Ok(logger)
    }

    /// Create the process row without a start entry, for a command that
    /// never got as far as running.
    pub fn register(db: &'a Database, new: &NewProcess) -> Result<Self> {
        let process = db.create_process(new)?;
        Ok(ProcessLogger { db, process })
    }

    /// Wrap a process row that already exists.
    pub fn attach(db: &'a Database, process_id: &str) -> Result<Self> {
        let process = db
            .get_process(process_id)?
            .ok_or_else(|| Error::NotFound(format!("process {}", process_id)))?;
        Ok(ProcessLogger { db, process })
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn is_finished(&self) -> bool {
        self.process.status.is_terminal()
    }

    /// Store each non-empty line of `chunk` as its own entry. Every entry
    /// keeps the whole chunk as `raw_output`. Returns the number stored.
    pub fn log_chunk(&self, chunk: &str, source: LogSource) -> Result<usize> {
        let mut stored = 0;
        for line in split_lines(chunk) {
            self.db.add_log_entry(&LogEntry {
                id: None,
                process_id: self.process.id.clone(),
                process_name: None,
                timestamp: now(),
                level: classify(line, source),
                message: line.to_string(),
                raw_output: chunk.to_string(),
                source,
            })?;
            stored += 1;
        }
        Ok(stored)
    }

    pub fn exited(&mut self, exit: ExitKind) -> Result<()> {
        self.ensure_running()?;
        let (level, exit_code, message) = match exit {
            ExitKind::Code(code) => (
                if code == 0 { LogLevel::Info } else { LogLevel::Error },
                code,
                format!("Process exited with code {}", code),
            ),
            ExitKind::Signal(signal) => (
                LogLevel::Error,
                -1,
                format!("Process terminated by signal {}", signal),
            ),
        };

        self.synthetic(level, LogSource::Stdout, &message)?;
        self.finish(ProcessStatus::for_exit_code(exit_code), exit_code)
    }

    /// The command could not be started at all.
    pub fn spawn_failed(&mut self, detail: &str) -> Result<()> {
        self.ensure_running()?;
        self.synthetic(
            LogLevel::Error,
            LogSource::Stderr,
            &format!("Failed to start process: {}", detail),
        )?;
        self.finish(ProcessStatus::Failed, -1)
    }

    /// Record an external interrupt. Called before the signal is passed on
    /// to the child.
    pub fn interrupted(&mut self, signal: &str) -> Result<()> {
        self.ensure_running()?;
        self.synthetic(
            LogLevel::Info,
            LogSource::Stdout,
            &format!("Received {}, terminating process", signal),
        )?;
        self.finish(ProcessStatus::Failed, -1)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::InvalidTransition {
                id: self.process.id.clone(),
                status: self.process.status,
            });
        }
        Ok(())
    }

    fn synthetic(&self, level: LogLevel, source: LogSource, message: &str) -> Result<i64> {
        self.db.add_log_entry(&LogEntry {
            id: None,
            process_id: self.process.id.clone(),
            process_name: None,
            timestamp: now(),
            level,
            message: message.to_string(),
            raw_output: message.to_string(),
            source,
        })
    }

    fn finish(&mut self, status: ProcessStatus, exit_code: i32) -> Result<()> {
        let end_time = now();
        self.db
            .update_process_status(&self.process.id, status, Some(exit_code), Some(end_time))?;
        self.process.status = status;
        self.process.exit_code = Some(exit_code);
        self.process.end_time = Some(end_time);
        debug!(process_id = %self.process.id, status = %status, exit_code, "process logger finished");
        Ok(())
    }
}
