//! Consumer handles: the exclusive binary-log reader and the write-only
//! control channel.

use crate::engine::Journal;
use crate::interrupt::Interrupt;
use shall_error::{Result, ShallError};
use std::sync::atomic::Ordering;
use tracing::debug;

/// Exclusive blocking reader over the journal stream.
///
/// At most one may be open per mount; records are delivered at most once.
#[derive(Debug)]
pub struct LogReader {
    journal: Journal,
}

impl Journal {
    /// Open the binary-log reader; fails with `Busy` while another reader
    /// is open and with `NotMounted` once the journal is going away.
    pub fn open_reader(&self) -> Result<LogReader> {
        if !self.logs_valid().load(Ordering::Acquire) {
            return Err(ShallError::NotMounted("journal is shutting down".into()));
        }
        if self.logs_reading().swap(true, Ordering::SeqCst) {
            return Err(ShallError::Busy);
        }
        debug!(target: "shall::reader", "log_reader_opened");
        Ok(LogReader {
            journal: self.clone(),
        })
    }

    /// Open a control-channel handle; any number may be open concurrently.
    pub fn open_control(&self) -> Result<ControlChannel> {
        if !self.logs_valid().load(Ordering::Acquire) {
            return Err(ShallError::NotMounted("journal is shutting down".into()));
        }
        self.logs_writing().fetch_add(1, Ordering::SeqCst);
        Ok(ControlChannel {
            journal: self.clone(),
        })
    }
}

impl LogReader {
    /// Blocking read: drain available records into `buf`, or sleep until
    /// some arrive. Returns 0 at end-of-stream (unmount).
    pub fn read(&self, intr: &Interrupt, buf: &mut [u8]) -> Result<usize> {
        let journal = &self.journal;
        if !journal.logs_valid().load(Ordering::Acquire) {
            return Ok(0);
        }
        let n = journal.read_records(buf)?;
        if n > 0 {
            return Ok(n);
        }
        loop {
            journal.some_data_flag().store(false, Ordering::SeqCst);
            journal.wait_for_data(intr)?;
            // Read before honouring end-of-stream so the final records
            // (including the unmount log) are still delivered.
            let n = journal.read_records(buf)?;
            if n > 0 || !journal.logs_valid().load(Ordering::Acquire) {
                return Ok(n);
            }
        }
    }

    /// Non-blocking read: whatever is available right now.
    pub fn read_nonblocking(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.journal.logs_valid().load(Ordering::Acquire) {
            return Ok(0);
        }
        self.journal.read_records(buf)
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        self.journal.logs_reading().store(false, Ordering::SeqCst);
        debug!(target: "shall::reader", "log_reader_closed");
    }
}

/// Write-only control channel accepting newline-terminated commands:
/// `commit`, `clear <N>`, `userlog <text>`.
#[derive(Debug)]
pub struct ControlChannel {
    journal: Journal,
}

impl ControlChannel {
    /// Process every complete command line in `text`; returns the number
    /// of bytes consumed. A line without a terminating newline, or an
    /// unknown command, is invalid; if earlier lines already ran, their
    /// byte count is returned instead of the error.
    pub fn write(&self, intr: &Interrupt, text: &str) -> Result<usize> {
        let journal = &self.journal;
        let mut done = 0_usize;
        let mut failure: Option<ShallError> = None;

        let mut rest = text;
        while !rest.is_empty() {
            if !journal.logs_valid().load(Ordering::Acquire) {
                failure = Some(ShallError::NotMounted("journal is shutting down".into()));
                break;
            }
            let Some(newline) = rest.find('\n') else {
                failure = Some(ShallError::Format(
                    "control command missing newline terminator".into(),
                ));
                break;
            };
            let line = &rest[..newline];
            let consumed = newline + 1;
            match self.run_command(intr, line.trim_end_matches('\r')) {
                Ok(()) => {
                    done += consumed;
                    rest = &rest[consumed..];
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        match (done, failure) {
            (0, Some(err)) => Err(err),
            (done, _) => Ok(done),
        }
    }

    fn run_command(&self, intr: &Interrupt, line: &str) -> Result<()> {
        let journal = &self.journal;
        if line.is_empty() {
            return Ok(());
        }
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim_start()),
            None => (line, ""),
        };
        match command {
            "commit" => {
                debug!(target: "shall::control", "control_commit");
                journal.commit(intr)
            }
            "clear" => {
                let discard: u64 = rest
                    .parse()
                    .map_err(|_| ShallError::Format(format!("invalid clear count \"{rest}\"")))?;
                debug!(target: "shall::control", discard, "control_clear");
                if discard == 0 {
                    return Ok(());
                }
                journal.discard(discard).map(|_| ())
            }
            "userlog" => {
                debug!(target: "shall::control", len = rest.len(), "control_userlog");
                journal.log_userlog(intr, rest.as_bytes())
            }
            _ => Err(ShallError::Format(format!(
                "unknown control command \"{command}\""
            ))),
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.journal.logs_writing().fetch_sub(1, Ordering::SeqCst);
    }
}
