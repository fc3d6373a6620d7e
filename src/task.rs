//! Scheduled task contexts: the unit the scheduler moves between its tables
//! and the stage queues.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::StapleError;

/// Which stage queue a task belongs in. Mirrors the four worker pools plus
/// the admin-socket push stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Parse,
    Renew,
    ProxyAdd,
}

impl Stage {
    pub fn task_name(self) -> &'static str {
        match self {
            Stage::Parse => "parse",
            Stage::Renew => "renew",
            Stage::ProxyAdd => "proxy-add",
        }
    }
}

/// A task scheduled against a certificate's path. `subject` is the path the
/// task concerns; the scheduler keys its subject-cancellation index on this.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub stage: Stage,
    pub subject: PathBuf,
    /// `None` means "run ASAP": the scheduler bypasses the deadline table
    /// entirely and places the task directly on its stage queue.
    pub sched_time: Option<DateTime<Utc>>,
    /// Round-robin index into the certificate's OCSP responder URL list,
    /// advanced by `errhandler` on network errors.
    pub url_index: usize,
    last_exception_key: Option<String>,
    last_exception_count: u32,
}

impl TaskContext {
    pub fn new(stage: Stage, subject: PathBuf, sched_time: Option<DateTime<Utc>>) -> Self {
        TaskContext {
            stage,
            subject,
            sched_time,
            url_index: 0,
            last_exception_key: None,
            last_exception_count: 0,
        }
    }

    pub fn asap(stage: Stage, subject: PathBuf) -> Self {
        Self::new(stage, subject, None)
    }

    /// Reschedule this context to a new absolute time (or ASAP, if `None`).
    /// Returns the previous time so callers can log how much a deadline
    /// moved.
    pub fn reschedule(&mut self, new_time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        std::mem::replace(&mut self.sched_time, new_time)
    }

    /// Record that `err` just occurred while processing this task, and
    /// return how many *consecutive* times an error of the same kind has now
    /// been seen. Resets to 1 when the error kind differs from the last one
    /// recorded.
    ///
    /// Compares the error's [`StapleError::kind_key`] by value rather than
    /// by identity, so two separately constructed errors of the same kind
    /// still count as consecutive for the cadence in `errhandler`.
    pub fn record_exception(&mut self, err: &StapleError) -> u32 {
        let key = err.kind_key();
        let count = if self.last_exception_key.as_deref() == Some(key.as_str()) {
            self.last_exception_count + 1
        } else {
            1
        };
        self.last_exception_key = Some(key);
        self.last_exception_count = count;
        count
    }

    /// Drop the consecutive-exception counter, e.g. after a successful run.
    pub fn clear_exception(&mut self) {
        self.last_exception_key = None;
        self.last_exception_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_err(path: &str) -> StapleError {
        StapleError::CertFileAccess {
            path: PathBuf::from(path),
            source: io::Error::new(io::ErrorKind::NotFound, "nope"),
        }
    }

    #[test]
    fn consecutive_same_kind_increments() {
        let mut ctx = TaskContext::asap(Stage::Parse, PathBuf::from("/a.crt"));
        assert_eq!(ctx.record_exception(&io_err("/a.crt")), 1);
        assert_eq!(ctx.record_exception(&io_err("/a.crt")), 2);
        assert_eq!(ctx.record_exception(&io_err("/a.crt")), 3);
    }

    #[test]
    fn different_kind_resets_counter() {
        let mut ctx = TaskContext::asap(Stage::Renew, PathBuf::from("/a.crt"));
        assert_eq!(ctx.record_exception(&io_err("/a.crt")), 1);
        assert_eq!(ctx.record_exception(&io_err("/a.crt")), 2);
        let other = StapleError::SocketFatal {
            path: PathBuf::from("/a.crt"),
            reason: "broken pipe".into(),
        };
        assert_eq!(ctx.record_exception(&other), 1);
    }

    #[test]
    fn clear_resets_to_zero() {
        let mut ctx = TaskContext::asap(Stage::Parse, PathBuf::from("/a.crt"));
        ctx.record_exception(&io_err("/a.crt"));
        ctx.clear_exception();
        assert_eq!(ctx.record_exception(&io_err("/a.crt")), 1);
    }
}
