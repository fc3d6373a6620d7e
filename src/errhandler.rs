//! Central error-cadence dispatch. This is the single place that decides,
//! for a given [`StapleError`] and [`TaskContext`], whether to reschedule,
//! at what delay, and with what side effects (deleting a stale staple,
//! advancing the OCSP URL round-robin). Every stage worker routes its
//! failures through [`handle`] rather than deciding cadence itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing::{debug, error, warn};

use crate::error::StapleError;
use crate::model::RecordMap;
use crate::renewer;
use crate::scheduler::Scheduler;
use crate::task::TaskContext;

static LOG_DIR: OnceCell<PathBuf> = OnceCell::new();

/// Directory `stapled_exception<timestamp>.trace` files are written to.
/// Set once at startup from [`crate::config::Config::log_dir`]; falls back
/// to the system temp directory if never set (e.g. in unit tests).
pub fn set_log_dir(dir: PathBuf) {
    let _ = LOG_DIR.set(dir);
}

fn log_dir() -> PathBuf {
    LOG_DIR.get().cloned().unwrap_or_else(std::env::temp_dir)
}

/// Count of CRITICAL-level outcomes seen since process start: socket-fatal
/// errors, validation/parsing failures that can't be retried, and
/// unretriable give-ups. `one_off` mode consults this after the queues
/// drain to decide its exit code: nonzero if anything reached CRITICAL
/// severity during the run.
static CRITICAL_COUNT: AtomicU64 = AtomicU64::new(0);

/// Current critical-error count. Read by `main` after a `one_off` run.
pub fn critical_count() -> u64 {
    CRITICAL_COUNT.load(Ordering::Relaxed)
}

fn record_critical() {
    CRITICAL_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// What the dispatch decided to do with a failed task. Callers use this to
/// know whether they should still push the (possibly mutated) context back
/// onto the scheduler themselves, since `handle` owns rescheduling.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The task was rescheduled for a later attempt.
    Rescheduled,
    /// This class of error is permanent for this task; don't reschedule.
    GaveUp,
}

/// Route `err` for `ctx` to the appropriate cadence, update `ctx` in place
/// (exception counter, url index), and reschedule it on `scheduler` if the
/// cadence calls for a retry.
pub async fn handle(
    err: StapleError,
    ctx: &mut TaskContext,
    scheduler: &Scheduler,
    records: &RecordMap,
) -> Outcome {
    match &err {
        StapleError::CertFileAccess { .. } | StapleError::StapleAdderBadResponse(_) => {
            tiered_reschedule(&err, ctx, scheduler, false).await
        }
        StapleError::SocketFatal { reason, path } => {
            error!(file = %path.display(), reason, "fatal socket error, not retrying");
            record_critical();
            Outcome::GaveUp
        }
        StapleError::RenewalRequirementMissing { path, reason } => {
            error!(file = %path.display(), reason, "renewal requirement missing, won't retry until the file changes");
            record_critical();
            Outcome::GaveUp
        }
        StapleError::CertValidation { path, reason } => {
            delete_staple_file(path);
            error!(file = %path.display(), reason, "certificate validation failed, won't retry until the file changes");
            record_critical();
            Outcome::GaveUp
        }
        StapleError::CertParsing { path, reason, severity } => {
            match severity {
                crate::error::ParseSeverity::Critical => {
                    error!(file = %path.display(), reason, "certificate parsing failed");
                    record_critical();
                }
                crate::error::ParseSeverity::Info => {
                    debug!(file = %path.display(), reason, "certificate parsing skipped");
                }
            }
            Outcome::GaveUp
        }
        StapleError::OcspBadResponse { .. } => tiered_reschedule(&err, ctx, scheduler, false).await,
        StapleError::CertRevoked { path } => {
            delete_staple_file(path);
            error!(file = %path.display(), "certificate has been revoked, deleting staple and giving up");
            record_critical();
            Outcome::GaveUp
        }
        StapleError::Network { path, url, source } => {
            warn!(file = %path.display(), %url, error = %source, "OCSP request failed");
            network_reschedule(&err, ctx, scheduler, records).await
        }
        StapleError::Uncaught { path, source } => {
            error!(
                file = %path.display(),
                error = %source,
                "uncaught error processing task, dropping it; please report this"
            );
            write_exception_trace(path, source);
            record_critical();
            Outcome::GaveUp
        }
    }
    .tap_log(ctx)
}

trait TapLog {
    fn tap_log(self, ctx: &TaskContext) -> Self;
}

impl TapLog for Outcome {
    fn tap_log(self, ctx: &TaskContext) -> Self {
        if self == Outcome::GaveUp {
            warn!(subject = %ctx.subject.display(), task = ctx.stage.task_name(), "giving up on task");
        }
        self
    }
}

/// Shared cadence for `CertFileAccess`/`StapleAdderBadResponse` and
/// `OcspBadResponse`: every `err_count` minutes for the first 3 attempts,
/// then hourly for the next 3, then give up. `has_final_tier` exists for
/// callers that instead want a permanent twice-a-day tier in place of
/// giving up, but none of the current error kinds use it — per spec.md §7,
/// `OcspBadResponse` (an `unknown` responder status) uses exactly the same
/// cadence as `CertFileAccess`, including the eventual give-up. A `revoked`
/// status is a distinct `StapleError::CertRevoked` and never reaches this
/// function: it's permanent on the first failure, not after a tiered retry.
async fn tiered_reschedule(
    err: &StapleError,
    ctx: &mut TaskContext,
    scheduler: &Scheduler,
    has_final_tier: bool,
) -> Outcome {
    let count = ctx.record_exception(err);
    let delay_secs: Option<i64> = if count < 4 {
        Some(60 * count as i64)
    } else if count < 7 {
        Some(3600)
    } else if has_final_tier {
        Some(43_200)
    } else {
        None
    };

    match delay_secs {
        Some(secs) => {
            error!(error = %err, count, "retriable error, rescheduling");
            let at = Utc::now() + chrono::Duration::seconds(secs);
            ctx.reschedule(Some(at));
            scheduler.add_task(ctx.clone()).await;
            Outcome::Rescheduled
        }
        None => {
            error!(error = %err, count, "giving up after repeated failures");
            Outcome::GaveUp
        }
    }
}

/// Network-error cadence: round-robin the OCSP URL on every failure, with a
/// retry cadence that scales with how many URLs there are to cycle through.
async fn network_reschedule(
    err: &StapleError,
    ctx: &mut TaskContext,
    scheduler: &Scheduler,
    records: &RecordMap,
) -> Outcome {
    let Some(path) = err.path() else {
        return Outcome::GaveUp;
    };
    renewer::advance_url_index(records, path);
    let url_count = records
        .get(path)
        .map(|r| r.ocsp_urls.len().max(1))
        .unwrap_or(1);

    let count = ctx.record_exception(err);
    let delay_secs = if count < (3 * url_count as u32) + 1 {
        10
    } else if count < (6 * url_count as u32) + 1 {
        3600
    } else {
        43_200 / url_count as i64
    };

    error!(error = %err, count, url_count, delay_secs, "network error, rescheduling");
    let at = Utc::now() + chrono::Duration::seconds(delay_secs);
    ctx.reschedule(Some(at));
    scheduler.add_task(ctx.clone()).await;
    Outcome::Rescheduled
}

/// Write a stack-trace file for an uncaught error under [`log_dir`], named
/// `stapled_exception<unix-timestamp>.trace`, so an operator can find what
/// actually happened without having kept the log line around.
fn write_exception_trace(path: &Path, source: &anyhow::Error) {
    let dir = log_dir();
    let trace_path = dir.join(format!("stapled_exception{}.trace", Utc::now().timestamp()));
    let contents = format!("file: {}\nerror: {source:?}\n", path.display());
    if let Err(e) = std::fs::write(&trace_path, contents) {
        warn!(file = %trace_path.display(), error = %e, "could not write exception trace file");
    }
}

fn delete_staple_file(filename: &Path) {
    let mut staple_path = filename.to_path_buf().into_os_string();
    staple_path.push(".ocsp");
    let staple_path = Path::new(&staple_path);
    match std::fs::remove_file(staple_path) {
        Ok(()) => debug!(file = %staple_path.display(), "deleted stale OCSP staple"),
        Err(_) => debug!(file = %staple_path.display(), "no stale staple to delete"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::model::new_record_map;
    use crate::scheduler::Scheduler;
    use crate::task::Stage;
    use std::io;

    #[tokio::test]
    async fn cert_file_access_retries_then_gives_up() {
        let (scheduler, mut queues) = Scheduler::new();
        let records = new_record_map();
        let mut ctx = TaskContext::asap(Stage::Parse, PathBuf::from("/a.pem"));

        for expected_count in 1..=6u32 {
            let err = StapleError::CertFileAccess {
                path: PathBuf::from("/a.pem"),
                source: io::Error::new(io::ErrorKind::NotFound, "nope"),
            };
            let outcome = handle(err, &mut ctx, &scheduler, &records).await;
            assert_eq!(outcome, Outcome::Rescheduled, "count={expected_count}");
        }

        let err = StapleError::CertFileAccess {
            path: PathBuf::from("/a.pem"),
            source: io::Error::new(io::ErrorKind::NotFound, "nope"),
        };
        let outcome = handle(err, &mut ctx, &scheduler, &records).await;
        assert_eq!(outcome, Outcome::GaveUp);
        queues.parse.close();
    }

    /// A `reqwest::Error` we can embed in a `StapleError::Network` without
    /// making a real connection: an invalid URL fails at request-build time.
    async fn fake_network_error() -> reqwest::Error {
        reqwest::Client::new()
            .get("not a valid url")
            .send()
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn network_errors_escalate_across_different_urls_not_reset_by_them() {
        let (scheduler, _queues) = Scheduler::new();
        let records = new_record_map();
        let path = PathBuf::from("/a.pem");
        records.insert(
            path.clone(),
            {
                let mut rec = crate::model::CertRecord::new(
                    path.clone(),
                    path.clone(),
                    vec![],
                    std::time::SystemTime::now(),
                );
                rec.ocsp_urls = vec!["http://u1".into(), "http://u2".into()];
                rec
            },
        );
        let mut ctx = TaskContext::asap(Stage::Renew, path.clone());

        // 2 URLs: tier stays at 10s for the first 3*2=6 consecutive
        // failures, even though each failure reports a different URL as
        // `url_index` round-robins - §8's "visit each URL in turn before a
        // cadence-tier increase".
        for n in 1..=6u32 {
            let err = StapleError::Network {
                path: path.clone(),
                url: format!("http://u{}", ((n - 1) % 2) + 1),
                source: fake_network_error().await,
            };
            let before = ctx.sched_time;
            let outcome = handle(err, &mut ctx, &scheduler, &records).await;
            assert_eq!(outcome, Outcome::Rescheduled, "n={n}");
            let after = ctx.sched_time.unwrap();
            let delay = after - before.unwrap_or_else(chrono::Utc::now);
            assert!(delay.num_seconds() <= 10, "n={n} delay={delay}");
        }

        // The 7th consecutive failure crosses the 3*urls threshold and
        // escalates to the hourly tier.
        let err = StapleError::Network {
            path: path.clone(),
            url: "http://u1".into(),
            source: fake_network_error().await,
        };
        handle(err, &mut ctx, &scheduler, &records).await;
        let delay = ctx.sched_time.unwrap() - chrono::Utc::now();
        assert!(delay.num_seconds() > 1800, "expected hourly tier, got {delay}");
    }

    #[tokio::test]
    async fn renewal_requirement_missing_never_retries() {
        let (scheduler, _queues) = Scheduler::new();
        let records = new_record_map();
        let mut ctx = TaskContext::asap(Stage::Renew, PathBuf::from("/a.pem"));
        let err = StapleError::RenewalRequirementMissing {
            path: PathBuf::from("/a.pem"),
            reason: "no chain".into(),
        };
        assert_eq!(handle(err, &mut ctx, &scheduler, &records).await, Outcome::GaveUp);
    }

    #[tokio::test]
    async fn ocsp_bad_response_gives_up_like_cert_file_access() {
        let (scheduler, mut queues) = Scheduler::new();
        let records = new_record_map();
        let mut ctx = TaskContext::asap(Stage::Renew, PathBuf::from("/a.pem"));

        for expected_count in 1..=6u32 {
            let err = StapleError::OcspBadResponse {
                path: PathBuf::from("/a.pem"),
                reason: "unknown".into(),
            };
            let outcome = handle(err, &mut ctx, &scheduler, &records).await;
            assert_eq!(outcome, Outcome::Rescheduled, "count={expected_count}");
        }

        let err = StapleError::OcspBadResponse {
            path: PathBuf::from("/a.pem"),
            reason: "unknown".into(),
        };
        assert_eq!(handle(err, &mut ctx, &scheduler, &records).await, Outcome::GaveUp);
        queues.renew.close();
    }

    #[tokio::test]
    async fn cert_revoked_gives_up_on_the_first_failure_and_deletes_the_staple() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("a.pem");
        let staple_path = dir.path().join("a.pem.ocsp");
        std::fs::write(&staple_path, b"stale staple").unwrap();

        let (scheduler, _queues) = Scheduler::new();
        let records = new_record_map();
        let mut ctx = TaskContext::asap(Stage::Renew, cert_path.clone());

        let before = critical_count();
        let err = StapleError::CertRevoked { path: cert_path.clone() };
        let outcome = handle(err, &mut ctx, &scheduler, &records).await;

        assert_eq!(outcome, Outcome::GaveUp);
        assert!(!staple_path.exists(), "revoked certificate's staple should be deleted");
        assert_eq!(critical_count(), before + 1);
    }
}
