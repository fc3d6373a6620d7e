//! The deadline scheduler: holds tasks until their scheduled time arrives,
//! then hands them to the appropriate stage queue. Tasks scheduled with no
//! time (ASAP) skip the deadline table entirely.
//!
//! Rust's equivalent of a `threading.Thread` running a 1-second poll loop is
//! a `tokio::spawn`ed task driven by `tokio::time::interval`; the deadline
//! table itself is guarded by a single `tokio::sync::Mutex` since add/cancel/
//! dispatch all need a consistent view of the three indexes together (by
//! time, by task id, by subject) — unlike `RecordMap`, these operations are
//! not independent per key, so a sharded map wouldn't help.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::task::{Stage, TaskContext};

pub type TaskId = u64;

struct Inner {
    next_id: TaskId,
    /// sched_time -> task ids due at that time.
    by_time: BTreeMap<DateTime<Utc>, Vec<TaskId>>,
    /// task id -> (context, scheduled time) for every task currently waiting
    /// in the deadline table (not yet dispatched to a stage queue).
    pending: HashMap<TaskId, (TaskContext, DateTime<Utc>)>,
    /// subject path -> task ids scheduled for it, for `cancel_by_subject`.
    by_subject: HashMap<PathBuf, Vec<TaskId>>,
}

impl Inner {
    fn new() -> Self {
        Inner {
            next_id: 0,
            by_time: BTreeMap::new(),
            pending: HashMap::new(),
            by_subject: HashMap::new(),
        }
    }

    fn insert(&mut self, ctx: TaskContext, at: DateTime<Utc>) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.by_time.entry(at).or_default().push(id);
        self.by_subject.entry(ctx.subject.clone()).or_default().push(id);
        self.pending.insert(id, (ctx, at));
        id
    }

    fn remove(&mut self, id: TaskId) -> Option<(TaskContext, DateTime<Utc>)> {
        let (ctx, at) = self.pending.remove(&id)?;
        if let Some(v) = self.by_time.get_mut(&at) {
            v.retain(|&x| x != id);
            if v.is_empty() {
                self.by_time.remove(&at);
            }
        }
        if let Some(v) = self.by_subject.get_mut(&ctx.subject) {
            v.retain(|&x| x != id);
            if v.is_empty() {
                self.by_subject.remove(&ctx.subject);
            }
        }
        Some((ctx, at))
    }
}

/// Handle shared by every producer/consumer of scheduled tasks.
pub struct Scheduler {
    inner: Mutex<Inner>,
    senders: HashMap<Stage, mpsc::UnboundedSender<TaskContext>>,
    /// Count of task contexts currently alive somewhere in the pipeline:
    /// on the deadline heap, sitting in a stage queue, or being worked on
    /// by a consumer that hasn't yet called [`Scheduler::task_done`].
    /// `one_off` mode's drain loop polls this instead of the deadline
    /// table alone, since a task already dispatched to a stage queue (or
    /// in flight at a worker) is invisible to `is_idle`'s old
    /// deadline-table-only check.
    outstanding: AtomicI64,
}

/// Paired with [`Scheduler`]; each stage's worker pool owns the receiving
/// half so only that pool can pull work off its queue.
pub struct StageQueues {
    pub parse: mpsc::UnboundedReceiver<TaskContext>,
    pub renew: mpsc::UnboundedReceiver<TaskContext>,
    pub proxy_add: mpsc::UnboundedReceiver<TaskContext>,
}

impl Scheduler {
    pub fn new() -> (Self, StageQueues) {
        let (parse_tx, parse_rx) = mpsc::unbounded_channel();
        let (renew_tx, renew_rx) = mpsc::unbounded_channel();
        let (proxy_tx, proxy_rx) = mpsc::unbounded_channel();
        let mut senders = HashMap::new();
        senders.insert(Stage::Parse, parse_tx);
        senders.insert(Stage::Renew, renew_tx);
        senders.insert(Stage::ProxyAdd, proxy_tx);
        (
            Scheduler {
                inner: Mutex::new(Inner::new()),
                senders,
                outstanding: AtomicI64::new(0),
            },
            StageQueues {
                parse: parse_rx,
                renew: renew_rx,
                proxy_add: proxy_rx,
            },
        )
    }

    /// Schedule `ctx`. If `ctx.sched_time` is `None` the task is dispatched
    /// to its stage queue immediately, bypassing the deadline table.
    pub async fn add_task(&self, ctx: TaskContext) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let Some(at) = ctx.sched_time else {
            self.dispatch(ctx);
            return;
        };
        let mut inner = self.inner.lock().await;
        self.cancel_subject_locked(&mut inner, &ctx.subject);
        let task_name = ctx.stage.task_name();
        let subject = ctx.subject.clone();
        inner.insert(ctx, at);
        info!(task = task_name, subject = %subject.display(), at = %at, "scheduled");
    }

    /// Cancel every task pending for `subject`. Tasks already dispatched to
    /// a stage queue can no longer be cancelled.
    pub async fn cancel_by_subject(&self, subject: &Path) {
        let mut inner = self.inner.lock().await;
        self.cancel_subject_locked(&mut inner, subject);
    }

    fn cancel_subject_locked(&self, inner: &mut Inner, subject: &Path) {
        let ids = inner.by_subject.get(subject).cloned().unwrap_or_default();
        if ids.is_empty() {
            return;
        }
        let removed = ids.len() as i64;
        for id in ids {
            inner.remove(id);
        }
        self.outstanding.fetch_sub(removed, Ordering::SeqCst);
    }

    fn dispatch(&self, ctx: TaskContext) {
        if let Some(tx) = self.senders.get(&ctx.stage) {
            let _ = tx.send(ctx);
        }
    }

    /// Mark the most recently dequeued task for the calling worker as fully
    /// handled. Every stage worker calls this exactly once per task it
    /// pulls off its queue, after the task either completes or is routed
    /// through `errhandler::handle` — including when that routing
    /// reschedules a *new* task context via `add_task`, since that call
    /// already accounted for the successor.
    pub fn task_done(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run the dispatch loop: every `tick` interval, move every task whose
    /// deadline has passed onto its stage queue, logging how late it was if
    /// that's more than a second.
    pub async fn run(&self, tick: Duration, stop: &tokio::sync::Notify) {
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => self.run_due().await,
                _ = stop.notified() => break,
            }
        }
    }

    /// Single pass: dispatch everything due at or before now. Exposed
    /// separately from [`Scheduler::run`] so `one_off` mode can drain the
    /// table deterministically without waiting on the tick interval.
    pub async fn run_due(&self) {
        let now = Utc::now();
        let due: Vec<DateTime<Utc>> = {
            let inner = self.inner.lock().await;
            inner.by_time.range(..=now).map(|(k, _)| *k).collect()
        };
        for sched_time in due {
            let ids = {
                let mut inner = self.inner.lock().await;
                inner.by_time.remove(&sched_time).unwrap_or_default()
            };
            for id in ids {
                let ctx = {
                    let mut inner = self.inner.lock().await;
                    inner.remove(id).map(|(ctx, _)| ctx)
                };
                let Some(ctx) = ctx else { continue };
                log_lateness(&ctx, sched_time, Utc::now());
                self.dispatch(ctx);
            }
        }
    }

    /// True if no task context is waiting in the deadline table, sitting in
    /// a stage queue, or being worked on by a consumer that hasn't yet
    /// called [`Scheduler::task_done`]. Used by `one_off` shutdown to know
    /// the pipeline has fully drained before exiting.
    pub async fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) <= 0
    }
}

fn log_lateness(ctx: &TaskContext, sched_time: DateTime<Utc>, now: DateTime<Utc>) {
    let late = now - sched_time;
    let seconds = late.num_seconds();
    if seconds < 1 {
        debug!(task = ctx.stage.task_name(), subject = %ctx.subject.display(), "queued on time");
    } else if seconds < 59 {
        debug!(task = ctx.stage.task_name(), subject = %ctx.subject.display(), seconds, "queued late");
    } else {
        warn!(task = ctx.stage.task_name(), subject = %ctx.subject.display(), ?late, "queued very late");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn asap_task_bypasses_deadline_table() {
        let (sched, mut queues) = Scheduler::new();
        sched
            .add_task(TaskContext::asap(Stage::Parse, PathBuf::from("/a.pem")))
            .await;
        let ctx = queues.parse.recv().await.unwrap();
        assert_eq!(ctx.subject, PathBuf::from("/a.pem"));
        sched.task_done();
        assert!(sched.is_idle().await);
    }

    #[tokio::test]
    async fn rescheduling_same_subject_cancels_prior_entry() {
        let (sched, mut queues) = Scheduler::new();
        let far_future = Utc::now() + chrono::Duration::seconds(3600);
        sched
            .add_task(TaskContext::new(Stage::Renew, PathBuf::from("/a.pem"), Some(far_future)))
            .await;
        // Re-scheduling the same subject should cancel the first entry, not
        // add a second one.
        sched
            .add_task(TaskContext::asap(Stage::Renew, PathBuf::from("/a.pem")))
            .await;
        let ctx = queues.renew.recv().await.unwrap();
        assert_eq!(ctx.subject, PathBuf::from("/a.pem"));
        sched.task_done();
        assert!(sched.is_idle().await);
    }

    #[tokio::test]
    async fn cancel_by_subject_removes_pending_task() {
        let (sched, mut queues) = Scheduler::new();
        let soon = Utc::now() + chrono::Duration::seconds(3600);
        sched
            .add_task(TaskContext::new(Stage::Parse, PathBuf::from("/a.pem"), Some(soon)))
            .await;
        sched.cancel_by_subject(Path::new("/a.pem")).await;
        assert!(sched.is_idle().await);
        assert!(queues.parse.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_due_dispatches_expired_tasks() {
        let (sched, mut queues) = Scheduler::new();
        let past = Utc::now() - chrono::Duration::seconds(5);
        sched
            .add_task(TaskContext::new(Stage::Parse, PathBuf::from("/a.pem"), Some(past)))
            .await;
        sched.run_due().await;
        let ctx = tokio::time::timeout(StdDuration::from_secs(1), queues.parse.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.subject, PathBuf::from("/a.pem"));
    }
}
