//! Spawns and supervises every pipeline component as a `tokio` task,
//! restarting any that die (up to [`MAX_RESTART_THREADS`] times each) and
//! coordinating graceful shutdown, including `one_off` mode's drain-then-exit
//! behaviour.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, MAX_RESTART_THREADS};
use crate::errhandler;
use crate::finder::{Finder, FinderConfig};
use crate::model::{new_record_map, RecordMap};
use crate::parser::{self, ParserConfig};
use crate::renewer::Renewer;
use crate::scheduler::Scheduler;
use crate::staple_adder::StapleAdder;
use crate::task::{Stage, TaskContext};

type SharedRx = Arc<Mutex<mpsc::UnboundedReceiver<TaskContext>>>;

pub struct Supervisor {
    config: Config,
    records: RecordMap,
    scheduler: Arc<Scheduler>,
    stop: Arc<Notify>,
}

impl Supervisor {
    pub fn new(config: Config) -> (Self, crate::scheduler::StageQueues) {
        let (scheduler, queues) = Scheduler::new();
        (
            Supervisor {
                config,
                records: new_record_map(),
                scheduler: Arc::new(scheduler),
                stop: Arc::new(Notify::new()),
            },
            queues,
        )
    }

    pub fn stop_handle(&self) -> Arc<Notify> {
        self.stop.clone()
    }

    /// Start every component and run until shutdown. In `one_off` mode this
    /// returns once the finder has completed one pass and every queue has
    /// drained; otherwise it runs until `stop_handle()` is notified.
    pub async fn run(self, queues: crate::scheduler::StageQueues) -> anyhow::Result<()> {
        crate::errhandler::set_log_dir(self.config.log_dir.clone());
        let haproxy_mapping = build_haproxy_mapping(&self.config);

        info!(
            extensions = ?self.config.file_extensions,
            threads = self.config.renewal_threads,
            "starting OCSP stapling daemon"
        );

        let mut tasks: Vec<(&'static str, RestartableTask)> = Vec::new();

        tasks.push(self.spawn_scheduler_task());

        // Always spawn the proxy-adder, even with an empty mapping: the
        // Renewer unconditionally emits a `proxy-add` task after every
        // successful renewal, so something must drain that queue or
        // `one_off` mode's drain-until-idle would wait forever on tasks
        // nobody consumes. `StapleAdder::add_staple` already no-ops when a
        // certificate's path has no configured sockets, so this costs
        // nothing when there's genuinely nothing to push to.
        let adder = Arc::new(StapleAdder::new(haproxy_mapping, self.config.haproxy_socket_keepalive).await);
        let rx: SharedRx = Arc::new(Mutex::new(queues.proxy_add));
        tasks.push(self.spawn_proxy_adder_task(adder, rx));

        let renewer = Arc::new(Renewer::new()?);
        let renew_rx: SharedRx = Arc::new(Mutex::new(queues.renew));
        let minimum_validity = chrono::Duration::seconds(self.config.minimum_validity as i64);
        for _ in 0..self.config.renewal_threads.max(1) {
            tasks.push(self.spawn_renewer_task(renewer.clone(), renew_rx.clone(), minimum_validity, self.config.one_off));
        }

        let parser_config = Arc::new(ParserConfig {
            minimum_validity: chrono::Duration::seconds(self.config.minimum_validity as i64),
            no_recycle: self.config.no_recycle,
        });
        let parse_rx: SharedRx = Arc::new(Mutex::new(queues.parse));
        tasks.push(self.spawn_parser_task(parser_config, parse_rx));

        let finder_config = FinderConfig {
            cert_paths: self.config.cert_paths.clone(),
            file_extensions: self.config.file_extensions.clone(),
            recursive: self.config.recursive,
            ignore: crate::finder::filter_relative_patterns(self.config.ignore.clone()),
            refresh_interval: self.config.refresh_interval.map(Duration::from_secs),
        };
        let finder = Arc::new(Finder::new(finder_config, self.records.clone(), self.scheduler.clone()));

        if self.config.one_off {
            finder.refresh().await;
            self.drain_until_idle().await;
            self.stop.notify_waiters();
        } else {
            tasks.push(self.spawn_finder_task(finder));
            self.monitor(tasks).await;
        }

        Ok(())
    }

    fn spawn_scheduler_task(&self) -> (&'static str, RestartableTask) {
        let scheduler = self.scheduler.clone();
        let stop = self.stop.clone();
        (
            "scheduler",
            RestartableTask::spawn(move || {
                let scheduler = scheduler.clone();
                let stop = stop.clone();
                tokio::spawn(async move { scheduler.run(Duration::from_secs(1), &stop).await })
            }),
        )
    }

    fn spawn_parser_task(&self, config: Arc<ParserConfig>, rx: SharedRx) -> (&'static str, RestartableTask) {
        let records = self.records.clone();
        let scheduler = self.scheduler.clone();
        let stop = self.stop.clone();
        (
            "parser",
            RestartableTask::spawn(move || {
                let records = records.clone();
                let scheduler = scheduler.clone();
                let config = config.clone();
                let rx = rx.clone();
                let stop = stop.clone();
                tokio::spawn(run_parser(records, scheduler, config, rx, stop))
            }),
        )
    }

    fn spawn_renewer_task(
        &self,
        renewer: Arc<Renewer>,
        rx: SharedRx,
        minimum_validity: chrono::Duration,
        one_off: bool,
    ) -> (&'static str, RestartableTask) {
        let records = self.records.clone();
        let scheduler = self.scheduler.clone();
        let stop = self.stop.clone();
        (
            "renewer",
            RestartableTask::spawn(move || {
                let renewer = renewer.clone();
                let records = records.clone();
                let scheduler = scheduler.clone();
                let rx = rx.clone();
                let stop = stop.clone();
                tokio::spawn(run_renewer(renewer, records, scheduler, rx, minimum_validity, one_off, stop))
            }),
        )
    }

    fn spawn_proxy_adder_task(&self, adder: Arc<StapleAdder>, rx: SharedRx) -> (&'static str, RestartableTask) {
        let records = self.records.clone();
        let scheduler = self.scheduler.clone();
        let stop = self.stop.clone();
        (
            "proxy-adder",
            RestartableTask::spawn(move || {
                let adder = adder.clone();
                let records = records.clone();
                let scheduler = scheduler.clone();
                let rx = rx.clone();
                let stop = stop.clone();
                tokio::spawn(run_proxy_adder(adder, records, scheduler, rx, stop))
            }),
        )
    }

    /// Supervise the finder the same way as every other component: it's in
    /// `tasks`, so `monitor` restarts it up to [`MAX_RESTART_THREADS`] times
    /// if it ever dies, instead of running unobserved.
    fn spawn_finder_task(&self, finder: Arc<Finder>) -> (&'static str, RestartableTask) {
        let stop = self.stop.clone();
        (
            "finder",
            RestartableTask::spawn(move || {
                let finder = finder.clone();
                let stop = stop.clone();
                tokio::spawn(async move { finder.run(&stop).await })
            }),
        )
    }

    async fn drain_until_idle(&self) {
        loop {
            self.scheduler.run_due().await;
            if self.scheduler.is_idle().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Poll every spawned component every quarter second; a dead one gets
    /// respawned up to `MAX_RESTART_THREADS` times before we give up on it.
    /// Mirrors `Stapledaemon.monitor_threads`.
    async fn monitor(&self, mut tasks: Vec<(&'static str, RestartableTask)>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = self.stop.notified() => break,
            }
            for (name, task) in tasks.iter_mut() {
                if task.finished() {
                    if task.restarts < MAX_RESTART_THREADS {
                        warn!(thread = name, restarts = task.restarts, "thread died, respawning");
                        task.restart();
                    } else {
                        error!(thread = name, restarts = task.restarts, "thread died too many times, giving up on it");
                    }
                }
            }
        }
        info!("stopping all threads");
        self.stop.notify_waiters();
    }
}

/// A component task plus enough state to respawn it from scratch: the
/// closure captures whatever a fresh instance needs so a dead task can be
/// re-spawned without the supervisor knowing its internals.
struct RestartableTask {
    handle: JoinHandle<()>,
    spawn_fn: Box<dyn FnMut() -> JoinHandle<()> + Send>,
    restarts: u32,
}

impl RestartableTask {
    fn spawn<F>(mut spawn_fn: F) -> Self
    where
        F: FnMut() -> JoinHandle<()> + Send + 'static,
    {
        let handle = spawn_fn();
        RestartableTask {
            handle,
            spawn_fn: Box::new(spawn_fn),
            restarts: 0,
        }
    }

    fn finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn restart(&mut self) {
        self.restarts += 1;
        self.handle = (self.spawn_fn)();
    }
}

/// Dequeue the next task context, or `None` if either the queue closed or
/// `stop` was notified while waiting — the latter lets a worker stop at an
/// idle point instead of being abandoned mid-shutdown.
async fn recv_or_stop(rx: &SharedRx, stop: &Notify) -> Option<TaskContext> {
    let mut guard = rx.lock().await;
    tokio::select! {
        ctx = guard.recv() => ctx,
        _ = stop.notified() => None,
    }
}

async fn run_parser(records: RecordMap, scheduler: Arc<Scheduler>, config: Arc<ParserConfig>, rx: SharedRx, stop: Arc<Notify>) {
    info!("started a parser thread");
    loop {
        let Some(mut ctx) = recv_or_stop(&rx, &stop).await else { break };
        let subject = ctx.subject.clone();
        if let Err(err) = parser::parse_certificate(&subject, &records, &scheduler, &config).await {
            errhandler::handle(err, &mut ctx, &scheduler, &records).await;
        }
        scheduler.task_done();
    }
    info!("parser thread stopping");
}

async fn run_renewer(
    renewer: Arc<Renewer>,
    records: RecordMap,
    scheduler: Arc<Scheduler>,
    rx: SharedRx,
    minimum_validity: chrono::Duration,
    one_off: bool,
    stop: Arc<Notify>,
) {
    info!("started a staple renewer thread");
    loop {
        let Some(mut ctx) = recv_or_stop(&rx, &stop).await else { break };
        let subject = ctx.subject.clone();
        match renewer.renew(&subject, &records).await {
            Ok(()) => {
                ctx.clear_exception();
                scheduler
                    .add_task(TaskContext::asap(Stage::ProxyAdd, subject.clone()))
                    .await;

                // `one_off` makes one pass and exits once the pipeline
                // drains; a successor scheduled at `valid_until -
                // minimum_validity` (hours away) would sit in the deadline
                // table forever and keep `Scheduler::is_idle` from ever
                // returning true, so skip it entirely in that mode.
                if !one_off {
                    let valid_until = records.get(&subject).and_then(|r| r.ocsp_staple.as_ref().and_then(|s| s.valid_until));
                    scheduler.add_task(renew_successor_task(subject, valid_until, minimum_validity)).await;
                }
            }
            Err(err) => {
                errhandler::handle(err, &mut ctx, &scheduler, &records).await;
            }
        }
        scheduler.task_done();
    }
    info!("staple renewer thread stopping");
}

/// Build the successor `renew` task a just-completed renewal schedules
/// next: a *fresh* task context (exception counter reset) deadlined at
/// `staple.valid_until - minimum_validity`. Falls back to ASAP if the
/// fetched response didn't carry a `nextUpdate` — there's nothing to count
/// down from, so retrying immediately is safer than never rescheduling at
/// all.
fn renew_successor_task(
    subject: PathBuf,
    valid_until: Option<chrono::DateTime<chrono::Utc>>,
    minimum_validity: chrono::Duration,
) -> TaskContext {
    match valid_until {
        Some(until) => TaskContext::new(Stage::Renew, subject, Some(until - minimum_validity)),
        None => {
            warn!(file = %subject.display(), "renewed staple has no nextUpdate, scheduling renewal ASAP");
            TaskContext::asap(Stage::Renew, subject)
        }
    }
}

async fn run_proxy_adder(adder: Arc<StapleAdder>, records: RecordMap, scheduler: Arc<Scheduler>, rx: SharedRx, stop: Arc<Notify>) {
    info!("started an OCSP adder thread");
    loop {
        let Some(mut ctx) = recv_or_stop(&rx, &stop).await else { break };
        let subject = ctx.subject.clone();
        if let Err(err) = adder.add_staple(&subject, &records).await {
            errhandler::handle(err, &mut ctx, &scheduler, &records).await;
        }
        scheduler.task_done();
    }
    info!("OCSP adder thread stopping");
}

fn build_haproxy_mapping(config: &Config) -> crate::staple_adder::HaproxySocketMapping {
    let mut mapping = config.haproxy_socket_mapping.clone();
    for (_config_path, parsed) in crate::haproxy::parse_files(&config.haproxy_config_files) {
        for cert_path in parsed.cert_paths {
            mapping.entry(cert_path).or_default().extend(parsed.socket_paths.clone());
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn haproxy_mapping_keys_on_cert_path_not_config_file_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "global\n\tstats socket /run/haproxy/admin.sock\nfrontend fe\n\tbind *:443 crt /etc/ssl/certs/site.pem").unwrap();

        let mut config = Config::default();
        config.haproxy_config_files = vec![file.path().to_path_buf()];

        let mapping = build_haproxy_mapping(&config);
        assert_eq!(mapping.get(file.path()), None);
        assert_eq!(
            mapping.get(&PathBuf::from("/etc/ssl/certs/site.pem")),
            Some(&vec![PathBuf::from("/run/haproxy/admin.sock")])
        );
    }

    #[test]
    fn successor_renew_is_scheduled_before_minimum_validity_window() {
        let until = chrono::Utc::now() + chrono::Duration::days(1);
        let ctx = renew_successor_task(PathBuf::from("/a.pem"), Some(until), chrono::Duration::seconds(7200));
        assert_eq!(ctx.subject, PathBuf::from("/a.pem"));
        assert_eq!(ctx.sched_time, Some(until - chrono::Duration::seconds(7200)));
    }

    #[test]
    fn successor_renew_falls_back_to_asap_without_next_update() {
        let ctx = renew_successor_task(PathBuf::from("/a.pem"), None, chrono::Duration::seconds(7200));
        assert_eq!(ctx.sched_time, None);
    }
}
