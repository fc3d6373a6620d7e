//! Scans configured paths for certificate files and keeps the shared
//! [`RecordMap`] in sync with what's on disk: new files get scheduled for
//! parsing, changed files get re-parsed from scratch, and deleted files are
//! forgotten.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::model::{CertRecord, RecordMap};
use crate::scheduler::Scheduler;
use crate::task::{Stage, TaskContext};

pub struct FinderConfig {
    pub cert_paths: Vec<PathBuf>,
    pub file_extensions: Vec<String>,
    pub recursive: bool,
    pub ignore: Vec<String>,
    pub refresh_interval: Option<Duration>,
}

pub struct Finder {
    config: FinderConfig,
    ignore_patterns: Vec<Regex>,
    records: RecordMap,
    scheduler: std::sync::Arc<Scheduler>,
}

impl Finder {
    pub fn new(config: FinderConfig, records: RecordMap, scheduler: std::sync::Arc<Scheduler>) -> Self {
        let ignore_patterns = config
            .ignore
            .iter()
            .filter_map(|p| compile_ignore_pattern(p))
            .collect();
        Finder {
            config,
            ignore_patterns,
            records,
            scheduler,
        }
    }

    /// Drive the finder's poll loop. Returns once `stop` is notified, or
    /// after exactly one pass if `refresh_interval` is `None` (`one_off`
    /// mode).
    pub async fn run(&self, stop: &tokio::sync::Notify) {
        info!(paths = ?self.config.cert_paths, "scanning paths");
        loop {
            let started = std::time::Instant::now();
            self.refresh().await;
            let Some(interval) = self.config.refresh_interval else {
                break;
            };
            let elapsed = started.elapsed();
            if elapsed >= interval {
                info!(
                    elapsed_secs = elapsed.as_secs_f64(),
                    interval_secs = interval.as_secs(),
                    "starting a new refresh immediately, last one overran"
                );
                continue;
            }
            let remaining = interval - elapsed;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = stop.notified() => break,
            }
        }
    }

    pub async fn refresh(&self) {
        info!("starting a refresh run");
        self.update_cached_certs().await;
        for path in self.config.cert_paths.clone() {
            self.find_new_certs(&path, &path).await;
        }
    }

    async fn update_cached_certs(&self) {
        let mut deleted = Vec::new();
        let mut changed = Vec::new();
        for entry in self.records.iter() {
            let filename = entry.key().clone();
            match std::fs::metadata(&filename).and_then(|m| m.modified()) {
                Err(_) => deleted.push(filename),
                Ok(modtime) if modtime > entry.value().modtime => changed.push(filename),
                Ok(_) => {}
            }
        }

        for filename in deleted {
            self.scheduler.cancel_by_subject(&filename).await;
            self.records.remove(&filename);
            info!(file = %filename.display(), "file was deleted, removing from cache");
        }

        for filename in changed {
            self.scheduler.cancel_by_subject(&filename).await;
            let cert_path = self
                .records
                .get(&filename)
                .map(|r| r.cert_path.clone())
                .unwrap_or_else(|| filename.clone());
            self.records.remove(&filename);
            info!(file = %filename.display(), "file changed, parsing it again");
            self.track_and_schedule(&filename, &cert_path).await;
        }
    }

    /// Walk `path` for new certificate files, descending into
    /// subdirectories only when `recursive` is configured (depth 1
    /// otherwise). `cert_path` is threaded through unchanged: it's the
    /// configured root this file was discovered under, used later to look
    /// up which admin sockets serve it.
    async fn find_new_certs(&self, path: &Path, cert_path: &Path) {
        debug!(path = %path.display(), "scanning path");
        if path.is_file() {
            self.maybe_track(path, cert_path).await;
            return;
        }

        let max_depth = if self.config.recursive { usize::MAX } else { 1 };
        let entries: Vec<PathBuf> = WalkDir::new(path)
            .max_depth(max_depth)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) if e.file_type().is_file() => Some(e.into_path()),
                Ok(_) => None,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "can't read path entry");
                    None
                }
            })
            .collect();

        for entry in entries {
            self.maybe_track(&entry, cert_path).await;
        }
    }

    async fn maybe_track(&self, entry: &Path, cert_path: &Path) {
        let ext = entry
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();
        if !self.config.file_extensions.iter().any(|e| e == &ext) {
            return;
        }
        if self.records.contains_key(entry) {
            return;
        }
        if self.check_ignore(entry) {
            debug!(file = %entry.display(), "ignoring file, it's on the ignore list");
            return;
        }
        self.track_and_schedule(entry, cert_path).await;
    }

    async fn track_and_schedule(&self, filename: &Path, cert_path: &Path) {
        let raw = match std::fs::read(filename) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(file = %filename.display(), error = %e, "can't access certificate file");
                return;
            }
        };
        let modtime = std::fs::metadata(filename)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::now());
        let record = CertRecord::new(filename.to_path_buf(), cert_path.to_path_buf(), raw, modtime);
        self.records.insert(filename.to_path_buf(), record);
        self.scheduler
            .add_task(TaskContext::asap(Stage::Parse, filename.to_path_buf()))
            .await;
    }

    fn check_ignore(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.ignore_patterns.iter().any(|re| re.is_match(&path_str))
    }
}

/// Compile one ignore-list entry the way `check_ignore` does: entries that
/// don't start with `/` are treated as relative and get a `**` glob prefix
/// so they match regardless of which parent directory they show up under.
fn compile_ignore_pattern(pattern: &str) -> Option<Regex> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return None;
    }
    let full = if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        format!("**{pattern}")
    };
    let regex_src = format!("(?s)^{}$", glob_to_regex(&full));
    Regex::new(&regex_src).ok()
}

/// Translate a shell-glob-ish pattern to a regex body. `*` (and `**`) match
/// any run of characters including path separators: the whole path is
/// treated as one string rather than matching path-component by component.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if let Some(&next) = chars.peek() {
                    if next == '!' {
                        out.push('^');
                        chars.next();
                    }
                }
                for c in chars.by_ref() {
                    out.push(c);
                    if c == ']' {
                        break;
                    }
                }
            }
            c if "\\.+()|{}^$".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// Patterns that look like relative paths (start with `./` or `../`) make no
/// sense against the absolute paths the finder matches against; discard them
/// at startup with a warning instead of silently never matching.
pub fn filter_relative_patterns(patterns: Vec<String>) -> Vec<String> {
    let relative = Regex::new(r"^\.+/").unwrap();
    patterns
        .into_iter()
        .filter(|p| {
            if relative.is_match(p.trim()) {
                warn!(pattern = %p, "ignoring relative ignore-pattern, paths are matched absolutely");
                false
            } else {
                true
            }
        })
        .collect()
}
