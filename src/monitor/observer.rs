//! Live view of file activity under the protected roots.
//!
//! The observer owns the FileState map exclusively; nothing else in the
//! engine sees raw paths or events — only the derived [`FeatureVector`]
//! crosses the boundary. Raw notify events are forwarded from the watcher
//! callback over a channel and drained on each `sample()` call, so the
//! producer and the sampler never contend on shared state.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Instant, SystemTime};

use crossbeam_channel as channel;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};

use crate::core::config::{Config, TelemetryConfig, WatchConfig};
use crate::core::errors::{DefenseError, Result};
use crate::monitor::cpu::CpuSampler;
use crate::monitor::entropy::mean_entropy_of;
use crate::monitor::features::{ExtensionRegistry, FeatureVector, WindowSummary};
use crate::monitor::rates::ActivityRateEstimator;

// ──────────────────── change events ────────────────────

/// Kind of a normalized change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed { from: PathBuf },
}

/// A normalized file change, immutable once emitted.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub at: SystemTime,
    /// Best-effort originating process. Always `None` for inotify-backed
    /// watchers — the kernel does not attribute events — but alternative
    /// producers (audit, eBPF) can fill it.
    pub process_hint: Option<String>,
}

/// Last-seen state of one tracked file.
#[derive(Debug, Clone)]
struct FileState {
    modified: SystemTime,
    size: u64,
    content_hash: Option<String>,
}

/// Externally settable network-anomaly hint.
///
/// The file observer cannot see the network; an outer collector flips this
/// flag and the next sampled vector carries it.
#[derive(Debug, Clone, Default)]
pub struct NetworkAnomalyHint(Arc<AtomicBool>);

impl NetworkAnomalyHint {
    pub fn set(&self, anomalous: bool) {
        self.0.store(anomalous, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ──────────────────── observer ────────────────────

/// Watches the protected roots and produces one feature vector per tick.
#[derive(Debug)]
pub struct FileTreeObserver {
    roots: Vec<PathBuf>,
    // Kept alive for the lifetime of the observer; dropping it unregisters
    // the OS watches.
    _watcher: RecommendedWatcher,
    raw_rx: channel::Receiver<notify::Event>,
    states: HashMap<PathBuf, FileState>,
    rates: ActivityRateEstimator,
    cpu: CpuSampler,
    extensions: ExtensionRegistry,
    rapid_change_threshold: f64,
    hash_budget: usize,
    entropy_budget: usize,
    entropy_sample_bytes: usize,
    network_hint: NetworkAnomalyHint,
    events_seen: u64,
}

impl FileTreeObserver {
    /// Begin watching. Fails with `WatchInit` if any root does not exist,
    /// is not a directory, or is not readable.
    pub fn start(config: &Config) -> Result<Self> {
        Self::start_with(
            &config.watch,
            &config.telemetry,
            config.engine.rapid_change_threshold,
        )
    }

    pub fn start_with(
        watch: &WatchConfig,
        telemetry: &TelemetryConfig,
        rapid_change_threshold: f64,
    ) -> Result<Self> {
        for root in &watch.roots {
            validate_root(root)?;
        }

        let (raw_tx, raw_rx) = channel::unbounded::<notify::Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = raw_tx.send(event);
            }
        })?;

        for root in &watch.roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| DefenseError::WatchInit {
                    path: root.clone(),
                    details: e.to_string(),
                })?;
        }

        let mut observer = Self {
            roots: watch.roots.clone(),
            _watcher: watcher,
            raw_rx,
            states: HashMap::new(),
            rates: ActivityRateEstimator::new(
                telemetry.ewma_base_alpha,
                telemetry.ewma_min_alpha,
                telemetry.ewma_max_alpha,
                telemetry.ewma_min_samples,
            ),
            cpu: CpuSampler::new(),
            extensions: ExtensionRegistry::new(&watch.suspicious_extensions)?,
            rapid_change_threshold,
            hash_budget: watch.hash_budget_per_tick,
            entropy_budget: watch.entropy_budget_per_tick,
            entropy_sample_bytes: watch.entropy_sample_bytes,
            network_hint: NetworkAnomalyHint::default(),
            events_seen: 0,
        };
        observer.initial_scan();
        Ok(observer)
    }

    /// Handle for flipping the network-anomaly flag from outside.
    #[must_use]
    pub fn network_anomaly_hint(&self) -> NetworkAnomalyHint {
        self.network_hint.clone()
    }

    /// Number of files currently tracked.
    #[must_use]
    pub fn tracked_files(&self) -> usize {
        self.states.len()
    }

    /// Total raw events observed since start.
    #[must_use]
    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    /// Drain accumulated events, compute aggregate statistics, reset the
    /// window, and emit the feature vector for this tick.
    ///
    /// Work is bounded by the hash/entropy budgets regardless of tree size.
    pub fn sample(&mut self) -> FeatureVector {
        let (summary, _events) = self.drain_window();
        self.vector_from_summary(&summary)
    }

    /// Like [`sample`](Self::sample) but also returns the normalized events,
    /// for callers that audit individual changes.
    pub fn sample_with_events(&mut self) -> (FeatureVector, Vec<ChangeEvent>) {
        let (summary, events) = self.drain_window();
        (self.vector_from_summary(&summary), events)
    }

    // ──────────── window processing ────────────

    fn vector_from_summary(&mut self, summary: &WindowSummary) -> FeatureVector {
        let rates = self
            .rates
            .update(summary.files_modified, summary.bytes_written, Instant::now());
        let mean_entropy = mean_entropy_of(
            summary.touched.iter(),
            self.entropy_budget,
            self.entropy_sample_bytes,
        )
        .unwrap_or(0.0);
        let cpu = self.cpu.sample();

        FeatureVector {
            files_modified_per_sec: rates.files_per_sec,
            bytes_written_per_sec: rates.bytes_per_sec,
            mean_entropy,
            cpu_utilization: cpu,
            suspicious_extension: f64::from(u8::from(summary.suspicious_seen)),
            rapid_change: f64::from(u8::from(rates.files_per_sec > self.rapid_change_threshold)),
            unauthorized_access: f64::from(u8::from(summary.permission_failure_seen)),
            network_anomaly: f64::from(u8::from(self.network_hint.get())),
        }
    }

    /// Drain raw events and normalize them into per-path dispositions.
    fn drain_window(&mut self) -> (WindowSummary, Vec<ChangeEvent>) {
        let now = SystemTime::now();
        let mut summary = WindowSummary::default();

        // Per-path disposition for this window. A path appears at most once;
        // later events refine earlier ones (create+write = created,
        // rename-from+rename-to = renamed).
        let mut created: HashSet<PathBuf> = HashSet::new();
        let mut modified: HashSet<PathBuf> = HashSet::new();
        let mut removed: HashSet<PathBuf> = HashSet::new();
        let mut renamed: HashMap<PathBuf, PathBuf> = HashMap::new(); // to → from
        let mut pending_rename_from: Vec<PathBuf> = Vec::new();

        while let Ok(event) = self.raw_rx.try_recv() {
            self.events_seen += 1;
            match event.kind {
                EventKind::Create(_) => {
                    for path in event.paths {
                        if self.states.contains_key(&path) {
                            modified.insert(path);
                        } else {
                            created.insert(path);
                        }
                    }
                }
                EventKind::Modify(ModifyKind::Name(mode)) => {
                    self.fold_rename(
                        mode,
                        event.paths,
                        &mut created,
                        &mut removed,
                        &mut renamed,
                        &mut pending_rename_from,
                    );
                }
                EventKind::Modify(_) => {
                    for path in event.paths {
                        if !created.contains(&path) {
                            modified.insert(path);
                        }
                    }
                }
                EventKind::Remove(_) => {
                    for path in event.paths {
                        if created.remove(&path) || modified.remove(&path) {
                            // Short-lived temp file: appeared and vanished
                            // within one window. Not activity worth counting.
                            continue;
                        }
                        removed.insert(path);
                    }
                }
                EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
            }
        }

        // Unpaired rename-from events are removals.
        for path in pending_rename_from {
            removed.insert(path);
        }

        // Fallback rename detection: a remove and a create in the same window
        // with identical content is a rename performed as unlink+write.
        self.match_renames_by_hash(&mut created, &mut removed, &mut renamed);

        let mut events = Vec::new();

        for path in &removed {
            self.states.remove(path);
            events.push(ChangeEvent {
                path: path.clone(),
                kind: ChangeKind::Removed,
                at: now,
                process_hint: None,
            });
        }

        // A renamed-and-rewritten file counts once toward "modified": the
        // rename subsumes any separate data events seen for either name.
        for (to, from) in &renamed {
            modified.remove(from);
            modified.remove(to);
            created.remove(to);
        }
        for (to, from) in &renamed {
            if let Some(state) = self.states.remove(from) {
                self.states.insert(to.clone(), state);
            }
            summary.files_modified += 1;
            self.refresh_state(to, &mut summary);
            events.push(ChangeEvent {
                path: to.clone(),
                kind: ChangeKind::Renamed { from: from.clone() },
                at: now,
                process_hint: None,
            });
        }

        for (paths, kind) in [(&created, ChangeKind::Created), (&modified, ChangeKind::Modified)] {
            for path in paths {
                summary.files_modified += 1;
                self.refresh_state(path, &mut summary);
                events.push(ChangeEvent {
                    path: path.clone(),
                    kind: kind.clone(),
                    at: now,
                    process_hint: None,
                });
            }
        }

        (summary, events)
    }

    fn fold_rename(
        &mut self,
        mode: RenameMode,
        paths: Vec<PathBuf>,
        created: &mut HashSet<PathBuf>,
        removed: &mut HashSet<PathBuf>,
        renamed: &mut HashMap<PathBuf, PathBuf>,
        pending_from: &mut Vec<PathBuf>,
    ) {
        match mode {
            RenameMode::Both => {
                if paths.len() >= 2 {
                    let from = paths[0].clone();
                    let to = paths[1].clone();
                    renamed.insert(to, from);
                }
            }
            RenameMode::From => {
                pending_from.extend(paths);
            }
            RenameMode::To => {
                for to in paths {
                    if let Some(from) = pending_from.pop() {
                        renamed.insert(to, from);
                    } else if self.states.contains_key(&to) {
                        // Rename onto an existing tracked path overwrites it.
                        renamed.insert(to.clone(), to);
                    } else {
                        created.insert(to);
                    }
                }
            }
            RenameMode::Any | RenameMode::Other => {
                // Backend couldn't tell; treat each path by presence.
                for path in paths {
                    if self.states.contains_key(&path) {
                        removed.insert(path);
                    } else {
                        created.insert(path);
                    }
                }
            }
        }
    }

    /// Pair created files against removed files by content hash, folding
    /// matches into renames. Hashing is capped by the per-tick budget.
    fn match_renames_by_hash(
        &mut self,
        created: &mut HashSet<PathBuf>,
        removed: &mut HashSet<PathBuf>,
        renamed: &mut HashMap<PathBuf, PathBuf>,
    ) {
        if created.is_empty() || removed.is_empty() {
            return;
        }

        // Hash of each removed path as last recorded, keyed for lookup.
        let mut removed_by_hash: HashMap<String, PathBuf> = HashMap::new();
        for path in removed.iter() {
            if let Some(state) = self.states.get(path)
                && let Some(hash) = &state.content_hash
            {
                removed_by_hash.insert(hash.clone(), path.clone());
            }
        }
        if removed_by_hash.is_empty() {
            return;
        }

        let mut matched: Vec<(PathBuf, PathBuf)> = Vec::new(); // (to, from)
        let mut budget = self.hash_budget;
        for path in created.iter() {
            if budget == 0 {
                break;
            }
            budget -= 1;
            if let Ok(hash) = hash_file(path)
                && let Some(from) = removed_by_hash.remove(&hash)
            {
                matched.push((path.clone(), from));
            }
        }

        for (to, from) in matched {
            created.remove(&to);
            removed.remove(&from);
            renamed.insert(to, from);
        }
    }

    /// Stat a touched path, update its FileState, and accumulate window
    /// aggregates. Missing files are dropped; permission failures raise the
    /// unauthorized-access flag.
    fn refresh_state(&mut self, path: &Path, summary: &mut WindowSummary) {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_file() => {
                summary.bytes_written = summary.bytes_written.saturating_add(meta.len());
                summary.touched.push(path.to_path_buf());
                if self.extensions.is_suspicious(path) {
                    summary.suspicious_seen = true;
                }
                let entry = self.states.entry(path.to_path_buf()).or_insert(FileState {
                    modified: SystemTime::UNIX_EPOCH,
                    size: 0,
                    content_hash: None,
                });
                entry.modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                // Content changed: the recorded hash is stale.
                if entry.size != meta.len() {
                    entry.content_hash = None;
                }
                entry.size = meta.len();
            }
            Ok(_) => {} // directories and symlinks are not tracked as files
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                summary.permission_failure_seen = true;
            }
            Err(_) => {
                self.states.remove(path);
            }
        }
    }

    /// Seed the FileState map with everything currently under the roots.
    ///
    /// Startup-only full walk; per-tick work never rescans the tree.
    fn initial_scan(&mut self) {
        let mut stack: Vec<PathBuf> = self.roots.clone();
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(ft) = entry.file_type() else { continue };
                if ft.is_dir() {
                    stack.push(path);
                } else if ft.is_file()
                    && let Ok(meta) = entry.metadata()
                {
                    self.states.insert(
                        path,
                        FileState {
                            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                            size: meta.len(),
                            content_hash: None,
                        },
                    );
                }
            }
        }

        // Record hashes for a bounded prefix so rename matching works from
        // the first window. The rest fill in lazily as files are touched.
        let mut budget = self.hash_budget;
        for (path, state) in &mut self.states {
            if budget == 0 {
                break;
            }
            if let Ok(hash) = hash_file(path) {
                state.content_hash = Some(hash);
                budget -= 1;
            }
        }
    }
}

// ──────────────────── helpers ────────────────────

fn validate_root(root: &Path) -> Result<()> {
    let meta = fs::metadata(root).map_err(|e| DefenseError::WatchInit {
        path: root.to_path_buf(),
        details: e.to_string(),
    })?;
    if !meta.is_dir() {
        return Err(DefenseError::WatchInit {
            path: root.to_path_buf(),
            details: "not a directory".to_string(),
        });
    }
    // Readability probe: a root we cannot list is a root we cannot defend.
    fs::read_dir(root).map_err(|e| DefenseError::WatchInit {
        path: root.to_path_buf(),
        details: format!("not readable: {e}"),
    })?;
    Ok(())
}

/// Streaming SHA-256 of a file's contents.
pub(crate) fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
