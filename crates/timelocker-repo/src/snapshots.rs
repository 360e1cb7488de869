use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use timelocker_domain::{validate_snapshot_id, Snapshot, SnapshotDiff, SnapshotFilter};
use timelocker_engine::EngineClient;

use crate::error::RepoError;
use crate::repository::Repository;

/// How long a snapshot listing stays fresh. Any write through this service
/// invalidates the affected repository's entry immediately.
pub const LIST_CACHE_TTL: Duration = Duration::from_secs(300);

// ── Wire formats ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WireSnapshot {
    #[serde(default)]
    short_id: String,
    id: String,
    time: String,
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    summary: Option<WireSnapshotSummary>,
}

#[derive(Debug, Deserialize)]
struct WireSnapshotSummary {
    #[serde(default)]
    total_files_processed: Option<u64>,
    #[serde(default)]
    total_bytes_processed: Option<u64>,
}

impl WireSnapshot {
    fn into_snapshot(self) -> Result<Snapshot, RepoError> {
        let timestamp = DateTime::<FixedOffset>::parse_from_rfc3339(&self.time)
            .map_err(|e| RepoError::Parse(format!("snapshot time '{}': {}", self.time, e)))?;
        let id = if self.short_id.is_empty() {
            self.id.chars().take(8).collect()
        } else {
            self.short_id
        };
        Ok(Snapshot {
            id,
            long_id: self.id,
            timestamp,
            paths: self.paths.into_iter().map(PathBuf::from).collect(),
            tags: self.tags,
            hostname: self.hostname,
            total_size: self.summary.as_ref().and_then(|s| s.total_bytes_processed),
            total_files: self.summary.as_ref().and_then(|s| s.total_files_processed),
        })
    }
}

/// One entry of a snapshot's content listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentsEntry {
    pub path: String,
    pub node_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Name,
    Content,
    Path,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchMatch {
    pub snapshot_id: String,
    pub path: String,
    pub kind: SearchKind,
}

/// A live mount tracked by the process-local registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    pub repository_id: String,
    pub mountpoint: PathBuf,
}

struct CachedList {
    fetched_at: Instant,
    snapshots: Vec<Snapshot>,
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Snapshot operations: listing with a TTL cache, lookup by prefix,
/// date and filter, contents, search, diff, mount tracking, and forget.
pub struct SnapshotService {
    engine: Arc<dyn EngineClient>,
    cache: Mutex<HashMap<String, CachedList>>,
    mounts: Mutex<HashMap<String, MountEntry>>,
    cache_ttl: Duration,
}

impl SnapshotService {
    pub fn new(engine: Arc<dyn EngineClient>) -> Self {
        Self::with_cache_ttl(engine, LIST_CACHE_TTL)
    }

    pub fn with_cache_ttl(engine: Arc<dyn EngineClient>, cache_ttl: Duration) -> Self {
        Self {
            engine,
            cache: Mutex::new(HashMap::new()),
            mounts: Mutex::new(HashMap::new()),
            cache_ttl,
        }
    }

    // ── Listing ───────────────────────────────────────────────────────────────

    /// List snapshots newest-first, applying `filter` after the cache.
    pub async fn list(
        &self,
        repo: &Repository,
        filter: &SnapshotFilter,
    ) -> Result<Vec<Snapshot>, RepoError> {
        let mut snapshots = self.cached_list(repo).await?;
        snapshots.retain(|s| filter.matches(s));
        if let Some(limit) = filter.max_results {
            snapshots.truncate(limit);
        }
        Ok(snapshots)
    }

    /// Resolve a snapshot by unique id prefix (≥ 4 hex chars).
    pub async fn get_by_id(&self, repo: &Repository, prefix: &str) -> Result<Snapshot, RepoError> {
        validate_snapshot_id(prefix)?;
        let snapshots = self.cached_list(repo).await?;
        let mut matches = snapshots
            .into_iter()
            .filter(|s| s.id.starts_with(prefix) || s.long_id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (None, _) => Err(RepoError::SnapshotNotFound(prefix.to_string())),
            (Some(snapshot), None) => Ok(snapshot),
            (Some(_), Some(_)) => Err(RepoError::AmbiguousSnapshotId(prefix.to_string())),
        }
    }

    pub async fn get_latest(
        &self,
        repo: &Repository,
        filter: &SnapshotFilter,
    ) -> Result<Option<Snapshot>, RepoError> {
        Ok(self.list(repo, filter).await?.into_iter().next())
    }

    /// The snapshot closest to `target` within `tolerance_hours`.
    pub async fn get_by_date(
        &self,
        repo: &Repository,
        target: DateTime<FixedOffset>,
        tolerance_hours: u32,
    ) -> Result<Option<Snapshot>, RepoError> {
        let tolerance = chrono::Duration::hours(tolerance_hours as i64);
        let snapshots = self.cached_list(repo).await?;
        let best = snapshots
            .into_iter()
            .filter_map(|s| {
                let distance = (s.timestamp - target).abs();
                (distance <= tolerance).then_some((distance, s))
            })
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, s)| s);
        Ok(best)
    }

    // ── Contents & search ─────────────────────────────────────────────────────

    /// List a snapshot's contents, optionally below `path`.
    pub async fn contents(
        &self,
        repo: &Repository,
        snapshot_id: &str,
        path: Option<&Path>,
    ) -> Result<Vec<ContentsEntry>, RepoError> {
        validate_snapshot_id(snapshot_id)?;
        let mut request = repo.request("ls")?.arg(snapshot_id);
        if let Some(path) = path {
            request = request.arg(path.display().to_string());
        }
        let output = self.engine.run(request).await?;

        // One JSON object per line; the first line is the snapshot header.
        let entries = output
            .stdout
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
            .filter_map(|value| {
                let path = value.get("path")?.as_str()?.to_string();
                let node_type = value.get("type")?.as_str()?.to_string();
                let size = value.get("size").and_then(Value::as_u64).unwrap_or(0);
                Some(ContentsEntry { path, node_type, size })
            })
            .collect();
        Ok(entries)
    }

    /// Search inside one snapshot. Name searches use the engine's `find`;
    /// path searches filter the content listing; content searches require a
    /// mounted snapshot and currently return no matches.
    pub async fn search_in(
        &self,
        repo: &Repository,
        snapshot_id: &str,
        pattern: &str,
        kind: SearchKind,
    ) -> Result<Vec<SearchMatch>, RepoError> {
        validate_snapshot_id(snapshot_id)?;
        match kind {
            SearchKind::Name => {
                let request = repo
                    .request("find")?
                    .arg(pattern)
                    .arg("--snapshot")
                    .arg(snapshot_id);
                let output = self.engine.run(request).await?;
                Ok(parse_find_output(&output.stdout, SearchKind::Name))
            }
            SearchKind::Path => {
                let entries = self.contents(repo, snapshot_id, None).await?;
                Ok(entries
                    .into_iter()
                    .filter(|entry| glob_like_match(pattern, &entry.path))
                    .map(|entry| SearchMatch {
                        snapshot_id: snapshot_id.to_string(),
                        path: entry.path,
                        kind: SearchKind::Path,
                    })
                    .collect())
            }
            SearchKind::Content => {
                warn!(snapshot_id, "content search requires a mounted snapshot; returning no matches");
                Ok(Vec::new())
            }
        }
    }

    /// Search across all snapshots, optionally narrowed by host and tags.
    pub async fn search_across(
        &self,
        repo: &Repository,
        pattern: &str,
        kind: SearchKind,
        host: Option<&str>,
        tags: &[String],
    ) -> Result<Vec<SearchMatch>, RepoError> {
        if kind == SearchKind::Name {
            let mut request = repo.request("find")?.arg(pattern);
            if let Some(host) = host {
                request = request.arg("--host").arg(host);
            }
            for tag in tags {
                request = request.arg("--tag").arg(tag);
            }
            let output = self.engine.run(request).await?;
            return Ok(parse_find_output(&output.stdout, SearchKind::Name));
        }

        // Path/content searches fan out per snapshot; one broken snapshot
        // must not sink the whole search.
        let filter = SnapshotFilter {
            host: host.map(str::to_string),
            tags: tags.to_vec(),
            ..Default::default()
        };
        let mut matches = Vec::new();
        for snapshot in self.list(repo, &filter).await? {
            match self.search_in(repo, &snapshot.id, pattern, kind).await {
                Ok(found) => matches.extend(found),
                Err(e) => {
                    warn!(snapshot_id = %snapshot.id, error = %e, "search failed in snapshot")
                }
            }
        }
        Ok(matches)
    }

    // ── Diff ──────────────────────────────────────────────────────────────────

    /// Compare two snapshots into added/removed/modified sets.
    pub async fn diff(
        &self,
        repo: &Repository,
        snapshot_a: &str,
        snapshot_b: &str,
        include_metadata: bool,
    ) -> Result<SnapshotDiff, RepoError> {
        let a = self.get_by_id(repo, snapshot_a).await?;
        let b = self.get_by_id(repo, snapshot_b).await?;

        let mut request = repo.request("diff")?.arg(&a.long_id).arg(&b.long_id);
        if include_metadata {
            request = request.arg("--metadata");
        }
        let output = self.engine.run(request).await?;
        Ok(parse_diff_output(&output.stdout))
    }

    // ── Mounting ──────────────────────────────────────────────────────────────

    /// Mount the repository at `mountpoint` for browsing `snapshot_id` and
    /// record it in the process-local registry. The engine's mount process
    /// runs on a background task until unmounted.
    pub async fn mount(
        &self,
        repo: &Repository,
        snapshot_id: &str,
        mountpoint: &Path,
    ) -> Result<(), RepoError> {
        validate_snapshot_id(snapshot_id)?;
        let snapshot = self.get_by_id(repo, snapshot_id).await?;

        {
            let mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
            if mounts.contains_key(&snapshot.id) {
                return Err(RepoError::AlreadyMounted(snapshot.id));
            }
        }

        std::fs::create_dir_all(mountpoint).map_err(|e| RepoError::Io {
            path: mountpoint.display().to_string(),
            source: e,
        })?;

        let request = repo.request("mount")?.arg(mountpoint.display().to_string());
        let engine = self.engine.clone();
        let snapshot_short = snapshot.id.clone();
        let mount_path = mountpoint.to_path_buf();
        tokio::spawn(async move {
            // Blocks until the filesystem is unmounted.
            match engine.run(request).await {
                Ok(_) => debug!(snapshot_id = %snapshot_short, "mount process exited"),
                Err(e) => warn!(snapshot_id = %snapshot_short, error = %e, "mount process failed"),
            }
        });

        let mut mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
        mounts.insert(
            snapshot.id.clone(),
            MountEntry {
                repository_id: repo.id().as_str().to_string(),
                mountpoint: mount_path,
            },
        );
        info!(snapshot_id = %snapshot.id, mountpoint = %mountpoint.display(), "snapshot mounted");
        Ok(())
    }

    /// Unmount a snapshot with the platform's fuse unmounter and drop it
    /// from the registry.
    pub async fn unmount(&self, snapshot_id: &str) -> Result<(), RepoError> {
        let entry = {
            let mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
            mounts
                .get(snapshot_id)
                .cloned()
                .ok_or_else(|| RepoError::NotMounted(snapshot_id.to_string()))?
        };

        let unmounted = run_unmount("fusermount", &["-u"], &entry.mountpoint).await
            || run_unmount("umount", &[], &entry.mountpoint).await;
        if !unmounted {
            return Err(RepoError::Io {
                path: entry.mountpoint.display().to_string(),
                source: std::io::Error::other("fusermount and umount both failed"),
            });
        }

        let mut mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
        mounts.remove(snapshot_id);
        info!(snapshot_id, "snapshot unmounted");
        Ok(())
    }

    pub fn mounted_snapshots(&self) -> HashMap<String, MountEntry> {
        self.mounts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // ── Forget ────────────────────────────────────────────────────────────────

    /// Forget a snapshot. Refused while the snapshot is mounted.
    pub async fn forget(
        &self,
        repo: &Repository,
        snapshot_id: &str,
        prune: bool,
    ) -> Result<(), RepoError> {
        validate_snapshot_id(snapshot_id)?;
        let snapshot = self.get_by_id(repo, snapshot_id).await?;

        {
            let mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
            if mounts.contains_key(&snapshot.id) {
                return Err(RepoError::SnapshotMounted(snapshot.id));
            }
        }

        let mut request = repo.request("forget")?.arg(&snapshot.long_id);
        if prune {
            request = request.arg("--prune");
        }
        self.engine.run(request).await?;
        self.invalidate(repo);
        info!(snapshot_id = %snapshot.id, "snapshot forgotten");
        Ok(())
    }

    /// Drop the cached listing for one repository.
    pub fn invalidate(&self, repo: &Repository) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.remove(repo.id().as_str());
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn cached_list(&self, repo: &Repository) -> Result<Vec<Snapshot>, RepoError> {
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache.get(repo.id().as_str()) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.snapshots.clone());
                }
            }
        }

        let output = self.engine.run(repo.request("snapshots")?).await?;
        let wire: Vec<WireSnapshot> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('['))
            .find_map(|line| serde_json::from_str(line).ok())
            .unwrap_or_default();

        let mut snapshots = wire
            .into_iter()
            .map(WireSnapshot::into_snapshot)
            .collect::<Result<Vec<_>, _>>()?;
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(
            repo.id().as_str().to_string(),
            CachedList { fetched_at: Instant::now(), snapshots: snapshots.clone() },
        );
        Ok(snapshots)
    }
}

async fn run_unmount(binary: &str, args: &[&str], mountpoint: &Path) -> bool {
    let status = tokio::process::Command::new(binary)
        .args(args)
        .arg(mountpoint)
        .status()
        .await;
    matches!(status, Ok(s) if s.success())
}

/// Parse `find --json` output: an array of per-snapshot match groups.
fn parse_find_output(stdout: &str, kind: SearchKind) -> Vec<SearchMatch> {
    let Some(groups) = stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('['))
        .find_map(|line| serde_json::from_str::<Vec<Value>>(line).ok())
    else {
        return Vec::new();
    };

    let mut matches = Vec::new();
    for group in groups {
        let snapshot_id = group
            .get("snapshot")
            .and_then(Value::as_str)
            .map(|id| id.chars().take(8).collect::<String>())
            .unwrap_or_default();
        let Some(found) = group.get("matches").and_then(Value::as_array) else {
            continue;
        };
        for item in found {
            if let Some(path) = item.get("path").and_then(Value::as_str) {
                matches.push(SearchMatch {
                    snapshot_id: snapshot_id.clone(),
                    path: path.to_string(),
                    kind,
                });
            }
        }
    }
    matches
}

/// Parse diff output into change sets. Handles both the json-line form
/// (`message_type: change / statistics`) and the plain `+/-/M/T` text form.
fn parse_diff_output(stdout: &str) -> SnapshotDiff {
    let mut diff = SnapshotDiff::default();
    let mut added_bytes: Option<i64> = None;
    let mut removed_bytes: Option<i64> = None;

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Ok(value) = serde_json::from_str::<Value>(line) {
            match value.get("message_type").and_then(Value::as_str) {
                Some("change") => {
                    let Some(path) = value.get("path").and_then(Value::as_str) else {
                        continue;
                    };
                    match value.get("modifier").and_then(Value::as_str).unwrap_or("") {
                        "+" => diff.added.push(path.to_string()),
                        "-" => diff.removed.push(path.to_string()),
                        m if m.starts_with('M') || m.starts_with('T') || m.starts_with('U') => {
                            diff.modified.push(path.to_string())
                        }
                        _ => diff.unchanged.push(path.to_string()),
                    }
                }
                Some("statistics") => {
                    added_bytes = value
                        .get("added")
                        .and_then(|a| a.get("bytes"))
                        .and_then(Value::as_i64);
                    removed_bytes = value
                        .get("removed")
                        .and_then(|r| r.get("bytes"))
                        .and_then(Value::as_i64);
                }
                _ => {}
            }
            continue;
        }

        // Plain-text fallback: "<marker>    <path>".
        if let Some((marker, path)) = line.split_once(char::is_whitespace) {
            let path = path.trim();
            if path.is_empty() {
                continue;
            }
            match marker {
                "+" => diff.added.push(path.to_string()),
                "-" => diff.removed.push(path.to_string()),
                "M" | "T" | "U" => diff.modified.push(path.to_string()),
                _ => {}
            }
        }
    }

    if let (Some(added), Some(removed)) = (added_bytes, removed_bytes) {
        diff.size_delta = Some(added - removed);
    }
    diff
}

/// Minimal glob matching: `*` matches any run of characters; a pattern
/// without `*` matches as a substring.
fn glob_like_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return text.contains(pattern);
    }
    let mut remainder = text;
    let mut segments = pattern.split('*').peekable();
    let mut first = true;
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            first = false;
            continue;
        }
        match remainder.find(segment) {
            Some(idx) => {
                if first && idx != 0 {
                    return false;
                }
                remainder = &remainder[idx + segment.len()..];
            }
            None => return false,
        }
        if segments.peek().is_none() && !pattern.ends_with('*') && !remainder.is_empty() {
            return false;
        }
        first = false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use async_trait::async_trait;
    use timelocker_engine::{
        CancelFlag, EngineError, EngineEvent, EngineOutput, EngineRequest, EngineVersion,
        MIN_ENGINE_VERSION,
    };
    use tokio::sync::mpsc::UnboundedSender;

    use crate::repository::RepositoryFactory;

    /// Canned-response engine: pops one queued output per subcommand call.
    struct StubEngine {
        responses: Mutex<HashMap<String, VecDeque<Result<EngineOutput, EngineError>>>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl StubEngine {
        fn new() -> Self {
            Self { responses: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
        }

        fn enqueue(&self, subcommand: &str, result: Result<EngineOutput, EngineError>) {
            self.responses
                .lock()
                .unwrap()
                .entry(subcommand.to_string())
                .or_default()
                .push_back(result);
        }

        fn enqueue_stdout(&self, subcommand: &str, stdout: &str) {
            self.enqueue(
                subcommand,
                Ok(EngineOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    events: vec![],
                }),
            );
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        fn call_count(&self, subcommand: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|argv| argv.iter().any(|a| a == subcommand))
                .count()
        }
    }

    #[async_trait]
    impl EngineClient for StubEngine {
        async fn version(&self) -> Result<EngineVersion, EngineError> {
            Ok(MIN_ENGINE_VERSION)
        }

        async fn run_streaming(
            &self,
            request: EngineRequest,
            _cancel: CancelFlag,
            _events_tx: Option<UnboundedSender<EngineEvent>>,
        ) -> Result<EngineOutput, EngineError> {
            self.calls.lock().unwrap().push(request.to_argv());
            self.responses
                .lock()
                .unwrap()
                .get_mut(request.subcommand_name())
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| {
                    panic!("no stubbed response for '{}'", request.subcommand_name())
                })
        }
    }

    fn demo_repo() -> crate::repository::Repository {
        RepositoryFactory::new()
            .create_repository("file:///tmp/r", Some("pw".into()), None, Some("demo".into()))
            .unwrap()
    }

    const SNAPSHOTS_JSON: &str = concat!(
        "[",
        r#"{"short_id":"ab12cd34","id":"ab12cd34ef567890ab12cd34ef567890ab12cd34ef567890ab12cd34ef567890","time":"2025-03-01T10:00:00+00:00","paths":["/data"],"tags":["nightly"],"hostname":"host-a"},"#,
        r#"{"short_id":"ef56ab78","id":"ef56ab7890123456ef56ab7890123456ef56ab7890123456ef56ab7890123456","time":"2025-03-02T10:00:00+00:00","paths":["/data"],"tags":["weekly"],"hostname":"host-b","summary":{"total_files_processed":3,"total_bytes_processed":300}}"#,
        "]\n",
    );

    #[tokio::test]
    async fn list_sorts_newest_first_and_caches() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        let service = SnapshotService::new(engine.clone());
        let repo = demo_repo();

        let snapshots = service.list(&repo, &SnapshotFilter::default()).await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].id, "ef56ab78");
        assert_eq!(snapshots[0].total_files, Some(3));

        // Second call is served from cache: no new engine invocation.
        service.list(&repo, &SnapshotFilter::default()).await.unwrap();
        assert_eq!(engine.call_count("snapshots"), 1);
    }

    #[tokio::test]
    async fn expired_cache_refetches() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        let service = SnapshotService::with_cache_ttl(engine.clone(), Duration::from_millis(0));
        let repo = demo_repo();

        service.list(&repo, &SnapshotFilter::default()).await.unwrap();
        service.list(&repo, &SnapshotFilter::default()).await.unwrap();
        assert_eq!(engine.call_count("snapshots"), 2);
    }

    #[tokio::test]
    async fn filter_and_max_results_apply_after_sort() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        let service = SnapshotService::new(engine);
        let repo = demo_repo();

        let filter = SnapshotFilter { max_results: Some(1), ..Default::default() };
        let snapshots = service.list(&repo, &filter).await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, "ef56ab78");
    }

    #[tokio::test]
    async fn get_by_id_resolves_unique_prefixes() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        let service = SnapshotService::new(engine);
        let repo = demo_repo();

        let snapshot = service.get_by_id(&repo, "ab12").await.unwrap();
        assert_eq!(snapshot.id, "ab12cd34");

        assert!(matches!(
            service.get_by_id(&repo, "ffff").await,
            Err(RepoError::SnapshotNotFound(_))
        ));
        assert!(matches!(
            service.get_by_id(&repo, "zzzz").await,
            Err(RepoError::Domain(_))
        ));
        assert!(matches!(
            service.get_by_id(&repo, "ab1").await,
            Err(RepoError::Domain(_))
        ));
    }

    #[tokio::test]
    async fn get_by_date_respects_tolerance() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        let service = SnapshotService::new(engine);
        let repo = demo_repo();

        let target = DateTime::parse_from_rfc3339("2025-03-02T11:00:00+00:00").unwrap();
        let found = service.get_by_date(&repo, target, 2).await.unwrap();
        assert_eq!(found.unwrap().id, "ef56ab78");

        let target = DateTime::parse_from_rfc3339("2025-03-10T10:00:00+00:00").unwrap();
        assert!(service.get_by_date(&repo, target, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forget_refuses_mounted_snapshot() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        engine.enqueue_stdout("mount", "");
        let service = SnapshotService::new(engine);
        let repo = demo_repo();

        let tmp = tempfile::tempdir().unwrap();
        service
            .mount(&repo, "ab12cd34", &tmp.path().join("mnt"))
            .await
            .unwrap();

        assert!(matches!(
            service.forget(&repo, "ab12cd34", false).await,
            Err(RepoError::SnapshotMounted(_))
        ));
    }

    #[tokio::test]
    async fn mount_twice_is_rejected() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        engine.enqueue_stdout("mount", "");
        let service = SnapshotService::new(engine);
        let repo = demo_repo();
        let tmp = tempfile::tempdir().unwrap();

        service.mount(&repo, "ab12cd34", &tmp.path().join("mnt")).await.unwrap();
        assert!(matches!(
            service.mount(&repo, "ab12cd34", &tmp.path().join("mnt2")).await,
            Err(RepoError::AlreadyMounted(_))
        ));
    }

    #[tokio::test]
    async fn forget_uses_long_id_and_invalidates_cache() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        engine.enqueue_stdout("forget", "");
        engine.enqueue_stdout("snapshots", SNAPSHOTS_JSON);
        let service = SnapshotService::new(engine.clone());
        let repo = demo_repo();

        service.forget(&repo, "ab12cd34", true).await.unwrap();
        let forget_call = engine
            .calls()
            .into_iter()
            .find(|argv| argv.iter().any(|a| a == "forget"))
            .unwrap();
        assert!(forget_call.iter().any(|a| a.len() == 64));
        assert!(forget_call.iter().any(|a| a == "--prune"));

        // Cache was invalidated: next list refetches.
        service.list(&repo, &SnapshotFilter::default()).await.unwrap();
        assert_eq!(engine.call_count("snapshots"), 2);
    }

    #[tokio::test]
    async fn contents_parses_ls_lines() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout(
            "ls",
            concat!(
                r#"{"time":"2025-03-01T10:00:00Z","paths":["/data"],"struct_type":"snapshot"}"#,
                "\n",
                r#"{"name":"a.txt","type":"file","path":"/data/a.txt","size":100,"struct_type":"node"}"#,
                "\n",
                r#"{"name":"sub","type":"dir","path":"/data/sub","struct_type":"node"}"#,
                "\n",
            ),
        );
        let service = SnapshotService::new(engine);
        let repo = demo_repo();

        let entries = service.contents(&repo, "ab12cd34", None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/data/a.txt");
        assert_eq!(entries[0].size, 100);
        assert_eq!(entries[1].node_type, "dir");
    }

    #[tokio::test]
    async fn search_by_name_parses_find_output() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout(
            "find",
            r#"[{"matches":[{"path":"/data/notes.md","type":"file"}],"hits":1,"snapshot":"ab12cd34ef567890ab12cd34ef567890"}]"#,
        );
        let service = SnapshotService::new(engine);
        let repo = demo_repo();

        let matches = service
            .search_in(&repo, "ab12cd34", "notes*", SearchKind::Name)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "/data/notes.md");
        assert_eq!(matches[0].snapshot_id, "ab12cd34");
    }

    #[tokio::test]
    async fn search_by_path_filters_contents() {
        let engine = Arc::new(StubEngine::new());
        engine.enqueue_stdout(
            "ls",
            concat!(
                r#"{"name":"a.txt","type":"file","path":"/data/docs/a.txt","size":1,"struct_type":"node"}"#,
                "\n",
                r#"{"name":"b.log","type":"file","path":"/data/logs/b.log","size":1,"struct_type":"node"}"#,
                "\n",
            ),
        );
        let service = SnapshotService::new(engine);
        let repo = demo_repo();

        let matches = service
            .search_in(&repo, "ab12cd34", "/docs/*", SearchKind::Path)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "/data/docs/a.txt");
    }

    #[test]
    fn diff_parsing_json_lines() {
        let stdout = concat!(
            r#"{"message_type":"change","path":"/data/new.txt","modifier":"+"}"#,
            "\n",
            r#"{"message_type":"change","path":"/data/gone.txt","modifier":"-"}"#,
            "\n",
            r#"{"message_type":"change","path":"/data/edited.txt","modifier":"M"}"#,
            "\n",
            r#"{"message_type":"statistics","added":{"bytes":500},"removed":{"bytes":200}}"#,
            "\n",
        );
        let diff = parse_diff_output(stdout);
        assert_eq!(diff.added, vec!["/data/new.txt"]);
        assert_eq!(diff.removed, vec!["/data/gone.txt"]);
        assert_eq!(diff.modified, vec!["/data/edited.txt"]);
        assert_eq!(diff.size_delta, Some(300));
    }

    #[test]
    fn diff_parsing_plain_text() {
        let stdout = "+    /data/new.txt\n-    /data/gone.txt\nM    /data/edited.txt\nT    /data/retyped\n";
        let diff = parse_diff_output(stdout);
        assert_eq!(diff.added, vec!["/data/new.txt"]);
        assert_eq!(diff.removed, vec!["/data/gone.txt"]);
        assert_eq!(diff.modified, vec!["/data/edited.txt", "/data/retyped"]);
        assert_eq!(diff.size_delta, None);
    }

    #[test]
    fn glob_like_matching() {
        assert!(glob_like_match("docs", "/data/docs/a.txt"));
        assert!(glob_like_match("*.txt", "/data/a.txt"));
        assert!(!glob_like_match("*.txt", "/data/a.log"));
        assert!(glob_like_match("/data/*/a.txt", "/data/docs/a.txt"));
        assert!(!glob_like_match("/other/*", "/data/docs/a.txt"));
    }
}
