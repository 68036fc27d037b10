//! Job state: the chunk state machine and its on-disk store.
//!
//! `state.json` is the single source of truth for a job. Every mutation goes
//! through [`StateStore`], which performs a locked read-modify-write:
//!
//! ```text
//! acquire state.json.lock (create-new) ─▶ read state.json ─▶ mutate
//!        ─▶ write temp file in job dir ─▶ rename over state.json ─▶ release lock
//! ```
//!
//! The lock makes "find the next chunk and mark it IN_PROGRESS" a single
//! atomic step, so two runners on the same job never claim the same chunk.
//! The rename means readers never observe a half-written document.
//!
//! ## Chunk lifecycle
//!
//! ```text
//! PENDING ──▶ IN_PROGRESS ──▶ SYNTHESIZE ──▶ IN_PROGRESS ──▶ COMPLETED
//!                  │                              │
//!                  ├──────────▶ COMPLETED         └──────────▶ FAILED
//!                  └──────────▶ FAILED
//! ```

use crate::config::SynthesisMode;
use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// File name of the job state document inside the job directory.
pub const STATE_FILE: &str = "state.json";

/// File name of the catalog map inside the job directory.
pub const STRUCTURE_FILE: &str = "structure.json";

const LOCK_POLL: Duration = Duration::from_millis(100);

// ── Data model ───────────────────────────────────────────────────────────

/// Processing status of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    /// Planned, nothing run yet.
    Pending,
    /// Claimed by a runner.
    InProgress,
    /// Converted and SKU-extracted; waiting for the model.
    Synthesize,
    /// Final outputs written.
    Completed,
    /// The pipeline failed; see the chunk's `error`.
    Failed,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "PENDING",
            ChunkStatus::InProgress => "IN_PROGRESS",
            ChunkStatus::Synthesize => "SYNTHESIZE",
            ChunkStatus::Completed => "COMPLETED",
            ChunkStatus::Failed => "FAILED",
        }
    }

    /// No runner will pick this chunk up again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contiguous page range processed as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// First page, 1-based, in source-document numbering.
    pub start: usize,
    /// Last page, inclusive.
    pub end: usize,
    pub status: ChunkStatus,
    /// Directory holding the chunk's inputs and outputs.
    pub working_dir: PathBuf,
    /// The sliced chunk PDF.
    pub input_file: PathBuf,
    /// Raw per-page text dump.
    pub text_file: PathBuf,
    /// Last failure message, cleared on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// RFC 3339 time of the last status change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Chunk {
    /// Offset from chunk-local page numbers (1-based) to source pages.
    pub fn page_offset(&self) -> usize {
        self.start.saturating_sub(1)
    }

    pub fn page_count(&self) -> usize {
        self.end + 1 - self.start
    }

    /// Directory name and file stem used for this chunk, e.g. `8_12`.
    pub fn slug(&self) -> String {
        chunk_slug(self.start, self.end)
    }
}

/// `"{start}_{end}"`, the name of a chunk's directory under `runs/`.
pub fn chunk_slug(start: usize, end: usize) -> String {
    format!("{start}_{end}")
}

/// A logical catalog division discovered from the table of contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub start_page: usize,
    pub end_page: usize,
}

/// A section together with its planned chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionState {
    pub name: String,
    #[serde(default)]
    pub start_page: usize,
    #[serde(default)]
    pub end_page: usize,
    pub chunks: Vec<Chunk>,
}

/// Output of the catalog mapper, persisted as `structure.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogStructure {
    pub source: PathBuf,
    pub total_pages: usize,
    pub sections: Vec<Section>,
}

/// One journaled CLI invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub datetime: String,
    pub file: String,
    pub args: String,
    pub execution_time: String,
    pub status: String,
    pub message: String,
}

fn default_job_status() -> String {
    "ready".to_string()
}

/// The whole job document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub catalog_source: PathBuf,
    pub working_dir: PathBuf,
    #[serde(default = "default_job_status")]
    pub status: String,
    pub sections: Vec<SectionState>,
    #[serde(default)]
    pub executions: Vec<Execution>,
}

/// Position of a chunk inside [`JobState::sections`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub section: usize,
    pub chunk: usize,
}

impl JobState {
    /// Pick the next chunk a runner in `mode` should process.
    ///
    /// `include` and `skip` prefer any PENDING chunk over any SYNTHESIZE
    /// chunk; `only` looks at SYNTHESIZE chunks alone. Within a status the
    /// first chunk in document order wins. `section` restricts the scan to
    /// one section index.
    pub fn find_next(&self, mode: SynthesisMode, section: Option<usize>) -> Option<ChunkRef> {
        let wanted: &[ChunkStatus] = match mode {
            SynthesisMode::Include => &[ChunkStatus::Pending, ChunkStatus::Synthesize],
            SynthesisMode::Skip => &[ChunkStatus::Pending],
            SynthesisMode::Only => &[ChunkStatus::Synthesize],
        };

        wanted.iter().find_map(|&status| {
            self.sections
                .iter()
                .enumerate()
                .filter(|(si, _)| section.is_none_or(|target| target == *si))
                .find_map(|(si, sec)| {
                    sec.chunks
                        .iter()
                        .position(|c| c.status == status)
                        .map(|ci| ChunkRef {
                            section: si,
                            chunk: ci,
                        })
                })
        })
    }

    pub fn chunk(&self, at: ChunkRef) -> Option<&Chunk> {
        self.sections.get(at.section)?.chunks.get(at.chunk)
    }

    /// Locate a chunk by its `(start, end)` key.
    pub fn find_chunk_mut(&mut self, start: usize, end: usize) -> Option<&mut Chunk> {
        self.sections
            .iter_mut()
            .flat_map(|s| s.chunks.iter_mut())
            .find(|c| c.start == start && c.end == end)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.sections.iter().flat_map(|s| s.chunks.iter())
    }

    pub fn total_chunks(&self) -> usize {
        self.sections.iter().map(|s| s.chunks.len()).sum()
    }

    /// Human-readable per-section status summary.
    pub fn report(&self) -> String {
        let mut out = String::from("\n=== Job State Report ===\n");
        if self.sections.is_empty() {
            out.push_str("No sections found in state.\n");
        }
        for (i, section) in self.sections.iter().enumerate() {
            let counts = status_counts(&section.chunks);
            let summary = if counts.is_empty() {
                "No chunks".to_string()
            } else {
                counts
                    .iter()
                    .map(|(status, n)| format!("{status}: {n}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            out.push_str(&format!(
                "{i}: {} (pages {}-{}) - {summary}\n",
                section.name, section.start_page, section.end_page
            ));
        }
        out.push_str("========================\n");
        out
    }
}

/// Count chunks per status in first-seen order.
pub fn status_counts(chunks: &[Chunk]) -> Vec<(ChunkStatus, usize)> {
    let mut counts: Vec<(ChunkStatus, usize)> = Vec::new();
    for chunk in chunks {
        match counts.iter_mut().find(|(s, _)| *s == chunk.status) {
            Some((_, n)) => *n += 1,
            None => counts.push((chunk.status, 1)),
        }
    }
    counts
}

/// Current local time as RFC 3339.
pub fn now_rfc3339() -> String {
    chrono::Local::now().to_rfc3339()
}

// ── Store ────────────────────────────────────────────────────────────────

/// A chunk handed to a runner by [`StateStore::claim_next`].
#[derive(Debug, Clone)]
pub struct ClaimedChunk {
    pub section_index: usize,
    pub section_name: String,
    /// Snapshot of the chunk as claimed (its status is already IN_PROGRESS on disk).
    pub chunk: Chunk,
    /// Status before the claim; decides which pipeline steps run.
    pub previous: ChunkStatus,
}

/// Locked, atomic access to a job's `state.json`.
#[derive(Debug, Clone)]
pub struct StateStore {
    job_dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    stale_after: Duration,
}

impl StateStore {
    pub fn new(job_dir: impl Into<PathBuf>) -> Self {
        let job_dir = job_dir.into();
        let state_path = job_dir.join(STATE_FILE);
        let lock_path = job_dir.join(format!("{STATE_FILE}.lock"));
        Self {
            job_dir,
            state_path,
            lock_path,
            lock_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(600),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = age;
        self
    }

    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn exists(&self) -> bool {
        self.state_path.is_file()
    }

    /// Read the current state without taking the lock.
    ///
    /// Safe because writers replace the file by rename.
    pub fn load(&self) -> Result<JobState, CatalogError> {
        let raw = match fs::read_to_string(&self.state_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CatalogError::StateNotFound {
                    path: self.state_path.clone(),
                })
            }
            Err(e) => return Err(CatalogError::io(&self.state_path, e)),
        };
        serde_json::from_str(&raw).map_err(|e| CatalogError::StateCorrupt {
            path: self.state_path.clone(),
            detail: e.to_string(),
        })
    }

    /// Write a freshly planned state. Fails if one exists and `overwrite` is false.
    pub fn create(&self, state: &JobState, overwrite: bool) -> Result<(), CatalogError> {
        fs::create_dir_all(&self.job_dir).map_err(|e| CatalogError::io(&self.job_dir, e))?;
        let _lock = self.acquire()?;
        if self.exists() && !overwrite {
            return Err(CatalogError::JobAlreadyExists {
                path: self.state_path.clone(),
            });
        }
        self.write_atomic(state)
    }

    /// Locked read-modify-write. The closure's result is returned after the
    /// new state has been persisted.
    pub fn update<T>(&self, f: impl FnOnce(&mut JobState) -> T) -> Result<T, CatalogError> {
        let _lock = self.acquire()?;
        let mut state = self.load()?;
        let out = f(&mut state);
        self.write_atomic(&state)?;
        Ok(out)
    }

    /// Select the next eligible chunk and mark it IN_PROGRESS in one step.
    pub fn claim_next(
        &self,
        mode: SynthesisMode,
        section: Option<usize>,
    ) -> Result<Option<ClaimedChunk>, CatalogError> {
        self.update(|state| {
            let at = state.find_next(mode, section)?;
            let section_name = state.sections[at.section].name.clone();
            let chunk = &mut state.sections[at.section].chunks[at.chunk];
            let previous = chunk.status;
            chunk.status = ChunkStatus::InProgress;
            chunk.updated_at = Some(now_rfc3339());
            debug!(
                "Claimed chunk {}-{} (was {})",
                chunk.start, chunk.end, previous
            );
            Some(ClaimedChunk {
                section_index: at.section,
                section_name,
                chunk: chunk.clone(),
                previous,
            })
        })
    }

    /// Record a chunk's post-run status, re-locating it by `(start, end)`.
    ///
    /// Returns `false` when the chunk no longer exists (the job was re-planned
    /// underneath the runner).
    pub fn finish(
        &self,
        start: usize,
        end: usize,
        status: ChunkStatus,
        error: Option<String>,
    ) -> Result<bool, CatalogError> {
        let found = self.update(|state| match state.find_chunk_mut(start, end) {
            Some(chunk) => {
                chunk.status = status;
                chunk.error = error;
                chunk.updated_at = Some(now_rfc3339());
                true
            }
            None => false,
        })?;
        if !found {
            warn!("Chunk {}-{} vanished from state before it could be updated", start, end);
        }
        Ok(found)
    }

    fn write_atomic(&self, state: &JobState) -> Result<(), CatalogError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| CatalogError::Internal(format!("serialise state: {e}")))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.job_dir)
            .map_err(|e| CatalogError::io(&self.job_dir, e))?;
        tmp.write_all(&json)
            .map_err(|e| CatalogError::io(tmp.path(), e))?;
        tmp.persist(&self.state_path)
            .map_err(|e| CatalogError::io(&self.state_path, e.error))?;
        Ok(())
    }

    fn acquire(&self) -> Result<LockGuard, CatalogError> {
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockGuard {
                        path: self.lock_path.clone(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        warn!(
                            "Breaking stale lock {} (older than {}s)",
                            self.lock_path.display(),
                            self.stale_after.as_secs()
                        );
                        let _ = fs::remove_file(&self.lock_path);
                        continue;
                    }
                    if started.elapsed() >= self.lock_timeout {
                        return Err(CatalogError::StateLocked {
                            path: self.lock_path.clone(),
                            waited_secs: self.lock_timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(CatalogError::io(&self.lock_path, e)),
            }
        }
    }

    fn lock_is_stale(&self) -> bool {
        fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age > self.stale_after)
    }
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start: usize, end: usize, status: ChunkStatus) -> Chunk {
        Chunk {
            start,
            end,
            status,
            working_dir: PathBuf::from(format!("runs/{start}_{end}")),
            input_file: PathBuf::from(format!("runs/{start}_{end}/{start}_{end}.pdf")),
            text_file: PathBuf::from(format!("runs/{start}_{end}/extract.md")),
            error: None,
            updated_at: None,
        }
    }

    fn job(sections: Vec<Vec<Chunk>>) -> JobState {
        JobState {
            catalog_source: PathBuf::from("catalog.pdf"),
            working_dir: PathBuf::from("job"),
            status: "ready".into(),
            sections: sections
                .into_iter()
                .enumerate()
                .map(|(i, chunks)| SectionState {
                    name: format!("Section {i}"),
                    start_page: chunks.first().map(|c| c.start).unwrap_or(0),
                    end_page: chunks.last().map(|c| c.end).unwrap_or(0),
                    chunks,
                })
                .collect(),
            executions: vec![],
        }
    }

    #[test]
    fn status_serialises_screaming_snake_case() {
        let json = serde_json::to_string(&ChunkStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        let back: ChunkStatus = serde_json::from_str("\"SYNTHESIZE\"").unwrap();
        assert_eq!(back, ChunkStatus::Synthesize);
    }

    #[test]
    fn include_prefers_pending_over_earlier_synthesize() {
        let state = job(vec![
            vec![chunk(5, 9, ChunkStatus::Synthesize)],
            vec![chunk(10, 14, ChunkStatus::Pending)],
        ]);
        let at = state.find_next(SynthesisMode::Include, None).unwrap();
        assert_eq!(at, ChunkRef { section: 1, chunk: 0 });
    }

    #[test]
    fn include_falls_back_to_synthesize() {
        let state = job(vec![vec![
            chunk(5, 9, ChunkStatus::Completed),
            chunk(10, 14, ChunkStatus::Synthesize),
        ]]);
        let at = state.find_next(SynthesisMode::Include, None).unwrap();
        assert_eq!(state.chunk(at).unwrap().start, 10);
    }

    #[test]
    fn skip_ignores_synthesize_and_only_ignores_pending() {
        let state = job(vec![vec![
            chunk(5, 9, ChunkStatus::Synthesize),
            chunk(10, 14, ChunkStatus::Failed),
        ]]);
        assert!(state.find_next(SynthesisMode::Skip, None).is_none());
        assert!(state.find_next(SynthesisMode::Only, None).is_some());

        let state = job(vec![vec![chunk(5, 9, ChunkStatus::Pending)]]);
        assert!(state.find_next(SynthesisMode::Only, None).is_none());
    }

    #[test]
    fn section_filter_restricts_scan() {
        let state = job(vec![
            vec![chunk(5, 9, ChunkStatus::Pending)],
            vec![chunk(10, 14, ChunkStatus::Pending)],
        ]);
        let at = state.find_next(SynthesisMode::Include, Some(1)).unwrap();
        assert_eq!(at.section, 1);
        assert!(state.find_next(SynthesisMode::Include, Some(7)).is_none());
    }

    #[test]
    fn report_counts_in_first_seen_order() {
        let state = job(vec![vec![
            chunk(5, 9, ChunkStatus::Completed),
            chunk(10, 14, ChunkStatus::Pending),
            chunk(15, 19, ChunkStatus::Completed),
        ]]);
        let report = state.report();
        assert!(report.contains("0: Section 0 (pages 5-19) - COMPLETED: 2, PENDING: 1"), "got: {report}");
    }

    #[test]
    fn claim_then_finish_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store
            .create(&job(vec![vec![chunk(1, 3, ChunkStatus::Pending)]]), false)
            .unwrap();

        let claimed = store
            .claim_next(SynthesisMode::Include, None)
            .unwrap()
            .expect("a pending chunk");
        assert_eq!(claimed.previous, ChunkStatus::Pending);
        assert_eq!(store.load().unwrap().sections[0].chunks[0].status, ChunkStatus::InProgress);

        // Nothing else is eligible while it is in progress.
        assert!(store.claim_next(SynthesisMode::Include, None).unwrap().is_none());

        assert!(store.finish(1, 3, ChunkStatus::Completed, None).unwrap());
        let state = store.load().unwrap();
        assert_eq!(state.sections[0].chunks[0].status, ChunkStatus::Completed);
        assert!(state.sections[0].chunks[0].updated_at.is_some());
        assert!(!dir.path().join("state.json.lock").exists());
    }

    #[test]
    fn finish_unknown_chunk_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.create(&job(vec![vec![chunk(1, 3, ChunkStatus::Pending)]]), false).unwrap();
        assert!(!store.finish(4, 6, ChunkStatus::Failed, Some("x".into())).unwrap());
    }

    #[test]
    fn create_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let state = job(vec![vec![chunk(1, 3, ChunkStatus::Pending)]]);
        store.create(&state, false).unwrap();
        assert!(matches!(
            store.create(&state, false),
            Err(CatalogError::JobAlreadyExists { .. })
        ));
        store.create(&state, true).unwrap();
    }

    #[test]
    fn missing_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(matches!(store.load(), Err(CatalogError::StateNotFound { .. })));
        assert!(matches!(
            store.update(|_| ()),
            Err(CatalogError::StateNotFound { .. })
        ));
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE), "{ not json").unwrap();
        let store = StateStore::new(dir.path());
        assert!(matches!(store.load(), Err(CatalogError::StateCorrupt { .. })));
    }

    #[test]
    fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path()).with_lock_timeout(Duration::from_millis(250));
        store.create(&job(vec![vec![chunk(1, 3, ChunkStatus::Pending)]]), false).unwrap();

        fs::write(dir.path().join("state.json.lock"), "12345").unwrap();
        assert!(matches!(
            store.update(|_| ()),
            Err(CatalogError::StateLocked { .. })
        ));
    }

    #[test]
    fn stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path())
            .with_lock_timeout(Duration::from_secs(5))
            .with_stale_after(Duration::ZERO);
        store.create(&job(vec![vec![chunk(1, 3, ChunkStatus::Pending)]]), false).unwrap();

        fs::write(dir.path().join("state.json.lock"), "12345").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.claim_next(SynthesisMode::Include, None).unwrap().is_some());
    }

    #[test]
    fn chunk_geometry() {
        let c = chunk(8, 12, ChunkStatus::Pending);
        assert_eq!(c.page_offset(), 7);
        assert_eq!(c.page_count(), 5);
        assert_eq!(c.slug(), "8_12");
    }
}
