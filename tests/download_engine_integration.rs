//! Integration tests for the download engine.
//!
//! A scripted in-memory source stands in for the channel so tests can control
//! offsets, failures, timing and concurrency.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use channel_dl::catalog::Catalog;
use channel_dl::download::{DownloadEngine, RetryPolicy, RunSummary};
use channel_dl::filter::MediaCandidate;
use channel_dl::layout::{DestinationPath, partial_path};
use channel_dl::source::{
    ChunkStream, DocumentRef, MediaSource, MessageStream, SourceError,
};
use chrono::{TimeZone, Utc};
use futures_util::{StreamExt, stream};
use sha1::{Digest, Sha1};
use tempfile::TempDir;

const CHUNK_SIZE: usize = 4;

/// Serves document bytes from memory, with optional scripted failures per locator.
#[derive(Default)]
struct ScriptedSource {
    content: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, VecDeque<SourceError>>>,
    reads: Mutex<Vec<(String, u64)>>,
    chunk_delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedSource {
    fn with_document(mut self, locator: &str, content: &[u8]) -> Self {
        self.content.insert(locator.to_string(), content.to_vec());
        self
    }

    fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn fail_with(self, locator: &str, errors: Vec<SourceError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(locator.to_string(), errors.into());
        self
    }

    fn reads_of(&self, locator: &str) -> Vec<u64> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| l == locator)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

/// Counts a stream as active download I/O until it is dropped.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSource for ScriptedSource {
    fn identity(&self) -> &str {
        "scripted"
    }

    async fn messages(&self) -> Result<MessageStream<'_>, SourceError> {
        Ok(stream::empty().boxed())
    }

    async fn read_from(
        &self,
        document: &DocumentRef,
        offset: u64,
    ) -> Result<ChunkStream<'_>, SourceError> {
        self.reads
            .lock()
            .unwrap()
            .push((document.locator.clone(), offset));

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&document.locator)
            .and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        let content = self
            .content
            .get(&document.locator)
            .cloned()
            .unwrap_or_default();
        let start = usize::try_from(offset).unwrap().min(content.len());
        let chunks: Vec<Bytes> = content[start..]
            .chunks(CHUNK_SIZE)
            .map(Bytes::copy_from_slice)
            .collect();

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let guard = ActiveGuard(&self.active);
        let delay = self.chunk_delay;

        Ok(stream::unfold(
            (chunks.into_iter(), guard),
            move |(mut chunks, guard)| async move {
                let Some(chunk) = chunks.next() else {
                    return None;
                };
                tokio::time::sleep(delay).await;
                Some((Ok::<_, SourceError>(chunk), (chunks, guard)))
            },
        )
        .boxed())
    }
}

fn candidate(id: i64, caption: &str, locator: &str, size: u64) -> MediaCandidate {
    let identifier = caption
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    MediaCandidate {
        message_id: id,
        identifier,
        caption: caption.to_string(),
        date: Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap(),
        forwarded: false,
        reply: false,
        document: DocumentRef {
            locator: locator.to_string(),
            size,
            is_video: true,
            mime_type: Some("video/mp4".to_string()),
        },
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO, Duration::ZERO, Duration::ZERO)
}

async fn run_engine(
    engine: &DownloadEngine,
    source: Arc<ScriptedSource>,
    catalog: Arc<Catalog>,
    root: &Path,
    candidates: Vec<MediaCandidate>,
) -> RunSummary {
    engine
        .run(
            stream::iter(candidates),
            source,
            catalog,
            root,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap()
}

fn sha1_hex(content: &[u8]) -> String {
    format!("{:x}", Sha1::digest(content))
}

#[tokio::test]
async fn test_download_commits_file_and_catalog_record() {
    let root = TempDir::new().unwrap();
    let content = b"lesson two video bytes";
    let source = Arc::new(ScriptedSource::default().with_document("doc-1", content));
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let engine = DownloadEngine::new(3, fast_policy(6)).unwrap();

    let caption = "#F0001 .mp4\nCourse\n=Module 1\n==Lesson 2";
    let summary = run_engine(
        &engine,
        Arc::clone(&source),
        Arc::clone(&catalog),
        root.path(),
        vec![candidate(1, caption, "doc-1", content.len() as u64)],
    )
    .await;

    let final_path = root
        .path()
        .join("Course/Module 1/Lesson 2/Lesson 2 (#F0001).mp4");
    assert_eq!(std::fs::read(&final_path).unwrap(), content);
    assert!(!partial_path(&final_path).exists());

    assert!(summary.is_clean());
    assert_eq!(summary.stats().completed(), 1);
    assert_eq!(
        summary.written().iter().collect::<Vec<_>>(),
        vec![&DestinationPath::from_caption(caption, "#F0001")]
    );

    let records = catalog.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message_id, 1);
    assert_eq!(records[0].file_name, "Lesson 2 (#F0001).mp4");
    assert_eq!(records[0].size, content.len() as u64);
    assert_eq!(records[0].sha1, sha1_hex(content));
    assert_eq!(records[0].path, final_path.to_string_lossy());

    // The catalog file on disk mirrors memory.
    let reloaded = Catalog::load(&root.path().join("metadados.json")).await;
    assert!(reloaded.exists("Lesson 2 (#F0001).mp4", content.len() as u64));
}

#[tokio::test]
async fn test_resume_requests_partial_length_offset() {
    let root = TempDir::new().unwrap();
    let content = b"0123456789abcdef";
    let caption = "#F0002 .mp4\nCourse\n=Resume";
    let destination = DestinationPath::from_caption(caption, "#F0002");
    let final_path = destination.under(root.path());
    std::fs::create_dir_all(final_path.parent().unwrap()).unwrap();
    std::fs::write(partial_path(&final_path), &content[..6]).unwrap();

    let source = Arc::new(ScriptedSource::default().with_document("doc-2", content));
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let engine = DownloadEngine::new(1, fast_policy(6)).unwrap();

    let summary = run_engine(
        &engine,
        Arc::clone(&source),
        catalog,
        root.path(),
        vec![candidate(2, caption, "doc-2", content.len() as u64)],
    )
    .await;

    assert_eq!(summary.stats().completed(), 1);
    assert_eq!(source.reads_of("doc-2"), vec![6]);
    assert_eq!(std::fs::read(&final_path).unwrap(), content);
}

#[tokio::test]
async fn test_oversized_partial_is_discarded_and_restarted() {
    let root = TempDir::new().unwrap();
    let content = b"0123456789";
    let caption = "#F0003 .mp4\nCourse\n=Corrupt";
    let final_path = DestinationPath::from_caption(caption, "#F0003").under(root.path());
    std::fs::create_dir_all(final_path.parent().unwrap()).unwrap();
    std::fs::write(partial_path(&final_path), b"this partial is far too long").unwrap();

    let source = Arc::new(ScriptedSource::default().with_document("doc-3", content));
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let engine = DownloadEngine::new(1, fast_policy(6)).unwrap();

    let summary = run_engine(
        &engine,
        Arc::clone(&source),
        catalog,
        root.path(),
        vec![candidate(3, caption, "doc-3", content.len() as u64)],
    )
    .await;

    assert_eq!(summary.stats().completed(), 1);
    assert_eq!(source.reads_of("doc-3"), vec![0]);
    assert_eq!(std::fs::read(&final_path).unwrap(), content);
}

#[tokio::test]
async fn test_catalog_duplicate_is_never_downloaded() {
    let root = TempDir::new().unwrap();
    let catalog_path = root.path().join("metadados.json");
    std::fs::write(
        &catalog_path,
        r#"[{
            "id_mensagem": 99,
            "data": "2024-01-01T00:00:00Z",
            "nome_original": "Intro (#F0004).mp4",
            "tamanho": 10,
            "eh_video": true,
            "legenda": "old caption",
            "sha1": "",
            "caminho": "elsewhere/Intro (#F0004).mp4"
        }]"#,
    )
    .unwrap();

    let source = Arc::new(ScriptedSource::default().with_document("doc-4", b"0123456789"));
    let catalog = Arc::new(Catalog::load(&catalog_path).await);
    let engine = DownloadEngine::new(2, fast_policy(6)).unwrap();

    // Different hierarchy, same resulting file name and size.
    let summary = run_engine(
        &engine,
        Arc::clone(&source),
        Arc::clone(&catalog),
        root.path(),
        vec![candidate(4, "#F0004 .mp4\nAnother Course\n=Intro", "doc-4", 10)],
    )
    .await;

    assert_eq!(summary.stats().skipped_duplicates(), 1);
    assert_eq!(summary.stats().attempted(), 0);
    assert!(summary.written().is_empty());
    assert!(source.reads_of("doc-4").is_empty());
    assert_eq!(catalog.len().await, 1);
}

#[tokio::test]
async fn test_dedup_disabled_downloads_again() {
    let root = TempDir::new().unwrap();
    let catalog_path = root.path().join("metadados.json");
    std::fs::write(
        &catalog_path,
        r#"[{"id_mensagem": 1, "data": "2024-01-01T00:00:00Z", "nome_original": "Intro (#F0005).mp4", "tamanho": 4}]"#,
    )
    .unwrap();

    let source = Arc::new(ScriptedSource::default().with_document("doc-5", b"abcd"));
    let catalog = Arc::new(Catalog::load(&catalog_path).await);
    let engine = DownloadEngine::new(1, fast_policy(6))
        .unwrap()
        .with_dedup(false);

    let summary = run_engine(
        &engine,
        Arc::clone(&source),
        Arc::clone(&catalog),
        root.path(),
        vec![candidate(5, "#F0005 .mp4\nCourse\n=Intro", "doc-5", 4)],
    )
    .await;

    assert_eq!(summary.stats().completed(), 1);
    assert_eq!(source.reads_of("doc-5"), vec![0]);
    assert_eq!(catalog.len().await, 2);
}

#[tokio::test]
async fn test_five_timeouts_then_success_commits_on_sixth_attempt() {
    let root = TempDir::new().unwrap();
    let content = b"eventually delivered";
    let timeouts = (0..5).map(|_| SourceError::timeout("doc-6")).collect();
    let source = Arc::new(
        ScriptedSource::default()
            .with_document("doc-6", content)
            .fail_with("doc-6", timeouts),
    );
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let engine = DownloadEngine::new(1, fast_policy(6)).unwrap();

    let summary = run_engine(
        &engine,
        Arc::clone(&source),
        Arc::clone(&catalog),
        root.path(),
        vec![candidate(6, "#F0006 .mp4\nCourse\n=Slow", "doc-6", content.len() as u64)],
    )
    .await;

    assert_eq!(source.reads_of("doc-6").len(), 6);
    assert_eq!(summary.stats().retried(), 5);
    assert_eq!(summary.stats().completed(), 1);
    assert_eq!(summary.stats().failed(), 0);
    assert_eq!(catalog.len().await, 1);
}

#[tokio::test]
async fn test_exhausted_budget_fails_item_without_affecting_others() {
    let root = TempDir::new().unwrap();
    let errors = (0..6)
        .map(|_| SourceError::HttpStatus {
            locator: "bad".to_string(),
            status: 503,
        })
        .collect();
    let source = Arc::new(
        ScriptedSource::default()
            .with_document("bad", b"never")
            .with_document("good", b"fine bytes")
            .fail_with("bad", errors),
    );
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let engine = DownloadEngine::new(2, fast_policy(6)).unwrap();

    let good_caption = "#F0008 .mp4\nCourse\n=Good";
    let summary = run_engine(
        &engine,
        Arc::clone(&source),
        Arc::clone(&catalog),
        root.path(),
        vec![
            candidate(7, "#F0007 .mp4\nCourse\n=Bad", "bad", 5),
            candidate(8, good_caption, "good", 10),
        ],
    )
    .await;

    assert_eq!(source.reads_of("bad").len(), 6);
    assert_eq!(summary.stats().failed(), 1);
    assert_eq!(summary.stats().completed(), 1);
    assert_eq!(summary.stats().attempted(), 2);
    assert!(!summary.is_clean());
    assert_eq!(
        summary.written().iter().collect::<Vec<_>>(),
        vec![&DestinationPath::from_caption(good_caption, "#F0008")]
    );
    assert!(!root.path().join("Course/Bad/Bad (#F0007).mp4").exists());

    let records = catalog.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message_id, 8);
}

#[tokio::test]
async fn test_rate_limit_waits_requested_duration() {
    let root = TempDir::new().unwrap();
    let source = Arc::new(
        ScriptedSource::default()
            .with_document("doc-9", b"throttled")
            .fail_with(
                "doc-9",
                vec![SourceError::RateLimited {
                    wait: Duration::from_millis(200),
                }],
            ),
    );
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let policy = RetryPolicy::new(
        6,
        Duration::from_millis(50),
        Duration::ZERO,
        Duration::ZERO,
    );
    let engine = DownloadEngine::new(1, policy).unwrap();

    let started = Instant::now();
    let summary = run_engine(
        &engine,
        Arc::clone(&source),
        catalog,
        root.path(),
        vec![candidate(9, "#F0009 .mp4\nCourse\n=Busy", "doc-9", 9)],
    )
    .await;

    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(summary.stats().retried(), 1);
    assert_eq!(summary.stats().completed(), 1);
}

#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let root = TempDir::new().unwrap();
    let mut source = ScriptedSource::default().with_chunk_delay(Duration::from_millis(10));
    let mut candidates = Vec::new();
    for i in 0..8 {
        let locator = format!("doc-c{i}");
        source = source.with_document(&locator, b"twelve bytes");
        candidates.push(candidate(
            100 + i,
            &format!("#F01{i:02} .mp4\nCourse\n=Part {i}"),
            &locator,
            12,
        ));
    }
    let source = Arc::new(source);
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let engine = DownloadEngine::new(2, fast_policy(6)).unwrap();

    let summary = run_engine(
        &engine,
        Arc::clone(&source),
        Arc::clone(&catalog),
        root.path(),
        candidates,
    )
    .await;

    assert_eq!(summary.stats().completed(), 8);
    assert_eq!(summary.written().len(), 8);
    assert_eq!(catalog.len().await, 8);
    let max_active = source.max_active.load(Ordering::SeqCst);
    assert!(max_active <= 2, "at most 2 concurrent reads, saw {max_active}");
    assert!(max_active >= 1);
}

#[tokio::test]
async fn test_limit_stops_scheduling() {
    let root = TempDir::new().unwrap();
    let mut source = ScriptedSource::default();
    let mut candidates = Vec::new();
    for i in 0..4 {
        let locator = format!("doc-l{i}");
        source = source.with_document(&locator, b"data");
        candidates.push(candidate(
            200 + i,
            &format!("#F02{i:02} .mp4\nLimited\n=Item {i}"),
            &locator,
            4,
        ));
    }
    let source = Arc::new(source);
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let engine = DownloadEngine::new(1, fast_policy(6))
        .unwrap()
        .with_limit(2);

    let summary = run_engine(&engine, Arc::clone(&source), catalog, root.path(), candidates).await;

    assert_eq!(summary.stats().completed(), 2);
    assert!(source.reads_of("doc-l2").is_empty());
    assert!(source.reads_of("doc-l3").is_empty());
}

#[tokio::test]
async fn test_candidate_stream_need_not_be_send() {
    let root = TempDir::new().unwrap();
    let content = b"single threaded";
    let source = Arc::new(ScriptedSource::default().with_document("doc-local", content));
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let engine = DownloadEngine::new(2, fast_policy(2)).unwrap();

    // Capturing an Rc makes the stream !Send; it is only polled by the caller.
    let local = Rc::new(candidate(9, "#F0009 .mp4\nLocal", "doc-local", content.len() as u64));
    let candidates = stream::iter(0..1).map(move |_| (*local).clone());

    let summary = engine
        .run(
            candidates,
            Arc::clone(&source) as Arc<dyn MediaSource>,
            catalog,
            root.path(),
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

    assert_eq!(summary.stats().completed(), 1);
    assert!(root.path().join("Local/Local (#F0009).mp4").exists());
}

#[tokio::test]
async fn test_interrupt_keeps_partial_file_and_stops_admission() {
    let root = TempDir::new().unwrap();
    let content = vec![7u8; CHUNK_SIZE * 40];
    let source = Arc::new(
        ScriptedSource::default()
            .with_chunk_delay(Duration::from_millis(20))
            .with_document("slow", &content)
            .with_document("next", b"never read"),
    );
    let catalog = Arc::new(Catalog::empty(root.path().join("metadados.json")));
    let engine = DownloadEngine::new(1, fast_policy(6)).unwrap();
    let interrupted = Arc::new(AtomicBool::new(false));

    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            interrupted.store(true, Ordering::SeqCst);
        });
    }

    let slow_caption = "#F0010 .mp4\nCourse\n=Slow";
    let summary = engine
        .run(
            stream::iter(vec![
                candidate(10, slow_caption, "slow", content.len() as u64),
                candidate(11, "#F0011 .mp4\nCourse\n=Next", "next", 10),
            ]),
            Arc::clone(&source) as Arc<dyn MediaSource>,
            Arc::clone(&catalog),
            root.path(),
            interrupted,
        )
        .await
        .unwrap();

    assert!(summary.was_interrupted());
    assert_eq!(summary.stats().completed(), 0);
    assert_eq!(summary.stats().interrupted(), 1);
    assert!(source.reads_of("next").is_empty());
    assert!(catalog.is_empty().await);

    let final_path = DestinationPath::from_caption(slow_caption, "#F0010").under(root.path());
    assert!(!final_path.exists());
    let partial_len = std::fs::metadata(partial_path(&final_path)).unwrap().len();
    assert!(partial_len > 0 && partial_len < content.len() as u64);
    assert_eq!(partial_len % CHUNK_SIZE as u64, 0, "only whole chunks are written");
}
