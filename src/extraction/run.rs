use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::extraction::source::{SourceAdapter, SourceError};
use crate::extraction::transform::{transform_record, DealRecord};
use crate::jobs::checkpoint::{CheckpointDetail, CheckpointPayload, Phase};

const SERVICE_TAG: &str = "crm_deals";

/// What a signal poll observed. Cancellation outranks pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Proceed,
    Pause,
    Cancel,
}

/// Control token handed to the loop at start. Polls read the store's
/// status column and nothing else, keeping signal delivery separate from
/// business-state reads. Poll failures report `Proceed`; a dead store
/// will surface on the next page fetch or checkpoint write instead.
#[async_trait]
pub trait ControlSignals: Send + Sync {
    async fn poll(&self, job_id: &str) -> Signal;
}

/// Durable, upsert-capable destination for transformed records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert(&self, record: &DealRecord) -> Result<(), EngineError>;
}

/// Checkpoint append. Implementations also stamp the job heartbeat.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(&self, job_id: &str, payload: CheckpointPayload) -> Result<(), EngineError>;
}

/// Loop knobs. Intervals are in pages.
#[derive(Debug, Clone)]
pub struct ExtractionTuning {
    pub page_size: i64,
    pub checkpoint_interval: i64,
    pub signal_check_interval: i64,
    pub page_safety_limit: i64,
}

impl Default for ExtractionTuning {
    fn default() -> Self {
        Self {
            page_size: 100,
            checkpoint_interval: 10,
            signal_check_interval: 1,
            page_safety_limit: 1000,
        }
    }
}

/// Position to restart from, read off the latest checkpoint.
#[derive(Debug, Clone, Default)]
pub struct ResumePoint {
    pub cursor: Option<String>,
    pub page_number: i64,
    pub records_processed: i64,
}

/// How the loop ended. Errors travel separately as `Err`; everything here
/// is a graceful exit the orchestrator pattern-matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed { records_processed: i64, pages: i64 },
    Paused { records_processed: i64 },
    Cancelled { records_processed: i64 },
}

pub struct ExtractionContext<'a> {
    pub job_id: &'a str,
    pub organization_id: &'a str,
    pub access_token: &'a str,
    pub properties: Option<&'a [String]>,
}

/// The cooperative page-fetch loop.
///
/// Strictly sequential: one page in flight at a time, signals polled at
/// page granularity (configurable) and pause additionally at record
/// granularity, checkpoints appended at the configured cadence and at
/// every exit path. A mid-page pause intentionally abandons the partial
/// page; resume re-fetches it from its start cursor, and the sink's
/// upsert key absorbs the duplicates.
pub async fn run_extraction(
    ctx: ExtractionContext<'_>,
    tuning: &ExtractionTuning,
    resume_from: Option<ResumePoint>,
    source: &dyn SourceAdapter,
    sink: &dyn RecordSink,
    checkpoints: &dyn CheckpointSink,
    signals: &dyn ControlSignals,
) -> Result<LoopOutcome, EngineError> {
    let (mut cursor, mut page_count, mut total_records) = match resume_from {
        Some(point) => {
            info!(
                "Resuming data extraction: job_id={}, page_number={}, total_processed={}",
                ctx.job_id,
                point.page_number + 1,
                point.records_processed
            );
            (point.cursor, point.page_number, point.records_processed)
        }
        None => {
            info!("Starting fresh data extraction: job_id={}", ctx.job_id);
            (None, 0, 0)
        }
    };

    let mut last_processed_id: Option<String> = None;

    while page_count < tuning.page_safety_limit {
        if page_count % tuning.signal_check_interval == 0 {
            match signals.poll(ctx.job_id).await {
                Signal::Cancel => {
                    info!(
                        "Extraction cancelled: job_id={}, page_number={}, total_processed={}",
                        ctx.job_id,
                        page_count + 1,
                        total_records
                    );
                    save_best_effort(
                        checkpoints,
                        ctx.job_id,
                        CheckpointPayload {
                            phase: Phase::MainDataCancelled,
                            records_processed: total_records,
                            total_estimated: None,
                            cursor: cursor.clone(),
                            page_number: page_count,
                            batch_size: tuning.page_size,
                            last_processed_id: last_processed_id.clone(),
                            last_processed_timestamp: None,
                            detail: CheckpointDetail::Cancelled {
                                cancellation_reason: "user_requested".to_string(),
                                cancelled_at_page: page_count,
                                service: SERVICE_TAG.to_string(),
                            },
                        },
                    )
                    .await;
                    return Ok(LoopOutcome::Cancelled {
                        records_processed: total_records,
                    });
                }
                Signal::Pause => {
                    info!(
                        "Extraction paused: job_id={}, page_number={}, total_processed={}",
                        ctx.job_id,
                        page_count + 1,
                        total_records
                    );
                    save_best_effort(
                        checkpoints,
                        ctx.job_id,
                        CheckpointPayload {
                            phase: Phase::MainDataPaused,
                            records_processed: total_records,
                            total_estimated: None,
                            cursor: cursor.clone(),
                            page_number: page_count,
                            batch_size: tuning.page_size,
                            last_processed_id: last_processed_id.clone(),
                            last_processed_timestamp: None,
                            detail: CheckpointDetail::Paused {
                                pause_reason: "user_requested".to_string(),
                                paused_at_page: page_count,
                                paused_at: Utc::now(),
                                service: SERVICE_TAG.to_string(),
                            },
                        },
                    )
                    .await;
                    return Ok(LoopOutcome::Paused {
                        records_processed: total_records,
                    });
                }
                Signal::Proceed => {}
            }
        }

        debug!(
            "Fetching page: job_id={}, page_number={}",
            ctx.job_id,
            page_count + 1
        );

        let page = match source
            .fetch_page(
                ctx.access_token,
                cursor.as_deref(),
                tuning.page_size,
                ctx.properties,
            )
            .await
        {
            Ok(page) => page,
            Err(e) => {
                return Err(fail_with_checkpoint(
                    checkpoints,
                    ctx.job_id,
                    e,
                    total_records,
                    cursor,
                    page_count,
                    tuning.page_size,
                )
                .await);
            }
        };

        let mut page_records: i64 = 0;
        for raw in &page.records {
            // Record-granularity pause check bounds the window of work a
            // pause request can lose to one record.
            if signals.poll(ctx.job_id).await == Signal::Pause {
                info!(
                    "Extraction paused mid-page: job_id={}, page_number={}, records_in_page={}",
                    ctx.job_id,
                    page_count + 1,
                    page_records
                );
                save_best_effort(
                    checkpoints,
                    ctx.job_id,
                    CheckpointPayload {
                        phase: Phase::MainDataPausedMidPage,
                        records_processed: total_records + page_records,
                        total_estimated: None,
                        // Cursor of the page in progress: resume re-fetches
                        // this page from its start.
                        cursor: cursor.clone(),
                        page_number: page_count,
                        batch_size: tuning.page_size,
                        last_processed_id: last_processed_id.clone(),
                        last_processed_timestamp: None,
                        detail: CheckpointDetail::PausedMidPage {
                            pause_reason: "user_requested_mid_page".to_string(),
                            paused_at_page: page_count,
                            records_completed_in_page: page_records,
                            paused_at: Utc::now(),
                            service: SERVICE_TAG.to_string(),
                        },
                    },
                )
                .await;
                return Ok(LoopOutcome::Paused {
                    records_processed: total_records + page_records,
                });
            }

            let record = transform_record(raw, ctx.job_id, ctx.organization_id, page_count + 1);
            if let Err(e) = sink.upsert(&record).await {
                return Err(fail_with_checkpoint(
                    checkpoints,
                    ctx.job_id,
                    e,
                    total_records + page_records,
                    cursor,
                    page_count,
                    tuning.page_size,
                )
                .await);
            }
            last_processed_id = Some(raw.id.clone());
            page_records += 1;
        }

        total_records += page_records;
        page_count += 1;

        if page_count % tuning.checkpoint_interval == 0 {
            save_best_effort(
                checkpoints,
                ctx.job_id,
                CheckpointPayload {
                    phase: Phase::MainData,
                    records_processed: total_records,
                    total_estimated: None,
                    cursor: page.next_cursor.clone(),
                    page_number: page_count,
                    batch_size: tuning.page_size,
                    last_processed_id: last_processed_id.clone(),
                    last_processed_timestamp: None,
                    detail: CheckpointDetail::Progress {
                        pages_processed: page_count,
                        last_page_records: page_records,
                        service: SERVICE_TAG.to_string(),
                    },
                },
            )
            .await;
        }

        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => {
                save_best_effort(
                    checkpoints,
                    ctx.job_id,
                    CheckpointPayload {
                        phase: Phase::MainDataCompleted,
                        records_processed: total_records,
                        total_estimated: None,
                        cursor: None,
                        page_number: page_count,
                        batch_size: tuning.page_size,
                        last_processed_id: last_processed_id.clone(),
                        last_processed_timestamp: None,
                        detail: CheckpointDetail::Completed {
                            completion_status: "success".to_string(),
                            total_pages: page_count,
                            final_total: total_records,
                            service: SERVICE_TAG.to_string(),
                        },
                    },
                )
                .await;
                info!(
                    "Data extraction completed: job_id={}, total_records={}, total_pages={}",
                    ctx.job_id, total_records, page_count
                );
                return Ok(LoopOutcome::Completed {
                    records_processed: total_records,
                    pages: page_count,
                });
            }
        }
    }

    // Safety limit tripped: the upstream keeps paginating past any sane
    // bound. Leave a resumable marker and stop.
    warn!(
        "Page safety limit reached: job_id={}, pages={}",
        ctx.job_id, page_count
    );
    save_best_effort(
        checkpoints,
        ctx.job_id,
        CheckpointPayload {
            phase: Phase::MainData,
            records_processed: total_records,
            total_estimated: None,
            cursor,
            page_number: page_count,
            batch_size: tuning.page_size,
            last_processed_id,
            last_processed_timestamp: None,
            detail: CheckpointDetail::Progress {
                pages_processed: page_count,
                last_page_records: 0,
                service: SERVICE_TAG.to_string(),
            },
        },
    )
    .await;
    Ok(LoopOutcome::Completed {
        records_processed: total_records,
        pages: page_count,
    })
}

async fn save_best_effort(checkpoints: &dyn CheckpointSink, job_id: &str, payload: CheckpointPayload) {
    if let Err(e) = checkpoints.save(job_id, payload).await {
        warn!("Failed to save checkpoint for job {}: {}", job_id, e);
    }
}

/// Write the error checkpoint preserving the recovery cursor, then hand
/// the failure up. The cursor is the one the failing page was fetched
/// with, so a fresh attempt resumes at the same page.
async fn fail_with_checkpoint(
    checkpoints: &dyn CheckpointSink,
    job_id: &str,
    cause: impl Into<FetchFailure>,
    records_processed: i64,
    cursor: Option<String>,
    page_count: i64,
    batch_size: i64,
) -> EngineError {
    let failure = cause.into();
    error!(
        "Error during extraction: job_id={}, page_number={}, error={}",
        job_id,
        page_count + 1,
        failure.message
    );
    save_best_effort(
        checkpoints,
        job_id,
        CheckpointPayload {
            phase: Phase::MainDataError,
            records_processed,
            total_estimated: None,
            cursor: cursor.clone(),
            page_number: page_count,
            batch_size,
            last_processed_id: None,
            last_processed_timestamp: None,
            detail: CheckpointDetail::Error {
                error: failure.message.clone(),
                error_page: page_count + 1,
                recovery_cursor: cursor,
                service: SERVICE_TAG.to_string(),
            },
        },
    )
    .await;
    failure.into_engine_error(page_count + 1)
}

struct FetchFailure {
    message: String,
    engine: Option<EngineError>,
}

impl FetchFailure {
    fn into_engine_error(self, page: i64) -> EngineError {
        match self.engine {
            Some(e) => e,
            None => EngineError::UpstreamFetch {
                page,
                message: self.message,
            },
        }
    }
}

impl From<SourceError> for FetchFailure {
    fn from(e: SourceError) -> Self {
        FetchFailure {
            message: e.to_string(),
            engine: None,
        }
    }
}

impl From<EngineError> for FetchFailure {
    fn from(e: EngineError) -> Self {
        FetchFailure {
            message: e.to_string(),
            engine: Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::Map;

    use super::*;
    use crate::extraction::source::{Page, RawRecord, SourceError};

    fn record(id: &str) -> RawRecord {
        let mut properties = Map::new();
        properties.insert("dealname".into(), format!("deal {}", id).into());
        RawRecord {
            id: id.to_string(),
            properties,
            archived: false,
            created_at: None,
            updated_at: None,
        }
    }

    fn records(prefix: &str, count: usize) -> Vec<RawRecord> {
        (1..=count)
            .map(|i| record(&format!("{}-{}", prefix, i)))
            .collect()
    }

    /// Pages keyed by the cursor they are fetched with ("" = fresh start).
    struct FakeSource {
        pages: HashMap<String, (Vec<RawRecord>, Option<String>)>,
        fail_on: Option<String>,
    }

    impl FakeSource {
        fn three_pages() -> Self {
            // 10 + 10 + 5 records across three pages.
            let mut pages = HashMap::new();
            pages.insert("".to_string(), (records("p1", 10), Some("c2".to_string())));
            pages.insert("c2".to_string(), (records("p2", 10), Some("c3".to_string())));
            pages.insert("c3".to_string(), (records("p3", 5), None));
            Self {
                pages,
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeSource {
        async fn fetch_page(
            &self,
            _access_token: &str,
            cursor: Option<&str>,
            _page_size: i64,
            _properties: Option<&[String]>,
        ) -> Result<Page, SourceError> {
            let key = cursor.unwrap_or("");
            if self.fail_on.as_deref() == Some(key) {
                return Err(SourceError::Api {
                    status: 500,
                    message: "upstream exploded".to_string(),
                });
            }
            let (records, next) = self
                .pages
                .get(key)
                .cloned()
                .unwrap_or_else(|| (Vec::new(), None));
            Ok(Page {
                records,
                next_cursor: next,
            })
        }
    }

    /// Source that never runs out of pages; exercises the safety limit.
    struct EndlessSource;

    #[async_trait]
    impl SourceAdapter for EndlessSource {
        async fn fetch_page(
            &self,
            _access_token: &str,
            _cursor: Option<&str>,
            _page_size: i64,
            _properties: Option<&[String]>,
        ) -> Result<Page, SourceError> {
            Ok(Page {
                records: records("loop", 2),
                next_cursor: Some("again".to_string()),
            })
        }
    }

    /// Collects upserts; optionally raises the pause flag once the total
    /// record count reaches a threshold, modeling an operator pausing the
    /// scan at a known point.
    struct MemorySink {
        records: Mutex<Vec<DealRecord>>,
        pause_at: Option<(usize, Arc<AtomicBool>)>,
    }

    impl MemorySink {
        fn new() -> Self {
            Self {
                records: Mutex::new(Vec::new()),
                pause_at: None,
            }
        }

        fn pausing_after(count: usize, flag: Arc<AtomicBool>) -> Self {
            Self {
                records: Mutex::new(Vec::new()),
                pause_at: Some((count, flag)),
            }
        }

        fn count(&self) -> usize {
            self.records.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn upsert(&self, record: &DealRecord) -> Result<(), EngineError> {
            let mut records = self.records.lock().unwrap();
            records.push(record.clone());
            if let Some((threshold, flag)) = &self.pause_at {
                if records.len() >= *threshold {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryCheckpoints {
        saved: Mutex<Vec<CheckpointPayload>>,
    }

    impl MemoryCheckpoints {
        fn last(&self) -> CheckpointPayload {
            self.saved.lock().unwrap().last().cloned().expect("no checkpoint written")
        }

        fn phases(&self) -> Vec<Phase> {
            self.saved.lock().unwrap().iter().map(|p| p.phase).collect()
        }
    }

    #[async_trait]
    impl CheckpointSink for MemoryCheckpoints {
        async fn save(&self, _job_id: &str, payload: CheckpointPayload) -> Result<(), EngineError> {
            self.saved.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct FlagSignals {
        pause: Arc<AtomicBool>,
        cancel: Arc<AtomicBool>,
    }

    impl FlagSignals {
        fn quiet() -> Self {
            Self {
                pause: Arc::new(AtomicBool::new(false)),
                cancel: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl ControlSignals for FlagSignals {
        async fn poll(&self, _job_id: &str) -> Signal {
            if self.cancel.load(Ordering::SeqCst) {
                Signal::Cancel
            } else if self.pause.load(Ordering::SeqCst) {
                Signal::Pause
            } else {
                Signal::Proceed
            }
        }
    }

    fn ctx<'a>() -> ExtractionContext<'a> {
        ExtractionContext {
            job_id: "j1",
            organization_id: "o1",
            access_token: "token",
            properties: None,
        }
    }

    fn tuning() -> ExtractionTuning {
        ExtractionTuning::default()
    }

    #[tokio::test]
    async fn completes_all_pages_with_final_checkpoint() {
        let source = FakeSource::three_pages();
        let sink = MemorySink::new();
        let checkpoints = MemoryCheckpoints::default();
        let signals = FlagSignals::quiet();

        let outcome = run_extraction(ctx(), &tuning(), None, &source, &sink, &checkpoints, &signals)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Completed {
                records_processed: 25,
                pages: 3
            }
        );
        assert_eq!(sink.count(), 25);

        let last = checkpoints.last();
        assert_eq!(last.phase, Phase::MainDataCompleted);
        assert_eq!(last.records_processed, 25);
        assert!(last.cursor.is_none());
        assert!(matches!(
            last.detail,
            CheckpointDetail::Completed {
                total_pages: 3,
                final_total: 25,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn pause_between_pages_then_resume_to_completion() {
        // Pause signal raised once 20 records (pages 1-2) have landed.
        let source = FakeSource::three_pages();
        let pause = Arc::new(AtomicBool::new(false));
        let sink = MemorySink::pausing_after(20, pause.clone());
        let checkpoints = MemoryCheckpoints::default();
        let signals = FlagSignals {
            pause: pause.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
        };

        let outcome = run_extraction(ctx(), &tuning(), None, &source, &sink, &checkpoints, &signals)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Paused {
                records_processed: 20
            }
        );
        let paused = checkpoints.last();
        assert_eq!(paused.phase, Phase::MainDataPaused);
        assert_eq!(paused.records_processed, 20);
        assert_eq!(paused.page_number, 2);
        assert_eq!(paused.cursor.as_deref(), Some("c3"));

        // Resume from the checkpoint; cumulative counters continue.
        let resume = ResumePoint {
            cursor: paused.cursor.clone(),
            page_number: paused.page_number,
            records_processed: paused.records_processed,
        };
        let sink2 = MemorySink::new();
        let signals2 = FlagSignals::quiet();
        let outcome = run_extraction(
            ctx(),
            &tuning(),
            Some(resume),
            &source,
            &sink2,
            &checkpoints,
            &signals2,
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Completed {
                records_processed: 25,
                pages: 3
            }
        );
        assert_eq!(sink2.count(), 5);
        let last = checkpoints.last();
        assert_eq!(last.phase, Phase::MainDataCompleted);
        assert_eq!(last.records_processed, 25);
    }

    #[tokio::test]
    async fn cancel_stops_before_fetching() {
        let source = FakeSource::three_pages();
        let sink = MemorySink::new();
        let checkpoints = MemoryCheckpoints::default();
        let signals = FlagSignals::quiet();
        signals.cancel.store(true, Ordering::SeqCst);

        let outcome = run_extraction(ctx(), &tuning(), None, &source, &sink, &checkpoints, &signals)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Cancelled {
                records_processed: 0
            }
        );
        assert_eq!(sink.count(), 0);
        assert_eq!(checkpoints.last().phase, Phase::MainDataCancelled);
    }

    #[tokio::test]
    async fn mid_page_pause_abandons_partial_page() {
        // Flag raised after 15 records: 5 into page 2.
        let source = FakeSource::three_pages();
        let pause = Arc::new(AtomicBool::new(false));
        let sink = MemorySink::pausing_after(15, pause.clone());
        let checkpoints = MemoryCheckpoints::default();
        let signals = FlagSignals {
            pause,
            cancel: Arc::new(AtomicBool::new(false)),
        };

        let outcome = run_extraction(ctx(), &tuning(), None, &source, &sink, &checkpoints, &signals)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Paused {
                records_processed: 15
            }
        );

        let paused = checkpoints.last();
        assert_eq!(paused.phase, Phase::MainDataPausedMidPage);
        assert_eq!(paused.records_processed, 15);
        // Still on page 2: its fetch cursor is kept so resume re-reads the
        // whole page.
        assert_eq!(paused.page_number, 1);
        assert_eq!(paused.cursor.as_deref(), Some("c2"));
        match paused.detail {
            CheckpointDetail::PausedMidPage {
                records_completed_in_page,
                ..
            } => assert_eq!(records_completed_in_page, 5),
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_error_preserves_recovery_cursor() {
        let mut source = FakeSource::three_pages();
        source.fail_on = Some("c2".to_string());
        let sink = MemorySink::new();
        let checkpoints = MemoryCheckpoints::default();
        let signals = FlagSignals::quiet();

        let err = run_extraction(ctx(), &tuning(), None, &source, &sink, &checkpoints, &signals)
            .await
            .unwrap_err();

        match err {
            EngineError::UpstreamFetch { page, .. } => assert_eq!(page, 2),
            other => panic!("expected UpstreamFetch, got {:?}", other),
        }

        let last = checkpoints.last();
        assert_eq!(last.phase, Phase::MainDataError);
        assert_eq!(last.records_processed, 10);
        assert_eq!(last.cursor.as_deref(), Some("c2"));
        match last.detail {
            CheckpointDetail::Error {
                recovery_cursor, ..
            } => assert_eq!(recovery_cursor.as_deref(), Some("c2")),
            other => panic!("unexpected detail: {:?}", other),
        }
    }

    #[tokio::test]
    async fn periodic_checkpoints_follow_the_interval() {
        let source = FakeSource::three_pages();
        let sink = MemorySink::new();
        let checkpoints = MemoryCheckpoints::default();
        let signals = FlagSignals::quiet();
        let tuning = ExtractionTuning {
            checkpoint_interval: 1,
            ..ExtractionTuning::default()
        };

        run_extraction(ctx(), &tuning, None, &source, &sink, &checkpoints, &signals)
            .await
            .unwrap();

        // One progress checkpoint per page, then the completion marker.
        assert_eq!(
            checkpoints.phases(),
            vec![
                Phase::MainData,
                Phase::MainData,
                Phase::MainData,
                Phase::MainDataCompleted
            ]
        );
        let first = checkpoints.saved.lock().unwrap()[0].clone();
        assert_eq!(first.records_processed, 10);
        assert_eq!(first.page_number, 1);
        assert_eq!(first.cursor.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn safety_limit_stops_runaway_pagination() {
        let source = EndlessSource;
        let sink = MemorySink::new();
        let checkpoints = MemoryCheckpoints::default();
        let signals = FlagSignals::quiet();
        let tuning = ExtractionTuning {
            page_safety_limit: 3,
            ..ExtractionTuning::default()
        };

        let outcome = run_extraction(ctx(), &tuning, None, &source, &sink, &checkpoints, &signals)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LoopOutcome::Completed {
                records_processed: 6,
                pages: 3
            }
        );
        // The trailing marker keeps the cursor so the tail is reachable.
        let last = checkpoints.last();
        assert_eq!(last.phase, Phase::MainData);
        assert!(last.cursor.is_some());
    }
}
