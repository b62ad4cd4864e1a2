//! Bounded-concurrency batch runner.
//!
//! A fixed pool of scoped OS threads pulls item indices from a shared
//! counter, so no item starts twice and at most `concurrency_limit` items
//! are in flight. Each worker runs an item's three stages back to back and
//! sends the outcome over a channel; the calling thread slots outcomes by
//! index, which keeps the result in submission order no matter which item
//! finishes first.
//!
//! Placement is ordered too. Before dispatch, every item is linked to the
//! previous item in the batch with the same
//! [placement key](ItemPipeline::placement_key), and its place stage waits
//! until that item is done. Items that cannot collide never wait on each
//! other, and colliding items get their paths in submission order.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, mpsc};
use std::thread;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::pipeline::{ItemContext, ItemPipeline, ItemState, PipelineOutcome, PipelineStage};
use crate::track::TrackDescriptor;

/// Skip reason for items never started because the run was cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

/// A state change for one item of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemProgress {
    /// Position in the submitted batch.
    pub index: usize,
    /// Item id.
    pub item_id: String,
    /// New state.
    pub state: ItemState,
}

enum WorkerMessage {
    Progress(ItemProgress),
    Done(usize, PipelineOutcome),
}

/// Place-stage ordering among items of one batch, by work position.
struct PlacementOrder {
    /// Earlier position with the same placement key.
    previous: Vec<Option<usize>>,
    finished: Mutex<Vec<bool>>,
    changed: Condvar,
}

impl PlacementOrder {
    fn new(keys: impl IntoIterator<Item = String>) -> Self {
        let mut last = HashMap::new();
        let previous: Vec<Option<usize>> = keys
            .into_iter()
            .enumerate()
            .map(|(position, key)| last.insert(key, position))
            .collect();
        let finished = Mutex::new(vec![false; previous.len()]);
        Self {
            previous,
            finished,
            changed: Condvar::new(),
        }
    }

    /// Block until the previous item sharing `position`'s key is finished.
    ///
    /// That item was taken from the queue earlier, so it is running or done.
    fn wait_turn(&self, position: usize) {
        let Some(previous) = self.previous.get(position).copied().flatten() else {
            return;
        };
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        if !finished[previous] {
            debug!("Position {} waits for {} before placing", position, previous);
        }
        while !finished[previous] {
            finished = self
                .changed
                .wait(finished)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish(&self, position: usize) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(done) = finished.get_mut(position) {
            *done = true;
        }
        drop(finished);
        self.changed.notify_all();
    }
}

/// Runs the item pipeline over batches with a bounded worker pool.
#[derive(Debug)]
pub struct DownloadOrchestrator {
    pipeline: ItemPipeline,
    cancelled: Arc<AtomicBool>,
}

impl DownloadOrchestrator {
    /// Create an orchestrator with its own cancellation flag.
    #[must_use]
    pub fn new(pipeline: ItemPipeline) -> Self {
        Self::with_cancellation(pipeline, Arc::new(AtomicBool::new(false)))
    }

    /// Create an orchestrator sharing an external cancellation flag.
    #[must_use]
    pub const fn with_cancellation(pipeline: ItemPipeline, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            pipeline,
            cancelled,
        }
    }

    /// Stop handing out new items. In-flight items run to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Flag that can be shared across threads.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Pipeline used for each item.
    #[must_use]
    pub const fn pipeline(&self) -> &ItemPipeline {
        &self.pipeline
    }

    /// Run `descriptors` with at most `concurrency_limit` in flight.
    ///
    /// Returns one outcome per descriptor, in input order.
    pub fn run_batch(
        &self,
        descriptors: &[TrackDescriptor],
        concurrency_limit: usize,
    ) -> Vec<PipelineOutcome> {
        self.run_batch_with(
            descriptors,
            concurrency_limit,
            &ItemContext::default(),
            None::<fn(&ItemProgress)>,
        )
    }

    /// [`run_batch`](Self::run_batch) with a batch context and an optional
    /// observer. The observer is called on the calling thread.
    ///
    /// A descriptor whose item id already appeared earlier in the batch is
    /// skipped. Items not started when cancellation is requested are
    /// skipped with [`CANCELLED_REASON`].
    pub fn run_batch_with<F>(
        &self,
        descriptors: &[TrackDescriptor],
        concurrency_limit: usize,
        context: &ItemContext,
        mut observer: Option<F>,
    ) -> Vec<PipelineOutcome>
    where
        F: FnMut(&ItemProgress),
    {
        let mut slots: Vec<Option<PipelineOutcome>> =
            std::iter::repeat_with(|| None).take(descriptors.len()).collect();

        let mut seen = HashSet::new();
        let mut work = Vec::with_capacity(descriptors.len());
        for (index, descriptor) in descriptors.iter().enumerate() {
            if seen.insert(descriptor.item_id.as_str()) {
                work.push(index);
            } else {
                debug!("Skipping duplicate {} at {}", descriptor.item_id, index);
                slots[index] = Some(PipelineOutcome::Skipped(format!(
                    "duplicate of an earlier {} in this batch",
                    descriptor.item_id
                )));
            }
        }

        if !work.is_empty() {
            let workers = concurrency_limit.clamp(1, work.len());
            info!(
                "Running {} items with {} worker(s)",
                work.len(),
                workers
            );
            self.drain(descriptors, &work, workers, context, &mut slots, &mut observer);
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| PipelineOutcome::Skipped(CANCELLED_REASON.to_string())))
            .collect()
    }

    fn drain<F>(
        &self,
        descriptors: &[TrackDescriptor],
        work: &[usize],
        workers: usize,
        context: &ItemContext,
        slots: &mut [Option<PipelineOutcome>],
        observer: &mut Option<F>,
    ) where
        F: FnMut(&ItemProgress),
    {
        let next = AtomicUsize::new(0);
        let order = PlacementOrder::new(
            work.iter()
                .map(|&index| self.pipeline.placement_key(&descriptors[index], context)),
        );
        let (tx, rx) = mpsc::channel::<WorkerMessage>();

        thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let pipeline = &self.pipeline;
                let cancelled = &self.cancelled;
                let order = &order;

                scope.spawn(move || {
                    loop {
                        if cancelled.load(Ordering::SeqCst) {
                            debug!("Worker {} stopping: cancelled", worker);
                            break;
                        }
                        let position = next.fetch_add(1, Ordering::SeqCst);
                        let Some(&index) = work.get(position) else {
                            break;
                        };
                        let wait_turn = || order.wait_turn(position);
                        let outcome =
                            run_one(pipeline, &descriptors[index], index, context, &tx, &wait_turn);
                        order.finish(position);
                        if tx.send(WorkerMessage::Done(index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for message in rx {
                match message {
                    WorkerMessage::Progress(progress) => {
                        if let Some(observe) = observer.as_mut() {
                            observe(&progress);
                        }
                    }
                    WorkerMessage::Done(index, outcome) => slots[index] = Some(outcome),
                }
            }
        });
    }
}

/// Run one item on a worker, forwarding state changes.
///
/// The pipeline already converts capability panics; this catches anything
/// that escapes it and attributes the failure to the last stage entered.
fn run_one(
    pipeline: &ItemPipeline,
    descriptor: &TrackDescriptor,
    index: usize,
    context: &ItemContext,
    tx: &mpsc::Sender<WorkerMessage>,
    before_place: &dyn Fn(),
) -> PipelineOutcome {
    let last_stage = Cell::new(PipelineStage::Fetch);
    let observe = |state: ItemState| {
        match state {
            ItemState::Tagging => last_stage.set(PipelineStage::Tag),
            ItemState::Placing => last_stage.set(PipelineStage::Place),
            _ => {}
        }
        let _ = tx.send(WorkerMessage::Progress(ItemProgress {
            index,
            item_id: descriptor.item_id.clone(),
            state,
        }));
    };

    panic::catch_unwind(AssertUnwindSafe(|| {
        pipeline.run_gated(descriptor, context, &observe, before_place)
    }))
    .unwrap_or_else(|_| {
        warn!("Worker panicked on {}", descriptor.item_id);
        PipelineOutcome::Failed {
            stage: last_stage.get(),
            error: Error::Panicked(format!("worker panicked on {}", descriptor.item_id)),
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{AudioFormat, OrganizeBy};
    use crate::error::{DownloadError, Result};
    use crate::fs::mock::MemoryFileSystem;
    use crate::pipeline::PipelineSettings;
    use crate::provider::{CoverArt, FetchedFile, Fetcher, Tagger};
    use crate::track::TrackTags;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fetcher that tracks concurrency and fails chosen ids.
    #[derive(Default)]
    struct CountingFetcher {
        fs: MemoryFileSystem,
        failing: HashSet<String>,
        slow: HashSet<String>,
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    impl Fetcher for CountingFetcher {
        fn fetch(
            &self,
            item_id: &str,
            staging_dir: &Path,
            _: AudioFormat,
            _: AudioFormat,
        ) -> Result<FetchedFile> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().expect("lock").push(item_id.to_string());
            thread::sleep(self.delay);
            if self.slow.contains(item_id) {
                thread::sleep(Duration::from_millis(100));
            }
            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(item_id) {
                return Err(DownloadError::FetchFailed {
                    item_id: item_id.to_string(),
                    reason: "connection reset".to_string(),
                }
                .into());
            }
            let path = staging_dir.join(format!("{item_id}.mp3"));
            self.fs.add_file(&path, item_id.as_bytes());
            Ok(FetchedFile::new(path))
        }
    }

    struct NoopTagger;

    impl Tagger for NoopTagger {
        fn apply_metadata(&self, _: &Path, _: &TrackTags, _: Option<CoverArt>) -> Result<()> {
            Ok(())
        }
    }

    fn orchestrator(fetcher: Arc<CountingFetcher>, fs: &MemoryFileSystem) -> DownloadOrchestrator {
        let settings = PipelineSettings {
            download_dir: PathBuf::from("/lib"),
            staging_root: PathBuf::from("/lib/.tmp"),
            organize_by: OrganizeBy::GenreArtist,
            preferred_format: AudioFormat::Best,
            fallback_format: AudioFormat::Mp3,
            max_filename_length: 120,
            max_segment_length: 80,
            default_genre: "Unknown".to_string(),
        };
        DownloadOrchestrator::new(ItemPipeline::new(
            fetcher,
            Arc::new(NoopTagger),
            Arc::new(fs.clone()),
            settings,
        ))
    }

    fn batch(ids: &[&str]) -> Vec<TrackDescriptor> {
        ids.iter()
            .map(|id| TrackDescriptor::new(*id, format!("Song {id}"), "Artist", "PL").expect("valid"))
            .collect()
    }

    #[test]
    fn test_empty_batch() {
        let fs = MemoryFileSystem::new();
        let fetcher = Arc::new(CountingFetcher {
            fs: fs.clone(),
            ..Default::default()
        });
        assert!(orchestrator(fetcher, &fs).run_batch(&[], 4).is_empty());
    }

    #[test]
    fn test_outcomes_follow_input_order() {
        let fs = MemoryFileSystem::new();
        let fetcher = Arc::new(CountingFetcher {
            fs: fs.clone(),
            failing: ["b".to_string()].into_iter().collect(),
            delay: Duration::from_millis(5),
            ..Default::default()
        });
        let ids = ["a", "b", "c", "d", "e"];

        let outcomes = orchestrator(Arc::clone(&fetcher), &fs).run_batch(&batch(&ids), 3);

        assert_eq!(outcomes.len(), 5);
        for (id, outcome) in ids.iter().zip(&outcomes) {
            if *id == "b" {
                assert_eq!(outcome.failure().map(|(s, _)| s), Some(PipelineStage::Fetch));
            } else {
                let path = outcome.local_path().expect("placed");
                assert!(path.ends_with(format!("Artist - Song {id}.mp3")));
            }
        }
    }

    #[test]
    fn test_concurrency_limit_is_respected() {
        let fs = MemoryFileSystem::new();
        let fetcher = Arc::new(CountingFetcher {
            fs: fs.clone(),
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let ids: Vec<String> = (0..8).map(|i| format!("t{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let outcomes = orchestrator(Arc::clone(&fetcher), &fs).run_batch(&batch(&refs), 2);

        assert!(outcomes.iter().all(PipelineOutcome::is_success));
        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak {peak}");
        assert_eq!(fetcher.calls.lock().expect("lock").len(), 8);
    }

    #[test]
    fn test_limit_of_one_is_sequential() {
        let fs = MemoryFileSystem::new();
        let fetcher = Arc::new(CountingFetcher {
            fs: fs.clone(),
            delay: Duration::from_millis(2),
            ..Default::default()
        });

        let outcomes = orchestrator(Arc::clone(&fetcher), &fs).run_batch(&batch(&["x", "y", "z"]), 1);

        assert!(outcomes.iter().all(PipelineOutcome::is_success));
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*fetcher.calls.lock().expect("lock"), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_zero_limit_still_runs() {
        let fs = MemoryFileSystem::new();
        let fetcher = Arc::new(CountingFetcher {
            fs: fs.clone(),
            ..Default::default()
        });
        let outcomes = orchestrator(fetcher, &fs).run_batch(&batch(&["x"]), 0);
        assert!(outcomes[0].is_success());
    }

    #[test]
    fn test_duplicates_run_once() {
        let fs = MemoryFileSystem::new();
        let fetcher = Arc::new(CountingFetcher {
            fs: fs.clone(),
            ..Default::default()
        });

        let outcomes = orchestrator(Arc::clone(&fetcher), &fs).run_batch(&batch(&["a", "b", "a"]), 3);

        assert!(outcomes[0].is_success());
        assert!(outcomes[1].is_success());
        assert!(matches!(&outcomes[2], PipelineOutcome::Skipped(reason) if reason.contains("duplicate")));
        assert_eq!(fetcher.calls.lock().expect("lock").len(), 2);
    }

    fn place_colliding_pair(limit: usize, failing: &[&str]) -> Vec<PipelineOutcome> {
        let fs = MemoryFileSystem::new();
        let fetcher = Arc::new(CountingFetcher {
            fs: fs.clone(),
            failing: failing.iter().map(ToString::to_string).collect(),
            slow: ["q1".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let descriptors = vec![
            TrackDescriptor::new("q1", "What?", "Queen", "PL").expect("valid"),
            TrackDescriptor::new("q2", "What", "Queen", "PL").expect("valid"),
        ];
        orchestrator(fetcher, &fs).run_batch(&descriptors, limit)
    }

    fn placed(outcomes: &[PipelineOutcome]) -> Vec<Option<PathBuf>> {
        outcomes
            .iter()
            .map(|o| o.local_path().map(Path::to_path_buf))
            .collect()
    }

    #[test]
    fn test_colliding_names_follow_submission_order() {
        let sequential = placed(&place_colliding_pair(1, &[]));
        assert_eq!(
            sequential,
            vec![
                Some(PathBuf::from("/lib/Unknown/Queen/Queen - What.mp3")),
                Some(PathBuf::from("/lib/Unknown/Queen/Queen - What (1).mp3")),
            ]
        );
        assert_eq!(placed(&place_colliding_pair(2, &[])), sequential);
    }

    #[test]
    fn test_failed_earlier_collision_frees_the_name() {
        let outcomes = place_colliding_pair(2, &["q1"]);

        assert_eq!(outcomes[0].failure().map(|(s, _)| s), Some(PipelineStage::Fetch));
        assert_eq!(
            outcomes[1].local_path(),
            Some(Path::new("/lib/Unknown/Queen/Queen - What.mp3"))
        );
    }

    #[test]
    fn test_cancelled_before_start_skips_everything() {
        let fs = MemoryFileSystem::new();
        let fetcher = Arc::new(CountingFetcher {
            fs: fs.clone(),
            ..Default::default()
        });
        let orchestrator = orchestrator(Arc::clone(&fetcher), &fs);
        orchestrator.cancel();

        let outcomes = orchestrator.run_batch(&batch(&["a", "b"]), 2);

        assert!(outcomes
            .iter()
            .all(|o| matches!(o, PipelineOutcome::Skipped(r) if r == CANCELLED_REASON)));
        assert!(fetcher.calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn test_observer_sees_every_item_finish() {
        let fs = MemoryFileSystem::new();
        let fetcher = Arc::new(CountingFetcher {
            fs: fs.clone(),
            failing: ["b".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let mut terminal = Vec::new();

        orchestrator(fetcher, &fs).run_batch_with(
            &batch(&["a", "b", "c"]),
            2,
            &ItemContext::for_playlist("Mix"),
            Some(|p: &ItemProgress| {
                if p.state.is_terminal() {
                    terminal.push((p.index, p.state));
                }
            }),
        );

        terminal.sort_by_key(|(i, _)| *i);
        assert_eq!(
            terminal,
            vec![
                (0, ItemState::Placed),
                (1, ItemState::Failed(PipelineStage::Fetch)),
                (2, ItemState::Placed),
            ]
        );
    }
}
