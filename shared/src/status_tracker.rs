use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::model::{ChapterKey, ChapterStatus, MangaId, OcrLanguage};
use crate::ocr_client::{self, ChapterOcrApi};

/// How long a freshly started chapter keeps being polled even though the
/// server still reports it as idle. Covers the lag between enqueueing a job
/// and the server picking it up.
const OPTIMISTIC_WINDOW: Duration = Duration::from_secs(10);
/// Delay between two status polls of the same chapter.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Re-check delay when a poll tick finds another request already in flight.
const IN_FLIGHT_RECHECK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an error occurred while talking to the OCR server")]
    NetworkError(#[source] anyhow::Error),
}

impl From<ocr_client::Error> for Error {
    fn from(value: ocr_client::Error) -> Self {
        match value {
            ocr_client::Error::NetworkError(e) => Self::NetworkError(e),
        }
    }
}

enum PollStep {
    Busy,
    Continue,
    Stop,
}

struct PollTask {
    epoch: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    language: OcrLanguage,
    /// Bumped on every full invalidation; a status response that started
    /// before the bump must not land in the map afterwards.
    generation: u64,
    poll_epoch: u64,
    statuses: HashMap<ChapterKey, ChapterStatus>,
    poll_tasks: HashMap<ChapterKey, PollTask>,
    in_flight: HashSet<ChapterKey>,
    optimistic_deadlines: HashMap<ChapterKey, Instant>,
}

/// Tracks the last known OCR status of every chapter the session has touched,
/// and keeps chapters with a running job under observation with one poll task
/// per chapter. Clones share the same state.
#[derive(Clone)]
pub struct OcrStatusTracker {
    api: Arc<dyn ChapterOcrApi>,
    inner: Arc<Mutex<Inner>>,
}

impl OcrStatusTracker {
    pub fn new(api: Arc<dyn ChapterOcrApi>, language: OcrLanguage) -> Self {
        Self {
            api,
            inner: Arc::new(Mutex::new(Inner {
                language,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("lock poisoned")
    }

    pub fn language(&self) -> OcrLanguage {
        self.lock().language
    }

    pub fn status(&self, key: &ChapterKey) -> Option<ChapterStatus> {
        self.lock().statuses.get(key).copied()
    }

    pub fn snapshot(&self) -> HashMap<ChapterKey, ChapterStatus> {
        self.lock().statuses.clone()
    }

    pub fn is_polling(&self, key: &ChapterKey) -> bool {
        self.lock()
            .poll_tasks
            .get(key)
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Fetches the chapter's status and overwrites its map entry. A failed
    /// call leaves the entry untouched (stale but present); retrying is the
    /// caller's job, the poll loop gets its retries from rescheduling.
    pub async fn refresh(&self, key: &ChapterKey) -> Result<ChapterStatus, Error> {
        let (language, generation) = {
            let inner = self.lock();
            (inner.language, inner.generation)
        };

        let status = self.api.chapter_status(key, language).await?;

        let mut inner = self.lock();
        if inner.generation == generation {
            inner.statuses.insert(key.clone(), status);
        }

        Ok(status)
    }

    /// Primes the map for a whole chapter listing in one round-trip.
    pub async fn refresh_all(
        &self,
        keys: &[ChapterKey],
    ) -> Result<HashMap<ChapterKey, ChapterStatus>, Error> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let (language, generation) = {
            let inner = self.lock();
            (inner.language, inner.generation)
        };

        let statuses = self.api.chapter_status_batch(keys, language).await?;

        let mut inner = self.lock();
        if inner.generation == generation {
            for (key, status) in &statuses {
                inner.statuses.insert(key.clone(), *status);
            }
        }

        Ok(statuses)
    }

    /// Starts OCR processing for a chapter. Safe to call while a job is
    /// already running; the existing job is observed instead of re-enqueued.
    ///
    /// The map entry switches to `processing` right away so callers get
    /// immediate feedback, and is reconciled (or rolled back) once the server
    /// answers.
    pub async fn start_ocr(&self, key: &ChapterKey) -> Result<(), Error> {
        let (language, generation, previous) = {
            let mut inner = self.lock();
            let previous = inner.statuses.get(key).copied();

            inner
                .optimistic_deadlines
                .insert(key.clone(), Instant::now() + OPTIMISTIC_WINDOW);

            let total = match previous {
                Some(ChapterStatus::Idle { total, .. })
                | Some(ChapterStatus::Processing { total, .. }) => total,
                _ => 0,
            };
            inner
                .statuses
                .insert(key.clone(), ChapterStatus::Processing { progress: 0, total });

            // Claim the in-flight slot before the poll task can run, so its
            // first tick coalesces with the check below instead of racing it.
            inner.in_flight.insert(key.clone());

            (inner.language, inner.generation, previous)
        };

        self.spawn_poll_task(key);

        // The job may already be running, or even done, by the time we ask.
        let checked = self.api.chapter_status(key, language).await;

        {
            let mut inner = self.lock();
            if inner.generation == generation {
                inner.in_flight.remove(key);
            }
        }

        let checked = match checked {
            Ok(status) => status,
            Err(e) => {
                self.roll_back_start(key, previous, generation);
                return Err(e.into());
            }
        };

        match checked {
            ChapterStatus::Processed => {
                // Finished before we even asked; nothing left to observe.
                let mut inner = self.lock();
                if inner.generation == generation {
                    Self::stop_polling(&mut inner, key);
                    inner.statuses.insert(key.clone(), ChapterStatus::Processed);
                }

                Ok(())
            }
            ChapterStatus::Processing { .. } => {
                // A job is already running; the poll loop will observe it.
                debug!("chapter {key} is already being processed, not enqueueing");

                Ok(())
            }
            ChapterStatus::Idle { .. } => {
                match self.api.enqueue_chapter(key, language).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.roll_back_start(key, Some(checked), generation);
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Stops tracking the chapter and asks the server to drop its OCR job
    /// bookkeeping, optionally purging the cached OCR data as well. The map
    /// entry is only reset once the server confirms.
    pub async fn delete_ocr(
        &self,
        key: &ChapterKey,
        delete_cached_data: bool,
    ) -> Result<(), Error> {
        let (language, generation) = {
            let mut inner = self.lock();
            Self::stop_polling(&mut inner, key);
            (inner.language, inner.generation)
        };

        self.api
            .delete_chapter(key, delete_cached_data, language)
            .await?;

        let mut inner = self.lock();
        if inner.generation == generation {
            inner
                .statuses
                .insert(key.clone(), ChapterStatus::Idle { cached: 0, total: 0 });
        }

        Ok(())
    }

    /// Switches the active OCR language. Every snapshot was taken for the old
    /// language, so the whole map and all poll bookkeeping are dropped.
    pub fn set_language(&self, language: OcrLanguage) {
        let mut inner = self.lock();
        inner.language = language;
        Self::invalidate_all_locked(&mut inner);
    }

    /// Drops every snapshot and stops all polling. Used when the server-side
    /// cache was purged out from under us.
    pub fn invalidate_all(&self) {
        Self::invalidate_all_locked(&mut self.lock());
    }

    /// Drops the snapshots of every chapter belonging to `manga_id`. Called
    /// when leaving a reader view, where OCR may have been triggered ad hoc
    /// and the listing's snapshots can no longer be trusted.
    pub fn invalidate_manga(&self, manga_id: &MangaId) {
        let mut inner = self.lock();

        let keys: Vec<ChapterKey> = inner
            .statuses
            .keys()
            .chain(inner.poll_tasks.keys())
            .filter(|key| key.manga_id() == manga_id)
            .cloned()
            .collect();

        for key in keys {
            Self::stop_polling(&mut inner, &key);
            inner.statuses.remove(&key);
        }
    }

    fn invalidate_all_locked(inner: &mut Inner) {
        inner.generation += 1;
        for (_, task) in inner.poll_tasks.drain() {
            task.handle.abort();
        }
        inner.in_flight.clear();
        inner.optimistic_deadlines.clear();
        inner.statuses.clear();
    }

    /// Stopping always clears the timer handle, the in-flight marker and the
    /// optimistic deadline together, so nothing leaks across transitions.
    fn stop_polling(inner: &mut Inner, key: &ChapterKey) {
        if let Some(task) = inner.poll_tasks.remove(key) {
            task.handle.abort();
        }
        inner.in_flight.remove(key);
        inner.optimistic_deadlines.remove(key);
    }

    fn roll_back_start(
        &self,
        key: &ChapterKey,
        snapshot: Option<ChapterStatus>,
        generation: u64,
    ) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        Self::stop_polling(&mut inner, key);

        // The optimistic `processing` entry must not outlive a failed start.
        match snapshot {
            Some(snapshot) => inner.statuses.insert(key.clone(), snapshot),
            None => inner.statuses.remove(key),
        };
    }

    fn spawn_poll_task(&self, key: &ChapterKey) {
        let mut inner = self.lock();

        inner.poll_epoch += 1;
        let epoch = inner.poll_epoch;

        // Replacing the stored handle keeps the one-timer-per-chapter
        // invariant; a stale task never outlives its registry entry.
        if let Some(task) = inner.poll_tasks.remove(key) {
            task.handle.abort();
        }

        let tracker = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move { tracker.poll_loop(task_key, epoch).await });

        inner.poll_tasks.insert(key.clone(), PollTask { epoch, handle });
    }

    async fn poll_loop(self, key: ChapterKey, epoch: u64) {
        loop {
            match self.poll_step(&key, epoch).await {
                PollStep::Busy => tokio::time::sleep(IN_FLIGHT_RECHECK_INTERVAL).await,
                PollStep::Continue => tokio::time::sleep(POLL_INTERVAL).await,
                PollStep::Stop => break,
            }
        }
    }

    async fn poll_step(&self, key: &ChapterKey, epoch: u64) -> PollStep {
        {
            let mut inner = self.lock();
            if inner.in_flight.contains(key) {
                // Another status request for this chapter is running;
                // coalesce instead of issuing a duplicate.
                return PollStep::Busy;
            }
            inner.in_flight.insert(key.clone());
        }

        let result = self.refresh(key).await;

        let mut inner = self.lock();
        inner.in_flight.remove(key);

        let step = match result {
            Ok(ChapterStatus::Processed) => PollStep::Stop,
            Ok(ChapterStatus::Processing { .. }) => PollStep::Continue,
            Ok(ChapterStatus::Idle { .. }) => {
                // Keep polling an idle chapter only while it is inside its
                // post-start optimistic window.
                let within_window = inner
                    .optimistic_deadlines
                    .get(key)
                    .is_some_and(|deadline| Instant::now() < *deadline);

                if within_window {
                    PollStep::Continue
                } else {
                    PollStep::Stop
                }
            }
            Err(e) => {
                // The map was left untouched; the next tick is the retry.
                warn!("failed to poll OCR status for {key}: {e:?}");
                PollStep::Continue
            }
        };

        if let PollStep::Stop = step {
            inner.optimistic_deadlines.remove(key);

            let owned = inner
                .poll_tasks
                .get(key)
                .is_some_and(|task| task.epoch == epoch);
            if owned {
                inner.poll_tasks.remove(key);
            }
        }

        step
    }
}
