use super::{
    DecodeGate, RenderJob, Thumbnail, ThumbnailCache, ThumbnailError, ThumbnailRenderer,
    ThumbnailSize,
};
use crate::config::ThumbnailConfig;
use crate::media::MediaType;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

pub type ThumbnailOutcome = Result<Arc<Thumbnail>, ThumbnailError>;

type Waker = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub enum RequestStatus {
    Cached(Arc<Thumbnail>),
    /// Already being decoded; no second task was started.
    Pending,
    Dispatched,
}

#[derive(Debug)]
pub enum Subscription {
    Ready(Arc<Thumbnail>),
    Waiting(oneshot::Receiver<ThumbnailOutcome>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Ready { key: String },
    Failed { key: String, error: ThumbnailError },
}

struct InFlightRequest {
    generation: u64,
    waiters: Vec<oneshot::Sender<ThumbnailOutcome>>,
}

struct Completion {
    key: String,
    generation: u64,
    result: Result<Thumbnail, ThumbnailError>,
}

/// Owns the decode pool, the video gate, the cache and the in-flight map.
/// Whoever holds `&mut` is the single writer; workers only ever talk back
/// through the completion channel.
pub struct ThumbnailPipeline {
    renderer: Arc<dyn ThumbnailRenderer>,
    pool: ThreadPool,
    gate: Arc<DecodeGate>,
    cache: ThumbnailCache,
    in_flight: HashMap<String, InFlightRequest>,
    generation: u64,
    size: ThumbnailSize,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    waker: Option<Waker>,
}

impl ThumbnailPipeline {
    pub fn new(
        renderer: Arc<dyn ThumbnailRenderer>,
        config: &ThumbnailConfig,
    ) -> Result<Self, String> {
        let config = config.clone().sanitized();
        let threads = config.resolved_worker_threads();
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("thumb-decode-{i}"))
            .build()
            .map_err(|e| format!("Failed to build decode pool: {e}"))?;
        let (tx, rx) = mpsc::channel();
        debug!(
            threads,
            video_gate = config.video_gate,
            cache_bytes = config.cache_capacity_bytes(),
            "thumbnail pipeline ready"
        );
        Ok(Self {
            renderer,
            pool,
            gate: Arc::new(DecodeGate::new(config.video_gate)),
            cache: ThumbnailCache::new(config.cache_capacity_bytes()),
            in_flight: HashMap::new(),
            generation: 0,
            size: config.thumbnail_size(),
            tx,
            rx,
            waker: None,
        })
    }

    /// Called from a worker thread after each completion is queued, so a host
    /// loop knows to call [`Self::process_completions`].
    pub fn set_waker(&mut self, waker: impl Fn() + Send + Sync + 'static) {
        self.waker = Some(Arc::new(waker));
    }

    pub fn size(&self) -> ThumbnailSize {
        self.size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn gate(&self) -> &Arc<DecodeGate> {
        &self.gate
    }

    pub fn cache(&self) -> &ThumbnailCache {
        &self.cache
    }

    /// Cache lookup that counts as a use.
    pub fn cached(&mut self, key: &str) -> Option<Arc<Thumbnail>> {
        self.cache.get(key)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn request(&mut self, key: &str, media_type: MediaType) -> RequestStatus {
        if let Some(thumb) = self.cache.get(key) {
            return RequestStatus::Cached(thumb);
        }
        if self.in_flight.contains_key(key) {
            trace!(key, "thumbnail already in flight");
            return RequestStatus::Pending;
        }
        self.in_flight.insert(
            key.to_string(),
            InFlightRequest {
                generation: self.generation,
                waiters: Vec::new(),
            },
        );
        self.dispatch(key, media_type);
        RequestStatus::Dispatched
    }

    /// Like [`Self::request`], but the caller gets the outcome through a
    /// one-shot channel. Every subscriber of a key sees the same result.
    pub fn subscribe(&mut self, key: &str, media_type: MediaType) -> Subscription {
        if let Some(thumb) = self.cache.get(key) {
            return Subscription::Ready(thumb);
        }
        let (tx, rx) = oneshot::channel();
        if let Some(request) = self.in_flight.get_mut(key) {
            trace!(key, waiters = request.waiters.len() + 1, "joined in-flight thumbnail");
            request.waiters.push(tx);
            return Subscription::Waiting(rx);
        }
        self.in_flight.insert(
            key.to_string(),
            InFlightRequest {
                generation: self.generation,
                waiters: vec![tx],
            },
        );
        self.dispatch(key, media_type);
        Subscription::Waiting(rx)
    }

    fn dispatch(&self, key: &str, media_type: MediaType) {
        let job = RenderJob {
            path: key.to_string(),
            media_type,
            size: self.size,
        };
        let renderer = Arc::clone(&self.renderer);
        let gate = Arc::clone(&self.gate);
        let tx = self.tx.clone();
        let waker = self.waker.clone();
        let generation = self.generation;
        debug!(key, media = media_type.as_str(), generation, "dispatching thumbnail decode");

        self.pool.spawn_fifo(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let _permit = (job.media_type == MediaType::Video).then(|| gate.acquire());
                renderer.render(&job)
            }))
            .unwrap_or_else(|_| {
                warn!(path = %job.path, "thumbnail decoder panicked");
                Err(ThumbnailError::corrupt("Decoder panicked"))
            });
            let sent = tx.send(Completion {
                key: job.path,
                generation,
                result,
            });
            if sent.is_ok() {
                if let Some(waker) = waker {
                    waker();
                }
            }
        });
    }

    /// Applies every queued completion without blocking.
    pub fn process_completions(&mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            if let Some(event) = self.apply(completion) {
                events.push(event);
            }
        }
        events
    }

    /// Blocks up to `timeout` for one completion, then drains the rest.
    pub fn wait_for_completions(&mut self, timeout: Duration) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => {
                if let Some(event) = self.apply(completion) {
                    events.push(event);
                }
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return events;
            }
        }
        events.extend(self.process_completions());
        events
    }

    fn apply(&mut self, completion: Completion) -> Option<PipelineEvent> {
        let Completion {
            key,
            generation,
            result,
        } = completion;
        if generation != self.generation {
            debug!(key = %key, generation, current = self.generation, "discarding stale thumbnail");
            return None;
        }
        let waiters = match self.in_flight.remove(&key) {
            Some(request) if request.generation == generation => request.waiters,
            Some(_) | None => Vec::new(),
        };

        match result {
            Ok(thumbnail) => {
                let thumbnail = Arc::new(thumbnail);
                if !self.cache.insert(&key, Arc::clone(&thumbnail)) {
                    debug!(key = %key, cost = thumbnail.cost(), "thumbnail not cached");
                }
                for tx in waiters {
                    let _ = tx.send(Ok(Arc::clone(&thumbnail)));
                }
                debug!(
                    key = %key,
                    width = thumbnail.width(),
                    height = thumbnail.height(),
                    cache_bytes = self.cache.total_cost(),
                    "thumbnail ready"
                );
                Some(PipelineEvent::Ready { key })
            }
            Err(error) => {
                debug!(key = %key, error = %error, "thumbnail failed");
                for tx in waiters {
                    let _ = tx.send(Err(error.clone()));
                }
                Some(PipelineEvent::Failed { key, error })
            }
        }
    }

    /// Invalidates everything in flight and empties the cache. Results of
    /// earlier dispatches are dropped when they arrive; their waiters see a
    /// closed channel.
    pub fn reset(&mut self) {
        self.generation += 1;
        let dropped = self.in_flight.len();
        self.in_flight.clear();
        self.cache.clear();
        debug!(generation = self.generation, dropped, "thumbnail pipeline reset");
    }
}

impl std::fmt::Debug for ThumbnailPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailPipeline")
            .field("generation", &self.generation)
            .field("in_flight", &self.in_flight.len())
            .field("cache", &self.cache)
            .field("gate", &self.gate)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineEvent, RequestStatus, Subscription, ThumbnailPipeline};
    use crate::config::ThumbnailConfig;
    use crate::media::MediaType;
    use crate::testing::ScriptedRenderer;
    use crate::thumbnails::ThumbnailErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(workers: usize, gate: usize) -> ThumbnailConfig {
        ThumbnailConfig {
            worker_threads: Some(workers),
            video_gate: gate,
            ..ThumbnailConfig::default()
        }
    }

    fn drain_until_idle(pipeline: &mut ThumbnailPipeline) -> Vec<PipelineEvent> {
        let deadline = Instant::now() + WAIT;
        let mut events = Vec::new();
        while pipeline.in_flight_len() > 0 && Instant::now() < deadline {
            events.extend(pipeline.wait_for_completions(Duration::from_millis(200)));
        }
        events
    }

    #[test]
    fn concurrent_requests_share_one_decode() {
        let renderer = Arc::new(ScriptedRenderer::new().with_delay(Duration::from_millis(50)));
        let mut pipeline = ThumbnailPipeline::new(renderer.clone(), &config(4, 4)).expect("pipeline");

        let mut receivers = Vec::new();
        for _ in 0..5 {
            match pipeline.subscribe("/DCIM/IMG_0001.JPG", MediaType::Image) {
                Subscription::Waiting(rx) => receivers.push(rx),
                Subscription::Ready(_) => panic!("nothing cached yet"),
            }
        }
        assert!(matches!(
            pipeline.request("/DCIM/IMG_0001.JPG", MediaType::Image),
            RequestStatus::Pending
        ));

        let events = drain_until_idle(&mut pipeline);
        assert_eq!(
            events,
            vec![PipelineEvent::Ready {
                key: "/DCIM/IMG_0001.JPG".into()
            }]
        );
        assert_eq!(renderer.calls(), 1);

        let first = receivers.remove(0).try_recv().expect("resolved").expect("ok");
        for mut rx in receivers {
            let thumb = rx.try_recv().expect("resolved").expect("ok");
            assert!(Arc::ptr_eq(&first, &thumb));
        }
        assert!(matches!(
            pipeline.request("/DCIM/IMG_0001.JPG", MediaType::Image),
            RequestStatus::Cached(_)
        ));
        assert_eq!(renderer.calls(), 1);
    }

    #[test]
    fn failures_are_not_memoized() {
        let renderer = Arc::new(ScriptedRenderer::new().failing_first(1));
        let mut pipeline = ThumbnailPipeline::new(renderer.clone(), &config(2, 4)).expect("pipeline");

        let mut rx = match pipeline.subscribe("/DCIM/bad.JPG", MediaType::Image) {
            Subscription::Waiting(rx) => rx,
            Subscription::Ready(_) => panic!("nothing cached yet"),
        };
        let events = drain_until_idle(&mut pipeline);
        assert!(matches!(events.as_slice(), [PipelineEvent::Failed { .. }]));
        let err = rx.try_recv().expect("resolved").expect_err("failed");
        assert_eq!(err.code(), ThumbnailErrorCode::CorruptData);
        assert!(pipeline.cache().is_empty());

        assert!(matches!(
            pipeline.request("/DCIM/bad.JPG", MediaType::Image),
            RequestStatus::Dispatched
        ));
        let events = drain_until_idle(&mut pipeline);
        assert!(matches!(events.as_slice(), [PipelineEvent::Ready { .. }]));
        assert_eq!(renderer.calls(), 2);
    }

    #[test]
    fn stale_results_are_discarded_after_reset() {
        let renderer = Arc::new(ScriptedRenderer::new().with_delay(Duration::from_millis(80)));
        let mut pipeline = ThumbnailPipeline::new(renderer.clone(), &config(2, 4)).expect("pipeline");

        let mut rx = match pipeline.subscribe("/old/IMG_0001.JPG", MediaType::Image) {
            Subscription::Waiting(rx) => rx,
            Subscription::Ready(_) => panic!("nothing cached yet"),
        };
        pipeline.reset();
        assert_eq!(pipeline.in_flight_len(), 0);

        // The old task still finishes; its completion must change nothing.
        let events = pipeline.wait_for_completions(WAIT);
        assert!(events.is_empty());
        assert_eq!(renderer.calls(), 1);
        assert!(pipeline.cache().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn panicking_renderer_reports_corrupt_data() {
        let renderer = Arc::new(ScriptedRenderer::new().panicking());
        let mut pipeline = ThumbnailPipeline::new(renderer, &config(2, 1)).expect("pipeline");

        pipeline.request("/DCIM/IMG_0002.MOV", MediaType::Video);
        let events = drain_until_idle(&mut pipeline);
        match events.as_slice() {
            [PipelineEvent::Failed { error, .. }] => {
                assert_eq!(error.code(), ThumbnailErrorCode::CorruptData)
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(pipeline.gate().active(), 0);
    }

    #[test]
    fn video_decodes_respect_gate() {
        let renderer = Arc::new(ScriptedRenderer::new().with_delay(Duration::from_millis(30)));
        let mut pipeline = ThumbnailPipeline::new(renderer.clone(), &config(10, 4)).expect("pipeline");

        for i in 0..10 {
            pipeline.request(&format!("/DCIM/IMG_{i:04}.MOV"), MediaType::Video);
        }
        let events = drain_until_idle(&mut pipeline);
        assert_eq!(events.len(), 10);
        assert_eq!(renderer.calls(), 10);
        assert!(renderer.max_active() <= 4);
        assert_eq!(pipeline.gate().active(), 0);
    }

    #[test]
    fn cache_stays_within_capacity() {
        // Scripted thumbnails are 120x120 RGBA = 57600 bytes; 16 MiB holds 291.
        let renderer = Arc::new(ScriptedRenderer::new());
        let cfg = ThumbnailConfig {
            cache_capacity_mb: 16,
            ..config(4, 4)
        };
        let mut pipeline = ThumbnailPipeline::new(renderer, &cfg).expect("pipeline");

        for i in 0..320 {
            pipeline.request(&format!("/DCIM/IMG_{i:04}.JPG"), MediaType::Image);
        }
        drain_until_idle(&mut pipeline);
        assert!(pipeline.cache().total_cost() <= pipeline.cache().capacity());
        assert_eq!(pipeline.cache().len(), 291);
    }

    #[test]
    fn out_of_range_config_is_sanitized() {
        let renderer = Arc::new(ScriptedRenderer::new());
        let cfg = ThumbnailConfig {
            cache_capacity_mb: 0,
            video_gate: 0,
            thumbnail_width: 0,
            ..config(2, 4)
        };
        let mut pipeline = ThumbnailPipeline::new(renderer.clone(), &cfg).expect("pipeline");
        assert!(pipeline.cache().capacity() > 0);
        assert_eq!(pipeline.gate().capacity(), 1);
        assert_eq!(pipeline.size().width, 16);

        pipeline.request("/a.JPG", MediaType::Image);
        drain_until_idle(&mut pipeline);
        assert!(matches!(
            pipeline.request("/a.JPG", MediaType::Image),
            RequestStatus::Cached(_)
        ));
        assert_eq!(renderer.calls(), 1);
    }

    #[test]
    fn waker_fires_per_completion() {
        let renderer = Arc::new(ScriptedRenderer::new());
        let mut pipeline = ThumbnailPipeline::new(renderer, &config(2, 4)).expect("pipeline");
        let woken = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&woken);
        pipeline.set_waker(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        pipeline.request("/a.JPG", MediaType::Image);
        pipeline.request("/b.JPG", MediaType::Image);
        drain_until_idle(&mut pipeline);
        // The waker runs just after the send, so give the last one a moment.
        let deadline = Instant::now() + WAIT;
        while woken.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(woken.load(Ordering::SeqCst), 2);
    }
}
