//! A dedicated inference pool for async Rust callers.
//!
//! - xgboost prediction is blocking and CPU heavy; running it on Tokio
//!   workers causes head-of-line blocking, so N OS threads each own their
//!   own predictor instead.
//! - Submission is non-blocking (`try_submit`); when every queue is full we
//!   fail fast with [`PoolError::QueueFull`].
//! - An optional queue-wait budget turns stale jobs into
//!   [`PoolError::DeadlineExceeded`] without running them.

use anyhow::Context;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::predictor::{PredictKind, Prediction, Predictor};
use crate::util::{dur_us, now_us};

/// Builds the predictor owned by worker `wid`.
pub type PredictorFactory = Arc<dyn Fn(usize) -> anyhow::Result<Box<dyn Predictor>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    QueueFull,
    WorkerDown,
    Canceled,
    DeadlineExceeded,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::QueueFull => write!(f, "predict pool queue full"),
            PoolError::WorkerDown => write!(f, "predict pool worker down"),
            PoolError::Canceled => write!(f, "predict pool job canceled"),
            PoolError::DeadlineExceeded => write!(f, "predict pool deadline exceeded"),
        }
    }
}
impl std::error::Error for PoolError {}

/// A batch of rows to score.
#[derive(Debug, Clone)]
pub struct PoolRequest {
    /// Row-major, `nrow * ncol` values.
    pub rows: Vec<f32>,
    pub nrow: usize,
    pub ncol: usize,
    pub kind: PredictKind,
    /// When > 0, also name the k largest |contributions| of every row.
    pub contrib_topk: usize,
}

impl PoolRequest {
    pub fn new(rows: Vec<f32>, nrow: usize, ncol: usize) -> Self {
        Self {
            rows,
            nrow,
            ncol,
            kind: PredictKind::Value,
            contrib_topk: 0,
        }
    }

    pub fn kind(mut self, kind: PredictKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn contrib_topk(mut self, k: usize) -> Self {
        self.contrib_topk = k;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PoolOut {
    pub prediction: Prediction,
    pub queue_wait_us: u64,
    pub compute_us: u64,
    /// One list per row, largest |value| first; empty unless requested.
    pub contrib_topk: Vec<Vec<(String, f32)>>,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub n_workers: usize,
    /// Total queue capacity across all workers (evenly split, rounded up).
    pub queue_cap_total: usize,
    /// Per-worker warmup iterations to eliminate cold-start spikes.
    pub warmup_iters: usize,
    /// Optional CPU ids to pin each worker to (linux only; extra ids ignored).
    pub pin_cpus: Option<Vec<usize>>,
    /// Feature order used by the model, for contribution naming.
    pub feature_names: Option<Arc<Vec<String>>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            n_workers: 1,
            queue_cap_total: 64,
            warmup_iters: 0,
            pin_cpus: None,
            feature_names: None,
        }
    }
}

struct Job {
    enq_at: Instant,
    deadline_at: Option<Instant>,
    req: PoolRequest,
    resp_tx: oneshot::Sender<anyhow::Result<PoolOut>>,
}

struct WorkerHandle {
    tx: mpsc::Sender<Job>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub n_workers: usize,
    pub cap_total: usize,
    /// Jobs waiting in worker queues (not including running jobs).
    pub queued: usize,
    /// Jobs currently executing inside workers.
    pub running: usize,
}

impl PoolStats {
    #[inline]
    pub fn inflight(&self) -> usize {
        self.queued + self.running
    }

    #[inline]
    pub fn queue_waterline(&self) -> f64 {
        if self.cap_total == 0 {
            0.0
        } else {
            (self.queued as f64) / (self.cap_total as f64)
        }
    }
}

/// Decrements `running` when dropped.
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct PredictPool {
    workers: Vec<WorkerHandle>,
    rr: AtomicUsize,

    cap_total: usize,
    queued: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
}

impl PredictPool {
    pub fn new(factory: PredictorFactory, opts: PoolOptions) -> anyhow::Result<Self> {
        let n_workers = opts.n_workers;
        anyhow::ensure!(n_workers > 0, "predict pool n_workers must be > 0");
        anyhow::ensure!(opts.queue_cap_total > 0, "predict pool queue_cap_total must be > 0");

        // n_workers=8, queue_cap_total=512 => per_worker_cap=64.
        let per_worker_cap = opts.queue_cap_total.div_ceil(n_workers);
        let cap_total = per_worker_cap * n_workers;

        let queued = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(n_workers);
        let pin_cpus = opts.pin_cpus.clone().unwrap_or_default();

        for wid in 0..n_workers {
            let (tx, rx) = mpsc::channel::<Job>(per_worker_cap);
            let worker = Worker {
                wid,
                cpu: pin_cpus.get(wid).copied(),
                warmup_iters: opts.warmup_iters,
                feature_names: opts.feature_names.clone(),
                factory: Arc::clone(&factory),
                queued: Arc::clone(&queued),
                running: Arc::clone(&running),
            };

            thread::Builder::new()
                .name(format!("predict-worker-{wid}"))
                .spawn(move || worker.run(rx))
                .context("spawn predict worker")?;

            workers.push(WorkerHandle { tx });
        }

        Ok(Self {
            workers,
            rr: AtomicUsize::new(0),
            cap_total,
            queued,
            running,
        })
    }

    /// Pool of xgboost boosters, one per worker, loaded from a model file or dir.
    #[cfg(feature = "xgb_ffi")]
    pub fn from_model_path(
        path: impl AsRef<std::path::Path>,
        cfg: &crate::config::Config,
        mut opts: PoolOptions,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = crate::model_dir::resolve_model_file(path)?;
        if opts.feature_names.is_none() {
            opts.feature_names = crate::model_dir::load_feature_names(path)?.map(Arc::new);
        }
        let cfg = cfg.clone();
        let factory: PredictorFactory = Arc::new(move |_wid: usize| -> anyhow::Result<Box<dyn Predictor>> {
            let p = crate::predictor::XgbPredictor::load(&file, &cfg)?;
            Ok(Box::new(p))
        });
        Self::new(factory, opts)
    }

    /// Snapshot stats for admission control / debugging.
    #[inline]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            n_workers: self.workers.len(),
            cap_total: self.cap_total,
            queued: self.queued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }

    /// Non-blocking submission. Returns a oneshot receiver to await the result.
    pub fn try_submit(
        &self,
        req: PoolRequest,
    ) -> Result<oneshot::Receiver<anyhow::Result<PoolOut>>, PoolError> {
        self.try_submit_with_budget(req, 0)
    }

    /// Non-blocking submission with a queue-wait budget (microseconds).
    ///
    /// - `budget_us = 0` disables the budget.
    /// - A job that waited longer than `budget_us` is answered with
    ///   [`PoolError::DeadlineExceeded`] without running inference.
    pub fn try_submit_with_budget(
        &self,
        req: PoolRequest,
        budget_us: u64,
    ) -> Result<oneshot::Receiver<anyhow::Result<PoolOut>>, PoolError> {
        let n = self.workers.len();
        if n == 0 {
            return Err(PoolError::WorkerDown);
        }

        let (resp_tx, resp_rx) = oneshot::channel::<anyhow::Result<PoolOut>>();
        let enq_at = Instant::now();
        let mut job = Job {
            enq_at,
            deadline_at: (budget_us > 0).then(|| enq_at + Duration::from_micros(budget_us)),
            req,
            resp_tx,
        };

        let start = self.rr.fetch_add(1, Ordering::Relaxed);
        let mut down = 0usize;

        for i in 0..n {
            let idx = (start + i) % n;
            // Increment before enqueue so the worker-side fetch_sub cannot underflow.
            self.queued.fetch_add(1, Ordering::Relaxed);
            match self.workers[idx].tx.try_send(job) {
                Ok(()) => return Ok(resp_rx),
                Err(mpsc::error::TrySendError::Full(j)) => {
                    self.queued.fetch_sub(1, Ordering::Relaxed);
                    job = j;
                }
                Err(mpsc::error::TrySendError::Closed(j)) => {
                    self.queued.fetch_sub(1, Ordering::Relaxed);
                    job = j;
                    down += 1;
                }
            }
        }

        if down == n {
            Err(PoolError::WorkerDown)
        } else {
            metrics::counter!("cockchafer_pool_queue_full_total").increment(1);
            Err(PoolError::QueueFull)
        }
    }

    pub async fn submit(&self, req: PoolRequest) -> Result<anyhow::Result<PoolOut>, PoolError> {
        self.submit_with_budget(req, 0).await
    }

    pub async fn submit_with_budget(
        &self,
        req: PoolRequest,
        budget_us: u64,
    ) -> Result<anyhow::Result<PoolOut>, PoolError> {
        let rx = self.try_submit_with_budget(req, budget_us)?;
        rx.await.map_err(|_| PoolError::Canceled)
    }
}

struct Worker {
    wid: usize,
    cpu: Option<usize>,
    warmup_iters: usize,
    feature_names: Option<Arc<Vec<String>>>,
    factory: PredictorFactory,
    queued: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
}

impl Worker {
    fn run(self, mut rx: mpsc::Receiver<Job>) {
        let wid = self.wid;
        if let Some(cpu) = self.cpu {
            match pin_current_thread(cpu) {
                Ok(()) => tracing::info!(wid, cpu, "predict worker pinned"),
                Err(e) => tracing::warn!(wid, cpu, err = %e, "predict worker pin failed"),
            }
        }

        let mut predictor = match (self.factory)(wid) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(wid, err = %format!("{e:#}"), "predict worker failed to load model");
                return;
            }
        };

        if self.warmup_iters > 0 {
            let ncol = predictor.num_features();
            let row = vec![f32::NAN; ncol];
            for _ in 0..self.warmup_iters {
                if let Err(e) = predictor.predict(&row, 1, ncol, PredictKind::Value) {
                    tracing::error!(wid, err = %format!("{e:#}"), "predict worker warmup failed");
                    return;
                }
            }
            tracing::debug!(wid, iters = self.warmup_iters, "predict worker warmup done");
        }

        while let Some(job) = rx.blocking_recv() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            self.running.fetch_add(1, Ordering::Relaxed);
            let _running_guard = RunningGuard(Arc::clone(&self.running));

            let now = Instant::now();
            let queue_wait_us = dur_us(now.duration_since(job.enq_at));
            metrics::histogram!("cockchafer_pool_queue_wait_us").record(queue_wait_us as f64);

            if let Some(deadline_at) = job.deadline_at {
                if now >= deadline_at {
                    metrics::counter!("cockchafer_pool_deadline_miss_total").increment(1);
                    let _ = job
                        .resp_tx
                        .send(Err(anyhow::Error::new(PoolError::DeadlineExceeded)));
                    continue;
                }
            }

            let t0 = Instant::now();
            let res = self.execute(predictor.as_mut(), &job.req).map(|(prediction, contrib_topk)| {
                let compute_us = now_us(t0);
                metrics::histogram!("cockchafer_pool_compute_us").record(compute_us as f64);
                PoolOut {
                    prediction,
                    queue_wait_us,
                    compute_us,
                    contrib_topk,
                }
            });
            let _ = job.resp_tx.send(res);
        }
        tracing::debug!(wid, "predict worker exiting");
    }

    fn execute(
        &self,
        predictor: &mut dyn Predictor,
        req: &PoolRequest,
    ) -> anyhow::Result<(Prediction, Vec<Vec<(String, f32)>>)> {
        let prediction = predictor.predict(&req.rows, req.nrow, req.ncol, req.kind)?;
        if req.contrib_topk == 0 {
            return Ok((prediction, Vec::new()));
        }

        let contribs = if req.kind == PredictKind::Contribs {
            prediction.clone()
        } else {
            predictor.predict(&req.rows, req.nrow, req.ncol, PredictKind::Contribs)?
        };

        let names = self.feature_names.as_deref().map(Vec::as_slice);
        let topk = (0..contribs.nrow())
            .map(|i| {
                // First output group only; its last column is the bias.
                let row = contribs.row(i);
                let n = req.ncol.min(row.len());
                topk_abs_named(&row[..n], names, req.contrib_topk)
            })
            .collect();
        Ok((prediction, topk))
    }
}

#[derive(Copy, Clone, Debug)]
struct TopkItem {
    abs: f32,
    idx: usize,
    val: f32,
}

impl PartialEq for TopkItem {
    fn eq(&self, other: &Self) -> bool {
        self.abs.to_bits() == other.abs.to_bits() && self.idx == other.idx
    }
}
impl Eq for TopkItem {}

impl PartialOrd for TopkItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TopkItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.abs
            .total_cmp(&other.abs)
            .then_with(|| other.idx.cmp(&self.idx))
    }
}

/// Top-k values by absolute value, named by feature (or `f{i}` without names).
///
/// O(n log k): a min-heap of size k instead of sorting all n values.
fn topk_abs_named(values: &[f32], names: Option<&[String]>, k: usize) -> Vec<(String, f32)> {
    if k == 0 || values.is_empty() {
        return Vec::new();
    }
    let k = k.min(values.len());

    let mut heap: BinaryHeap<Reverse<TopkItem>> = BinaryHeap::with_capacity(k + 1);
    for (idx, &val) in values.iter().enumerate() {
        let item = TopkItem {
            abs: val.abs(),
            idx,
            val,
        };
        if heap.len() < k {
            heap.push(Reverse(item));
        } else if let Some(Reverse(min_item)) = heap.peek() {
            if item > *min_item {
                heap.pop();
                heap.push(Reverse(item));
            }
        }
    }

    let mut out: Vec<TopkItem> = heap.into_iter().map(|Reverse(it)| it).collect();
    out.sort_by(|a, b| b.cmp(a));

    out.into_iter()
        .map(|it| {
            let name = names
                .and_then(|n| n.get(it.idx))
                .cloned()
                .unwrap_or_else(|| format!("f{}", it.idx));
            (name, it.val)
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn pin_current_thread(cpu: usize) -> std::io::Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cpu {cpu} out of range (CPU_SETSIZE={})", libc::CPU_SETSIZE),
        ));
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let tid = libc::pthread_self();
        let rc = libc::pthread_setaffinity_np(tid, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_cpu: usize) -> std::io::Result<()> {
    Ok(())
}
