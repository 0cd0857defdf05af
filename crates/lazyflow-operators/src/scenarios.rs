//! Whole-pipeline tests.

use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::task::{Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lazyflow_core::{Buffer, DType, Error, MetaInfo, Result, Roi};
use lazyflow_runtime::{
    ExecuteContext, Graph, GraphConfig, Op, Operator, OperatorContext, OutputKey, OutputSlot,
    Request, RequestState, SlotDef,
};
use ndarray::{ArrayD, Dimension, IxDyn};
use parking_lot::Mutex;

use crate::{
    ArraySource, BlockCache, GaussianSmoothing, ListSource, Piper, Sum, gaussian_filter,
    operator_registry,
};

fn roi(start: &[i64], stop: &[i64]) -> Roi {
    Roi::new(start.to_vec(), stop.to_vec()).unwrap()
}

fn pattern(shape: &[usize]) -> ArrayD<f64> {
    ArrayD::from_shape_fn(IxDyn(shape), |index| {
        let mut value = 0;
        for (axis, &i) in index.slice().iter().enumerate() {
            value += i * (3 + 4 * axis);
        }
        (value % 17) as f64
    })
}

fn constant(shape: &[usize], value: f64) -> Buffer {
    let mut data = Buffer::zeros(DType::F64, shape);
    data.fill(value);
    data
}

fn assert_close(actual: &Buffer, expected: &Buffer) {
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.to_f64().iter().zip(expected.to_f64().iter()) {
        assert!((a - e).abs() < 1e-9, "{a} != {e}");
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Source whose executions park until the gate opens.
#[derive(Debug, Clone, Default)]
struct Gate {
    shape: Vec<usize>,
    open: Arc<AtomicBool>,
    entered: Arc<AtomicUsize>,
    wakers: Arc<Mutex<Vec<Waker>>>,
}

impl Gate {
    const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");

    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            ..Self::default()
        }
    }

    fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        for waker in self.wakers.lock().drain(..) {
            waker.wake();
        }
    }
}

#[async_trait]
impl Operator for Gate {
    fn type_name(&self) -> &'static str {
        "Gate"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&MetaInfo::new(self.shape.clone(), DType::F64));
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        _output: &OutputSlot,
        _roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        poll_fn(|cx| {
            if self.open.load(Ordering::SeqCst) {
                return Poll::Ready(());
            }
            self.wakers.lock().push(cx.waker().clone());
            if self.open.load(Ordering::SeqCst) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;
        destination.fill(1.0);
        Ok(())
    }
}

/// Blocks its worker thread until released, to hold the pool busy.
#[derive(Debug, Clone)]
struct Blocker {
    barrier: Arc<Barrier>,
}

impl Blocker {
    const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");
}

#[async_trait]
impl Operator for Blocker {
    fn type_name(&self) -> &'static str {
        "Blocker"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&MetaInfo::new(vec![1], DType::F64));
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        _output: &OutputSlot,
        _roi: &Roi,
        _destination: &mut Buffer,
    ) -> Result<()> {
        self.barrier.wait();
        self.barrier.wait();
        Ok(())
    }
}

/// Waits on a request handed to it from outside the graph.
#[derive(Debug, Clone, Default)]
struct Await {
    target: Arc<Mutex<Option<Request>>>,
}

impl Await {
    const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");
}

#[async_trait]
impl Operator for Await {
    fn type_name(&self) -> &'static str {
        "Await"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&MetaInfo::new(vec![4], DType::F64));
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        _output: &OutputSlot,
        _roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        let target = self
            .target
            .lock()
            .clone()
            .ok_or_else(|| Error::operator("nothing to wait on"))?;
        let data = target.wait().await?;
        destination.assign(&data)
    }
}

struct Pipeline {
    source: Op<ArraySource>,
    cache: Op<BlockCache>,
}

fn blurred(graph: &Graph, data: ArrayD<f64>, sigma: f64, block: &[usize]) -> Pipeline {
    let source = graph.add_operator(ArraySource::new(data)).unwrap();
    let blur = graph.add_operator(GaussianSmoothing::new(sigma)).unwrap();
    let cache = graph.add_operator(BlockCache::new(block)).unwrap();
    blur.input(GaussianSmoothing::INPUT)
        .connect(source.output(ArraySource::OUTPUT))
        .unwrap();
    cache
        .input(BlockCache::INPUT)
        .connect(blur.output(GaussianSmoothing::OUTPUT))
        .unwrap();
    Pipeline { source, cache }
}

#[test]
fn test_blur_pipeline_caches_and_invalidates() {
    let graph = Graph::new(GraphConfig::default().with_num_workers(4)).unwrap();
    let data = pattern(&[100, 100, 3]);
    let reference = Buffer::F64(gaussian_filter(&data, 2.0, &[0, 1, 2]));
    let Pipeline { source, cache } = blurred(&graph, data, 2.0, &[32, 32, 3]);

    let region = roi(&[10, 10, 0], &[40, 40, 3]);
    let expected = reference.slice(&region).unwrap();
    let read = || {
        cache
            .output(BlockCache::OUTPUT)
            .get(region.clone())
            .unwrap()
            .wait_blocking()
            .unwrap()
    };

    let first = read();
    assert_close(&first, &expected);
    let executions = source.operator().executions();
    assert_eq!(executions, 4);

    let second = read();
    assert_eq!(*first, *second);
    assert_eq!(source.operator().executions(), executions);

    source
        .output(ArraySource::OUTPUT)
        .set_dirty(&Roi::full(&[100, 100, 3]))
        .unwrap();
    assert_eq!(cache.operator().cached_blocks(), 0);
    let third = read();
    assert_close(&third, &expected);
    assert_eq!(source.operator().executions(), 2 * executions);
}

#[test]
fn test_concurrent_readers_share_one_computation() {
    let graph = Graph::new(GraphConfig::default().with_num_workers(4)).unwrap();
    let source = graph
        .add_operator(ArraySource::new(pattern(&[64, 64])))
        .unwrap();
    let cache = graph.add_operator(BlockCache::new([32])).unwrap();
    cache
        .input(BlockCache::INPUT)
        .connect(source.output(ArraySource::OUTPUT))
        .unwrap();

    let readers = 8;
    let barrier = Arc::new(Barrier::new(readers));
    let results: Vec<_> = (0..readers)
        .map(|_| {
            let barrier = barrier.clone();
            let output = cache.output(BlockCache::OUTPUT).clone();
            thread::spawn(move || {
                barrier.wait();
                output
                    .get(roi(&[4, 4], &[20, 28]))
                    .unwrap()
                    .wait_blocking()
                    .unwrap()
            })
        })
        .map(|reader| reader.join().unwrap())
        .collect();

    assert_eq!(source.operator().executions(), 1);
    let expected = Buffer::F64(pattern(&[64, 64]))
        .slice(&roi(&[4, 4], &[20, 28]))
        .unwrap();
    for data in results {
        assert_eq!(*data, expected);
    }
}

#[test]
fn test_cancel_reaches_block_computation() {
    let graph = Graph::new(GraphConfig::default().with_num_workers(2)).unwrap();
    let gate = Gate::new(&[8]);
    let handle = gate.clone();
    let source = graph.add_operator(gate).unwrap();
    let cache = graph.add_operator(BlockCache::new([4])).unwrap();
    cache
        .input(BlockCache::INPUT)
        .connect(source.output(Gate::OUTPUT))
        .unwrap();

    let request = cache
        .output(BlockCache::OUTPUT)
        .get(roi(&[0], &[4]))
        .unwrap();
    request.submit();
    wait_until("the block computation", || handle.entered.load(Ordering::SeqCst) == 1);

    assert!(request.cancel());
    assert!(matches!(request.wait_blocking(), Err(Error::Canceled)));
    assert_eq!(cache.operator().cached_blocks(), 0);

    // The abandoned block is computed afresh by the next reader.
    handle.open();
    let data = cache
        .output(BlockCache::OUTPUT)
        .get(roi(&[1], &[3]))
        .unwrap()
        .wait_blocking()
        .unwrap();
    assert!(data.to_f64().iter().all(|&v| v == 1.0));
    assert_eq!(handle.entered.load(Ordering::SeqCst), 2);
    wait_until("the block to be cached", || cache.operator().cached_blocks() == 1);
}

#[test]
fn test_shared_block_survives_one_cancel() {
    let graph = Graph::new(GraphConfig::default().with_num_workers(2)).unwrap();
    let gate = Gate::new(&[8]);
    let handle = gate.clone();
    let source = graph.add_operator(gate).unwrap();
    let cache = graph.add_operator(BlockCache::new([8])).unwrap();
    cache
        .input(BlockCache::INPUT)
        .connect(source.output(Gate::OUTPUT))
        .unwrap();
    let output = cache.output(BlockCache::OUTPUT);

    let first = output.get(roi(&[0], &[4])).unwrap();
    first.submit();
    wait_until("the block computation", || handle.entered.load(Ordering::SeqCst) == 1);
    let second = output.get(roi(&[4], &[8])).unwrap();
    second.submit();
    wait_until("the second reader", || second.state() == RequestState::InProgress);
    thread::sleep(Duration::from_millis(50));

    assert!(first.cancel());
    assert!(!second.is_canceled());
    handle.open();

    let data = second.wait_blocking().unwrap();
    assert_eq!(data.shape(), &[4]);
    assert!(data.to_f64().iter().all(|&v| v == 1.0));
    wait_until("the block to be cached", || cache.operator().cached_blocks() == 1);
}

#[test]
fn test_waited_on_request_is_not_starved() {
    let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
    let barrier = Arc::new(Barrier::new(2));
    let blocker = graph
        .add_operator(Blocker {
            barrier: barrier.clone(),
        })
        .unwrap();
    let slow = graph.add_operator(ArraySource::new(constant(&[4], 3.0))).unwrap();
    let fillers = graph.add_operator(ArraySource::new(constant(&[4], 0.0))).unwrap();
    let waiter = Await::default();
    let target = waiter.target.clone();
    let waiter = graph.add_operator(waiter).unwrap();

    // Occupy the only worker while the queue fills up.
    let busy = blocker.output(Blocker::OUTPUT).get(Roi::full(&[1])).unwrap();
    busy.submit();
    barrier.wait();

    let low = slow.output(ArraySource::OUTPUT).get(Roi::full(&[4])).unwrap();
    low.submit();
    let queued: Vec<_> = (0..50)
        .map(|_| {
            let request = fillers.output(ArraySource::OUTPUT).get(Roi::full(&[4])).unwrap();
            request.submit();
            request
        })
        .collect();
    *target.lock() = Some(low.clone());

    let high = waiter
        .output(Await::OUTPUT)
        .get(Roi::full(&[4]))
        .unwrap()
        .write_into(Buffer::zeros(DType::F64, &[4]), 10)
        .unwrap();
    let fillers_seen = Arc::new(AtomicUsize::new(usize::MAX));
    let seen = fillers_seen.clone();
    let counter = fillers.operator().clone();
    high.notify(move |_| seen.store(counter.executions(), Ordering::SeqCst));

    barrier.wait();
    let data = high.wait_blocking().unwrap();
    assert!(data.to_f64().iter().all(|&v| v == 3.0));
    assert_eq!(fillers_seen.load(Ordering::SeqCst), 0);
    assert_eq!(low.state(), RequestState::Finished);

    busy.wait_blocking().unwrap();
    for request in queued {
        request.wait_blocking().unwrap();
    }
    assert_eq!(fillers.operator().executions(), 50);
}

#[test]
fn test_caches_share_the_memory_budget() {
    let block_bytes = 16 * 16 * 8;
    let config = GraphConfig {
        num_workers: 1,
        soft_max_memory: 8 * block_bytes,
        cache_memory_fraction: 1.0,
        min_evictable_size: 0,
        ..GraphConfig::default()
    };
    let graph = Graph::new(config).unwrap();
    let caches: Vec<Op<BlockCache>> = (0..4)
        .map(|_| {
            let source = graph
                .add_operator(ArraySource::new(pattern(&[64, 64])))
                .unwrap();
            let cache = graph.add_operator(BlockCache::new([16])).unwrap();
            cache
                .input(BlockCache::INPUT)
                .connect(source.output(ArraySource::OUTPUT))
                .unwrap();
            cache
        })
        .collect();

    let expected = Buffer::F64(pattern(&[64, 64]));
    for cache in &caches {
        let data = cache
            .output(BlockCache::OUTPUT)
            .get(Roi::full(&[64, 64]))
            .unwrap()
            .wait_blocking()
            .unwrap();
        assert_eq!(*data, expected);
        assert!(graph.memory_stats().used <= graph.memory().ceiling());
    }

    let stats = graph.memory_stats();
    assert_eq!(stats.caches, 4);
    assert!(stats.evictions > 0);
    let held: u64 = caches.iter().map(|cache| cache.operator().memory_size()).sum();
    assert_eq!(held, stats.used);
}

#[test]
fn test_list_pipeline_follows_edits() {
    let graph = Graph::new(GraphConfig::default().with_num_workers(2)).unwrap();
    let list = graph
        .add_operator(ListSource::new(vec![constant(&[3, 3], 1.0), constant(&[3, 3], 2.0)]))
        .unwrap();
    let piper = graph.add_operator(Piper).unwrap();
    let cache = graph.add_operator(BlockCache::new([2])).unwrap();
    let sum = graph.add_operator(Sum).unwrap();
    piper
        .input(Piper::INPUT)
        .connect(list.output(ListSource::OUTPUTS))
        .unwrap();
    cache
        .input(BlockCache::INPUT)
        .connect(piper.output(Piper::OUTPUT))
        .unwrap();
    sum.input(Sum::INPUTS)
        .connect(cache.output(BlockCache::OUTPUT))
        .unwrap();
    assert!(piper.is_vectorized());
    assert!(cache.is_vectorized());

    let total = || {
        let data = sum
            .output(Sum::OUTPUT)
            .get(Roi::full(&[3, 3]))
            .unwrap()
            .wait_blocking()
            .unwrap();
        let values: Vec<f64> = data.to_f64().iter().copied().collect();
        assert!(values.iter().all(|v| *v == values[0]));
        values[0]
    };
    assert_eq!(total(), 3.0);

    ListSource::insert(&list, 0, constant(&[3, 3], 10.0)).unwrap();
    assert_eq!(sum.input(Sum::INPUTS).len(), 3);
    let inner = cache.inner_operators();
    assert_eq!(inner.len(), 3);
    assert!(inner[0].operator().state().unwrap().is_none());
    assert!(inner[1].operator().state().unwrap().is_some());
    assert_eq!(total(), 13.0);

    let removed = ListSource::remove(&list, 1).unwrap();
    assert_eq!(removed, constant(&[3, 3], 1.0));
    assert_eq!(cache.inner_operators().len(), 2);
    assert_eq!(total(), 12.0);
}

#[test]
fn test_suspended_graph_holds_pipeline_work() {
    let graph = Graph::new(GraphConfig::default().with_num_workers(2)).unwrap();
    let Pipeline { source, cache } = blurred(&graph, pattern(&[20, 20]), 1.0, &[10]);

    graph.suspend().unwrap();
    let request = cache
        .output(BlockCache::OUTPUT)
        .get(roi(&[0, 0], &[10, 10]))
        .unwrap();
    request.submit();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(request.state(), RequestState::Pending);
    assert_eq!(source.operator().executions(), 0);

    graph.resume();
    request.wait_blocking().unwrap();
    assert_eq!(source.operator().executions(), 1);
    wait_until("the block to be cached", || cache.operator().cached_blocks() == 1);
}

#[test]
fn test_snapshot_restores_pipeline_and_cache() {
    let graph = Graph::new(GraphConfig::default().with_num_workers(2)).unwrap();
    let Pipeline { cache, .. } = blurred(&graph, pattern(&[24, 24]), 1.5, &[8]);
    let region = roi(&[0, 0], &[16, 8]);
    let original = cache
        .output(BlockCache::OUTPUT)
        .get(region.clone())
        .unwrap()
        .wait_blocking()
        .unwrap();
    wait_until("both blocks to be cached", || cache.operator().cached_blocks() == 2);

    let json = graph.dump().unwrap().to_json().unwrap();
    let snapshot = lazyflow_runtime::snapshot::GraphSnapshot::from_json(&json).unwrap();
    let restored = Graph::reconstruct(&snapshot, &operator_registry()).unwrap();
    assert_eq!(restored.operators().len(), 3);
    assert_eq!(restored.memory_stats().used, cache.operator().memory_size());

    let handle = restored.operator(cache.id()).unwrap();
    assert!(handle.operator().state().unwrap().is_some());
    let data = handle
        .output_by_name("Output")
        .unwrap()
        .get(region)
        .unwrap()
        .wait_blocking()
        .unwrap();
    assert_eq!(*data, *original);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_readers_share_cached_blocks() {
    let graph = Graph::new(GraphConfig::default().with_num_workers(2)).unwrap();
    let data = pattern(&[64, 64]);
    let reference = Buffer::F64(gaussian_filter(&data, 1.0, &[0, 1]));
    let Pipeline { source, cache } = blurred(&graph, data, 1.0, &[32]);
    let output = cache.output(BlockCache::OUTPUT);
    let tiles = [
        roi(&[0, 0], &[32, 64]),
        roi(&[32, 0], &[64, 64]),
        roi(&[16, 16], &[48, 48]),
    ];

    for _ in 0..2 {
        let requests = tiles
            .iter()
            .map(|tile| output.get(tile.clone()))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let results = futures::future::join_all(requests.iter().map(Request::wait)).await;
        for (tile, result) in tiles.iter().zip(results) {
            assert_close(&result.unwrap(), &reference.slice(tile).unwrap());
        }
        // One upstream read per block, shared by every tile and round.
        assert_eq!(source.operator().executions(), 4);
    }
}
