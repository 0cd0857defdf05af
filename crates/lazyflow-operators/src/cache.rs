//! Block-wise cache of an upstream output.
//!
//! The output is split into a grid of blocks. A request is answered from
//! the blocks it touches; missing blocks are computed by requesting exactly
//! that block upstream, and concurrent requesters of one missing block all
//! wait on the same upstream request. Cached blocks count against the
//! graph's cache budget and may be evicted, least recently used first.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use lazyflow_core::{Buffer, DType, Error, Result, Roi};
use lazyflow_runtime::cache::{BlockLookup, BlockTable};
use lazyflow_runtime::{
    CacheId, CacheMemory, ExecuteContext, InputKey, InputSlot, MemoryManager, Operator,
    OperatorContext, OutputKey, OutputSlot, RequestId, RequestOutcome, SlotDef,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tracing target for block caching.
const TRACING_TARGET: &str = "lazyflow_operators::cache";

/// Block size used when none is given.
pub const DEFAULT_BLOCK_SIZE: usize = 128;

/// Caches its input block by block.
///
/// `block_shape` holds either one entry, used for every axis, or one entry
/// per axis. Blocks are clipped to the array, so a block shape larger than
/// the input simply yields a single block along that axis.
#[derive(Serialize, Deserialize)]
pub struct BlockCache {
    block_shape: Vec<usize>,
    #[serde(skip)]
    store: Arc<BlockStore>,
}

impl BlockCache {
    pub const INPUT: InputKey<Self> = InputKey::new(0, "Input");
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");

    pub fn new(block_shape: impl Into<Vec<usize>>) -> Self {
        Self {
            block_shape: block_shape.into(),
            store: Arc::default(),
        }
    }

    pub fn block_shape(&self) -> &[usize] {
        &self.block_shape
    }

    /// Number of blocks currently cached.
    pub fn cached_blocks(&self) -> usize {
        self.store.blocks.ready_blocks().len()
    }

    /// Bytes held by cached blocks.
    pub fn memory_size(&self) -> u64 {
        self.store.blocks.memory_size()
    }

    /// Identifier assigned by the graph's memory manager, once configured.
    pub fn cache_id(&self) -> Option<CacheId> {
        self.store.registration.lock().as_ref().map(|r| r.id)
    }

    fn layout(&self) -> Result<Layout> {
        self.store
            .layout
            .read()
            .clone()
            .ok_or_else(|| Error::SlotNotReady("BlockCache.Output".into()))
    }

    /// Looks a block up, starting its upstream request when it is missing.
    fn lookup(&self, input: &InputSlot, layout: &Layout, coord: &[usize]) -> Result<BlockLookup> {
        let key = coord.to_vec();
        let lookup = self
            .store
            .blocks
            .lookup_or_insert_with(&key, || input.get(layout.block_roi(coord)))?;
        match &lookup {
            BlockLookup::Ready(_) => self.store.record_hit(),
            BlockLookup::Started(request) => {
                let store = Arc::downgrade(&self.store);
                let id = request.id();
                request.notify(move |outcome| BlockStore::finish(&store, &key, id, outcome));
            }
            BlockLookup::InFlight(_) => {}
        }
        Ok(lookup)
    }

    /// Waits for one block, taking over its computation when the request
    /// that was computing it got canceled.
    async fn block_data(
        &self,
        ctx: &ExecuteContext,
        layout: &Layout,
        coord: &[usize],
        mut lookup: BlockLookup,
    ) -> Result<Arc<Buffer>> {
        loop {
            let request = match lookup {
                BlockLookup::Ready(data) => return Ok(data),
                BlockLookup::InFlight(request) | BlockLookup::Started(request) => request,
            };
            match request.wait().await {
                Err(err) if err.is_canceled() && !ctx.request().is_canceled() => {
                    tracing::debug!(
                        target: TRACING_TARGET,
                        operator = %ctx.name(),
                        block = ?coord,
                        "block computation was canceled, retrying"
                    );
                    self.store.blocks.abandon(&coord.to_vec(), request.id());
                    lookup = self.lookup(ctx.input(Self::INPUT), layout, coord)?;
                }
                result => return result,
            }
        }
    }
}

impl Clone for BlockCache {
    fn clone(&self) -> Self {
        Self::new(self.block_shape.clone())
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new([DEFAULT_BLOCK_SIZE])
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("block_shape", &self.block_shape)
            .field("cached_blocks", &self.cached_blocks())
            .field("memory_size", &self.memory_size())
            .finish()
    }
}

#[async_trait]
impl Operator for BlockCache {
    fn type_name(&self) -> &'static str {
        "BlockCache"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        const INPUTS: &[SlotDef] = &[SlotDef::new("Input")];
        INPUTS
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        let input = ctx.input(Self::INPUT);
        let meta = input.meta();
        let (Some(shape), Some(dtype)) = (meta.shape(), meta.dtype()) else {
            return Err(Error::SlotNotReady(input.qualified_name()));
        };
        let layout = Layout::new(shape, &self.block_shape, dtype)?;

        let freed = self.store.blocks.clear();
        self.store.report_free(freed);
        tracing::debug!(
            target: TRACING_TARGET,
            operator = %ctx.name(),
            shape = ?layout.shape,
            block = ?layout.block,
            dropped = freed,
            "cache configured"
        );
        *self.store.layout.write() = Some(layout);
        *self.store.name.write() = ctx.name().to_owned();
        self.store.register(ctx.graph().memory());

        ctx.output(Self::OUTPUT).set_meta(&meta);
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        _output: &OutputSlot,
        roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        let layout = self.layout()?;
        let input = ctx.input(Self::INPUT);

        // Start every missing block before waiting on any of them.
        let lookups = layout
            .blocks_in(roi)
            .into_iter()
            .map(|coord| {
                let lookup = self.lookup(input, &layout, &coord)?;
                Ok((coord, lookup))
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::trace!(
            target: TRACING_TARGET,
            operator = %ctx.name(),
            roi = %roi,
            blocks = lookups.len(),
            "cache lookup"
        );

        for (coord, lookup) in lookups {
            let block = layout.block_roi(&coord);
            let data = self.block_data(ctx, &layout, &coord, lookup).await?;
            let Some(part) = block.intersect(roi) else {
                continue;
            };
            destination.assign_region(&part.relative_to(roi), &data.slice(&part.relative_to(&block))?)?;
        }
        Ok(())
    }

    fn notify_dirty(&self, ctx: &OperatorContext<'_>, _input: &InputSlot, roi: &Roi) -> Result<()> {
        if let Some(layout) = self.store.layout.read().clone() {
            let freed = self
                .store
                .blocks
                .invalidate(|coord| layout.block_roi(coord).intersects(roi));
            self.store.report_free(freed);
            tracing::debug!(
                target: TRACING_TARGET,
                operator = %ctx.name(),
                roi = %roi,
                freed,
                "cached blocks invalidated"
            );
        }
        ctx.output(Self::OUTPUT).set_dirty(roi)
    }

    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn state(&self) -> Result<Option<Value>> {
        let mut blocks: Vec<CachedBlock> = self
            .store
            .blocks
            .ready_blocks()
            .into_iter()
            .map(|(block, data)| CachedBlock {
                block,
                data: Buffer::clone(&data),
            })
            .collect();
        if blocks.is_empty() {
            return Ok(None);
        }
        blocks.sort_by(|a, b| a.block.cmp(&b.block));
        Ok(Some(serde_json::to_value(CacheState { blocks })?))
    }

    fn restore_state(&self, ctx: &OperatorContext<'_>, state: Value) -> Result<()> {
        let layout = self.layout()?;
        let state: CacheState = serde_json::from_value(state)?;
        let before = self.store.blocks.memory_size();
        let count = state.blocks.len();
        for CachedBlock { block, data } in state.blocks {
            layout.check_block(&block, &data)?;
            self.store.blocks.insert_ready(block, Arc::new(data));
        }
        let added = self.store.blocks.memory_size().saturating_sub(before);
        self.store.report_allocation(added);
        tracing::debug!(
            target: TRACING_TARGET,
            operator = %ctx.name(),
            blocks = count,
            bytes = added,
            "cache state restored"
        );
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CacheState {
    blocks: Vec<CachedBlock>,
}

#[derive(Serialize, Deserialize)]
struct CachedBlock {
    block: Vec<usize>,
    data: Buffer,
}

/// Block grid over the output.
#[derive(Debug, Clone, PartialEq)]
struct Layout {
    shape: Vec<usize>,
    block: Vec<usize>,
    dtype: DType,
}

impl Layout {
    fn new(shape: &[usize], block_shape: &[usize], dtype: DType) -> Result<Self> {
        let block: Vec<usize> = match block_shape {
            [size] => vec![*size; shape.len()],
            sizes if sizes.len() == shape.len() => sizes.to_vec(),
            sizes => {
                return Err(Error::InvalidConfig(format!(
                    "block shape {sizes:?} does not match a {}-d input",
                    shape.len()
                )));
            }
        };
        if block.contains(&0) {
            return Err(Error::InvalidConfig(format!(
                "block shape {block:?} has an empty axis"
            )));
        }
        let block = block
            .iter()
            .zip(shape)
            .map(|(&b, &n)| b.min(n).max(1))
            .collect();
        Ok(Self {
            shape: shape.to_vec(),
            block,
            dtype,
        })
    }

    /// Blocks per axis.
    fn grid(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.block)
            .map(|(&n, &b)| n.div_ceil(b))
            .collect()
    }

    /// Region covered by the block at `coord`, clipped to the array.
    fn block_roi(&self, coord: &[usize]) -> Roi {
        let start: Vec<i64> = coord
            .iter()
            .zip(&self.block)
            .map(|(&c, &b)| (c * b) as i64)
            .collect();
        let extent: Vec<usize> = coord
            .iter()
            .zip(&self.block)
            .zip(&self.shape)
            .map(|((&c, &b), &n)| ((c + 1) * b).min(n) - c * b)
            .collect();
        Roi::full(&extent).translate(&start)
    }

    /// Coordinates of every block touching `roi`, in row-major order.
    fn blocks_in(&self, roi: &Roi) -> Vec<Vec<usize>> {
        if roi.is_empty() {
            return Vec::new();
        }
        let mut coords = vec![Vec::with_capacity(self.shape.len())];
        for axis in 0..self.shape.len() {
            let block = self.block[axis] as i64;
            let first = (roi.start()[axis] / block) as usize;
            let last = ((roi.stop()[axis] + block - 1) / block) as usize;
            coords = coords
                .into_iter()
                .flat_map(|prefix| {
                    (first..last).map(move |c| {
                        let mut coord = prefix.clone();
                        coord.push(c);
                        coord
                    })
                })
                .collect();
        }
        coords
    }

    fn check_block(&self, coord: &[usize], data: &Buffer) -> Result<()> {
        let grid = self.grid();
        if coord.len() != grid.len() || coord.iter().zip(&grid).any(|(c, g)| c >= g) {
            return Err(Error::Serialization(format!(
                "block {coord:?} is outside the grid {grid:?}"
            )));
        }
        let expected = self.block_roi(coord).shape();
        if data.shape() != expected.as_slice() || data.dtype() != self.dtype {
            return Err(Error::Serialization(format!(
                "block {coord:?} holds a {} array of shape {:?}, expected {} {:?}",
                data.dtype(),
                data.shape(),
                self.dtype,
                expected
            )));
        }
        Ok(())
    }
}

struct Registration {
    memory: MemoryManager,
    id: CacheId,
}

/// Runtime state of a [`BlockCache`], shared with the memory manager.
#[derive(Default)]
struct BlockStore {
    name: RwLock<String>,
    blocks: BlockTable<Vec<usize>>,
    layout: RwLock<Option<Layout>>,
    registration: Mutex<Option<Registration>>,
}

impl BlockStore {
    fn register(self: &Arc<Self>, memory: &MemoryManager) {
        let mut registration = self.registration.lock();
        if registration.is_some() {
            return;
        }
        let weak: Weak<dyn CacheMemory> = Arc::downgrade(self) as Weak<dyn CacheMemory>;
        let id = memory.register(weak);
        *registration = Some(Registration {
            memory: memory.clone(),
            id,
        });
    }

    fn report_allocation(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Some(Registration { memory, id }) = &*self.registration.lock() {
            memory.notify_allocation(*id, bytes);
        }
    }

    fn report_free(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Some(Registration { memory, id }) = &*self.registration.lock() {
            memory.notify_free(*id, bytes);
        }
    }

    fn record_hit(&self) {
        if let Some(Registration { memory, id }) = &*self.registration.lock() {
            memory.record_hit(*id);
        }
    }

    /// Completion hook of an upstream block request.
    fn finish(store: &Weak<Self>, key: &Vec<usize>, request: RequestId, outcome: &RequestOutcome) {
        let Some(store) = store.upgrade() else {
            return;
        };
        match outcome {
            RequestOutcome::Finished(data) => {
                if let Some(bytes) = store.blocks.complete(key, request, data.clone()) {
                    store.report_allocation(bytes);
                }
            }
            RequestOutcome::Failed(_) | RequestOutcome::Canceled => {
                store.blocks.abandon(key, request);
            }
        }
    }
}

impl CacheMemory for BlockStore {
    fn name(&self) -> String {
        self.name.read().clone()
    }

    fn memory_size(&self) -> u64 {
        self.blocks.memory_size()
    }

    fn free_memory(&self, requested: u64) -> u64 {
        self.blocks.evict_lru(requested)
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if let Some(Registration { memory, id }) = self.registration.get_mut().take() {
            memory.unregister(id, self.blocks.memory_size());
        }
    }
}
