use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lazyflow_core::{Error, MetaInfo, Result, Roi};
use parking_lot::{Mutex, RwLock};

use super::input::InputInner;
use super::{InputEvent, InputSlot, TRACING_TARGET};
use crate::id::DirtyCallbackId;
use crate::operator::{OperatorHandle, OperatorNode};
use crate::request::Request;

type DirtyCallback = dyn Fn(&Roi) + Send + Sync;

/// Output port of an operator.
///
/// Cloning is cheap; clones refer to the same slot.
#[derive(Clone)]
pub struct OutputSlot {
    inner: Arc<OutputInner>,
}

struct OutputInner {
    name: &'static str,
    owner: Weak<OperatorNode>,
    state: RwLock<OutputState>,
    callbacks: Mutex<Vec<(DirtyCallbackId, Arc<DirtyCallback>)>>,
}

struct OutputState {
    level: usize,
    position: Option<usize>,
    meta: MetaInfo,
    partners: Vec<Weak<InputInner>>,
    subs: Vec<OutputSlot>,
}

impl OutputSlot {
    pub(crate) fn new(name: &'static str, level: usize, owner: Weak<OperatorNode>) -> Self {
        Self::with_position(name, level, owner, None)
    }

    fn with_position(
        name: &'static str,
        level: usize,
        owner: Weak<OperatorNode>,
        position: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(OutputInner {
                name,
                owner,
                state: RwLock::new(OutputState {
                    level,
                    position,
                    meta: MetaInfo::default(),
                    partners: Vec::new(),
                    subs: Vec::new(),
                }),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &OutputSlot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Declared slot name.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// `Operator.Slot[i]` style name used in errors and logs.
    pub fn qualified_name(&self) -> String {
        let operator = self
            .inner
            .owner
            .upgrade()
            .map(|node| node.name().to_owned())
            .unwrap_or_else(|| "<detached>".into());
        match self.position() {
            Some(index) => format!("{operator}.{}[{index}]", self.inner.name),
            None => format!("{operator}.{}", self.inner.name),
        }
    }

    pub fn level(&self) -> usize {
        self.inner.state.read().level
    }

    /// Index inside the parent multi-slot, if this slot was created by
    /// resizing its operator's own multi-output.
    pub fn position(&self) -> Option<usize> {
        self.inner.state.read().position
    }

    /// Operator owning the slot.
    pub fn operator(&self) -> Option<OperatorHandle> {
        self.inner.owner.upgrade().map(OperatorHandle::from_node)
    }

    pub(crate) fn owner(&self) -> Result<Arc<OperatorNode>> {
        self.inner
            .owner
            .upgrade()
            .ok_or_else(|| Error::Internal(format!("slot `{}` outlived its operator", self.name())))
    }

    pub fn meta(&self) -> MetaInfo {
        self.inner.state.read().meta.clone()
    }

    pub fn is_ready(&self) -> bool {
        let (level, ready, subs) = {
            let state = self.inner.state.read();
            (state.level, state.meta.is_ready(), state.subs.clone())
        };
        if level == 0 {
            ready
        } else {
            subs.iter().all(OutputSlot::is_ready)
        }
    }

    /// Replaces the metadata. Only meant to be called from `setup`.
    pub fn set_meta(&self, meta: &MetaInfo) {
        self.inner.state.write().meta.assign(meta);
    }

    /// Edits the metadata in place. Only meant to be called from `setup`.
    pub fn update_meta(&self, edit: impl FnOnce(&mut MetaInfo)) {
        edit(&mut self.inner.state.write().meta);
    }

    /// Number of sub-slots.
    pub fn len(&self) -> usize {
        self.inner.state.read().subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sub-slot at `index`.
    pub fn sub(&self, index: usize) -> Result<OutputSlot> {
        let state = self.inner.state.read();
        state.subs.get(index).cloned().ok_or_else(|| Error::SubSlotIndex {
            slot: self.inner.name.into(),
            index,
            len: state.subs.len(),
        })
    }

    pub fn subs(&self) -> Vec<OutputSlot> {
        self.inner.state.read().subs.clone()
    }

    /// Inputs currently connected to this slot.
    pub fn partners(&self) -> Vec<InputSlot> {
        self.inner
            .state
            .read()
            .partners
            .iter()
            .filter_map(Weak::upgrade)
            .map(InputSlot::from_inner)
            .collect()
    }

    /// Requests `roi` of this slot.
    ///
    /// The request is created lazily: it starts when somebody waits on it,
    /// subscribes to it or submits it.
    pub fn get(&self, roi: Roi) -> Result<Request> {
        let (level, shape) = {
            let state = self.inner.state.read();
            (state.level, state.meta.shape().map(<[usize]>::to_vec))
        };
        if level > 0 {
            return Err(Error::SlotLevel {
                slot: self.qualified_name(),
                level,
            });
        }
        let shape = shape.ok_or_else(|| Error::SlotNotReady(self.qualified_name()))?;
        if !roi.fits_in(&shape) {
            return Err(Error::RoiOutOfBounds { roi, shape });
        }
        let graph = self.owner()?.graph()?;
        Ok(Request::spawn(self.clone(), roi, graph.scheduler()))
    }

    /// Marks `roi` of this slot stale and tells every dependent input.
    ///
    /// The region is clipped to the slot shape. A slot without a shape has
    /// nothing to invalidate.
    pub fn set_dirty(&self, roi: &Roi) -> Result<()> {
        let (level, shape, subs) = {
            let state = self.inner.state.read();
            (
                state.level,
                state.meta.shape().map(<[usize]>::to_vec),
                state.subs.clone(),
            )
        };
        if level > 0 {
            for sub in subs {
                sub.set_dirty(roi)?;
            }
            return Ok(());
        }
        let Some(shape) = shape else {
            return Ok(());
        };
        if roi.dim() != shape.len() {
            return Err(Error::InvalidRoi(format!(
                "{roi} has {} axes but `{}` has {}",
                roi.dim(),
                self.qualified_name(),
                shape.len()
            )));
        }
        let roi = roi.clip_to(&shape);
        if roi.is_empty() {
            return Ok(());
        }

        tracing::trace!(
            target: TRACING_TARGET,
            output = %self.qualified_name(),
            roi = %roi,
            "output dirty"
        );
        for partner in self.partners() {
            partner.set_dirty(&roi)?;
        }
        let callbacks: Vec<_> = self
            .inner
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(&roi);
        }
        Ok(())
    }

    /// Marks the whole slot stale.
    pub fn set_dirty_all(&self) -> Result<()> {
        let (level, shape, subs) = {
            let state = self.inner.state.read();
            (
                state.level,
                state.meta.shape().map(<[usize]>::to_vec),
                state.subs.clone(),
            )
        };
        if level > 0 {
            for sub in subs {
                sub.set_dirty_all()?;
            }
            return Ok(());
        }
        match shape {
            Some(shape) => self.set_dirty(&Roi::full(&shape)),
            None => Ok(()),
        }
    }

    /// Calls `callback` with every region marked dirty on this slot.
    pub fn register_dirty_callback(
        &self,
        callback: impl Fn(&Roi) + Send + Sync + 'static,
    ) -> DirtyCallbackId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let id = DirtyCallbackId(NEXT.fetch_add(1, Ordering::Relaxed));
        self.inner.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    /// Removes a dirty callback. Returns false if it was not registered.
    pub fn unregister_dirty_callback(&self, id: DirtyCallbackId) -> bool {
        let mut callbacks = self.inner.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(entry, _)| *entry != id);
        callbacks.len() != before
    }

    /// Resizes the multi-slot, keeping dependent inputs in sync.
    pub fn resize(&self, len: usize) -> Result<()> {
        let level = self.check_multi()?;
        let current = self.len();
        if len == current {
            return Ok(());
        }
        let subs = if len < current {
            self.subs().into_iter().take(len).collect()
        } else {
            let mut subs = self.subs();
            subs.extend((current..len).map(|index| {
                OutputSlot::with_position(self.inner.name, level - 1, self.inner.owner.clone(), Some(index))
            }));
            subs
        };
        self.set_subs(subs)
    }

    /// Inserts a fresh sub-slot at `index` and returns it.
    pub fn insert(&self, index: usize) -> Result<OutputSlot> {
        let level = self.check_multi()?;
        let index = index.min(self.len());
        let slot = OutputSlot::with_position(self.inner.name, level - 1, self.inner.owner.clone(), Some(index));
        self.insert_sub_slot(index, slot.clone())?;
        Ok(slot)
    }

    /// Removes the sub-slot at `index`.
    pub fn remove(&self, index: usize) -> Result<()> {
        self.check_multi()?;
        self.remove_sub_slot(index)
    }

    fn check_multi(&self) -> Result<usize> {
        match self.level() {
            0 => Err(Error::SlotLevel {
                slot: self.qualified_name(),
                level: 0,
            }),
            level => Ok(level),
        }
    }

    pub(crate) fn insert_sub_slot(&self, index: usize, slot: OutputSlot) -> Result<()> {
        let index = {
            let mut state = self.inner.state.write();
            let index = index.min(state.subs.len());
            state.subs.insert(index, slot.clone());
            self.renumber(&state.subs);
            index
        };
        for partner in self.partners() {
            partner.insert_sub_connected(index, &slot)?;
        }
        Ok(())
    }

    pub(crate) fn remove_sub_slot(&self, index: usize) -> Result<()> {
        let removed = {
            let mut state = self.inner.state.write();
            if index >= state.subs.len() {
                return Err(Error::SubSlotIndex {
                    slot: self.inner.name.into(),
                    index,
                    len: state.subs.len(),
                });
            }
            let removed = state.subs.remove(index);
            self.renumber(&state.subs);
            removed
        };
        for partner in self.partners() {
            partner.remove_sub_at(index)?;
        }
        removed.disconnect_partners()
    }

    /// Replaces the whole sub-slot list.
    pub(crate) fn set_subs(&self, subs: Vec<OutputSlot>) -> Result<()> {
        let removed: Vec<OutputSlot> = {
            let mut state = self.inner.state.write();
            let unchanged = state.subs.len() == subs.len()
                && state.subs.iter().zip(&subs).all(|(a, b)| a.ptr_eq(b));
            if unchanged {
                return Ok(());
            }
            let removed = state
                .subs
                .iter()
                .filter(|old| !subs.iter().any(|new| new.ptr_eq(old)))
                .cloned()
                .collect();
            state.subs = subs;
            self.renumber(&state.subs);
            removed
        };
        for partner in self.partners() {
            if partner.mirror_partner(self)? {
                partner.notify_owner(InputEvent::Changed)?;
            }
        }
        for slot in removed {
            slot.disconnect_partners()?;
        }
        Ok(())
    }

    fn renumber(&self, subs: &[OutputSlot]) {
        for (index, sub) in subs.iter().enumerate() {
            if Weak::ptr_eq(&sub.inner.owner, &self.inner.owner) {
                sub.inner.state.write().position = Some(index);
            }
        }
    }

    /// Tells dependent operators about changed metadata, once.
    pub(crate) fn propagate_meta(&self) -> Result<()> {
        let (dirty, subs) = {
            let mut state = self.inner.state.write();
            (state.meta.take_dirty(), state.subs.clone())
        };
        if dirty {
            for partner in self.partners() {
                partner.notify_owner(InputEvent::Changed)?;
            }
        }
        for sub in subs {
            if Weak::ptr_eq(&sub.inner.owner, &self.inner.owner) {
                sub.propagate_meta()?;
            }
        }
        Ok(())
    }

    pub(crate) fn attach(&self, input: &InputSlot) {
        let mut state = self.inner.state.write();
        state.partners.retain(|p| p.strong_count() > 0);
        state.partners.push(input.downgrade());
    }

    pub(crate) fn detach_input(&self, input: &Arc<InputInner>) {
        let target = Arc::downgrade(input);
        self.inner
            .state
            .write()
            .partners
            .retain(|p| p.strong_count() > 0 && !Weak::ptr_eq(p, &target));
    }

    /// Disconnects every dependent input, including those of own sub-slots.
    pub(crate) fn disconnect_partners(&self) -> Result<()> {
        for partner in self.partners() {
            partner.disconnect_with(true)?;
        }
        for sub in self.subs() {
            if Weak::ptr_eq(&sub.inner.owner, &self.inner.owner) {
                sub.disconnect_partners()?;
            }
        }
        Ok(())
    }

    /// Detaches and returns every dependent input without notifying them.
    pub(crate) fn take_partners(&self) -> Vec<InputSlot> {
        let partners = self.partners();
        for partner in &partners {
            partner.detach();
        }
        partners
    }

    pub(crate) fn raise_level(&self) {
        let mut state = self.inner.state.write();
        state.level += 1;
        state.meta.reset();
        state.meta.take_dirty();
        state.subs.clear();
    }
}

impl fmt::Debug for OutputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("OutputSlot")
            .field("name", &self.inner.name)
            .field("level", &state.level)
            .field("position", &state.position)
            .field("meta", &state.meta)
            .field("partners", &state.partners.len())
            .field("subs", &state.subs.len())
            .finish()
    }
}
