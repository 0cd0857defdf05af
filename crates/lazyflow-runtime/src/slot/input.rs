use std::fmt;
use std::sync::{Arc, Weak};

use lazyflow_core::{Buffer, Error, MetaInfo, Result, Roi};
use parking_lot::RwLock;

use super::{OutputSlot, TRACING_TARGET};
use crate::operator::{OperatorHandle, OperatorNode};
use crate::request::Request;

/// Change reported by an input slot to its operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputEvent {
    /// Partner, value or metadata changed.
    Changed,
    /// A sub-slot was inserted at the index.
    Inserted(usize),
    /// The sub-slot at the index was removed.
    Removed(usize),
}

/// Where an input takes its data from.
#[derive(Clone)]
pub(crate) enum InputSource {
    Partner(OutputSlot),
    Value(Arc<Buffer>),
    Empty,
}

/// Input port of an operator.
///
/// Cloning is cheap; clones refer to the same slot.
#[derive(Clone)]
pub struct InputSlot {
    inner: Arc<InputInner>,
}

pub(crate) struct InputInner {
    name: &'static str,
    top: usize,
    owner: Weak<OperatorNode>,
    state: RwLock<InputState>,
}

struct InputState {
    level: usize,
    position: Option<usize>,
    partner: Option<OutputSlot>,
    value: Option<Arc<Buffer>>,
    meta: MetaInfo,
    subs: Vec<InputSlot>,
}

impl InputSlot {
    pub(crate) fn new(name: &'static str, top: usize, level: usize, owner: Weak<OperatorNode>) -> Self {
        Self::with_position(name, top, level, owner, None)
    }

    fn with_position(
        name: &'static str,
        top: usize,
        level: usize,
        owner: Weak<OperatorNode>,
        position: Option<usize>,
    ) -> Self {
        Self {
            inner: Arc::new(InputInner {
                name,
                top,
                owner,
                state: RwLock::new(InputState {
                    level,
                    position,
                    partner: None,
                    value: None,
                    meta: MetaInfo::default(),
                    subs: Vec::new(),
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<InputInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<InputInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn ptr_eq(&self, other: &InputSlot) -> bool {
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

    /// Index of the declared slot this slot belongs to.
    pub(crate) fn top_index(&self) -> usize {
        self.inner.top
    }

    /// Nesting level.
    pub fn level(&self) -> usize {
        self.inner.state.read().level
    }

    /// Index inside the parent multi-slot, if this is a sub-slot.
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

    /// Upstream output this slot is connected to.
    pub fn partner(&self) -> Option<OutputSlot> {
        self.inner.state.read().partner.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.read().partner.is_some()
    }

    pub fn has_value(&self) -> bool {
        self.inner.state.read().value.is_some()
    }

    /// Metadata of the data arriving at this slot.
    pub fn meta(&self) -> MetaInfo {
        let (partner, meta) = {
            let state = self.inner.state.read();
            let partner = (state.level == 0).then(|| state.partner.clone()).flatten();
            (partner, state.meta.clone())
        };
        match partner {
            Some(partner) => partner.meta(),
            None => meta,
        }
    }

    /// Returns true once the slot can deliver data.
    ///
    /// A level-0 slot is ready when it holds a value or its partner's
    /// metadata is ready. A multi-slot is ready when it has a source (or at
    /// least one sub-slot) and every sub-slot is ready.
    pub fn is_ready(&self) -> bool {
        let (level, partner, has_value, subs) = {
            let state = self.inner.state.read();
            (
                state.level,
                state.partner.clone(),
                state.value.is_some(),
                state.subs.clone(),
            )
        };
        if has_value {
            return true;
        }
        if level == 0 {
            return partner.is_some_and(|p| p.meta().is_ready());
        }
        (partner.is_some() || !subs.is_empty()) && subs.iter().all(InputSlot::is_ready)
    }

    /// Number of sub-slots.
    pub fn len(&self) -> usize {
        self.inner.state.read().subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sub-slot at `index`.
    pub fn sub(&self, index: usize) -> Result<InputSlot> {
        let state = self.inner.state.read();
        state.subs.get(index).cloned().ok_or_else(|| Error::SubSlotIndex {
            slot: self.inner.name.into(),
            index,
            len: state.subs.len(),
        })
    }

    pub fn subs(&self) -> Vec<InputSlot> {
        self.inner.state.read().subs.clone()
    }

    pub(crate) fn source(&self) -> InputSource {
        let state = self.inner.state.read();
        if let Some(value) = &state.value {
            InputSource::Value(value.clone())
        } else if let Some(partner) = &state.partner {
            InputSource::Partner(partner.clone())
        } else {
            InputSource::Empty
        }
    }

    /// Connects this slot to `partner`.
    ///
    /// When the partner has a higher level the owning operator is
    /// vectorized first. When it has a lower level its data is broadcast
    /// to every sub-slot.
    pub fn connect(&self, partner: &OutputSlot) -> Result<()> {
        let graph = self.owner()?.graph()?;
        let _topology = graph.lock_topology();
        self.connect_with(partner, true).map(drop)
    }

    /// Detaches the slot from its partner or value.
    pub fn disconnect(&self) -> Result<()> {
        let graph = self.owner()?.graph()?;
        let _topology = graph.lock_topology();
        self.disconnect_with(true).map(drop)
    }

    /// Feeds the slot with a literal value.
    pub fn set_value(&self, value: impl Into<Buffer>) -> Result<()> {
        self.set_shared_value(Arc::new(value.into()))
    }

    /// Feeds the slot with a shared literal value.
    pub fn set_shared_value(&self, value: Arc<Buffer>) -> Result<()> {
        let graph = self.owner()?.graph()?;
        let _topology = graph.lock_topology();
        self.set_value_with(value, true).map(drop)
    }

    /// Resizes an unconnected multi-slot.
    pub fn resize(&self, len: usize) -> Result<()> {
        let graph = self.owner()?.graph()?;
        let _topology = graph.lock_topology();
        let level = self.level();
        if level == 0 {
            return Err(Error::SlotLevel {
                slot: self.qualified_name(),
                level,
            });
        }
        if self.partner().is_some_and(|p| p.level() == level) {
            return Err(Error::SlotConnected(self.qualified_name()));
        }
        if self.resize_subs(len)? {
            self.notify_owner(InputEvent::Changed)?;
        }
        Ok(())
    }

    /// Literal value of the slot.
    pub fn value(&self) -> Result<Arc<Buffer>> {
        let (value, connected) = {
            let state = self.inner.state.read();
            (state.value.clone(), state.partner.is_some())
        };
        match (value, connected) {
            (Some(value), _) => Ok(value),
            (None, true) => Err(Error::SlotConnected(self.qualified_name())),
            (None, false) => Err(Error::SlotNotReady(self.qualified_name())),
        }
    }

    /// Literal value of the slot read as a scalar.
    pub fn value_f64(&self) -> Result<f64> {
        self.value()?.scalar_f64()
    }

    /// Requests `roi` of the data arriving at this slot.
    ///
    /// Literal values answer immediately with an already finished request.
    pub fn get(&self, roi: Roi) -> Result<Request> {
        let (level, partner, value) = {
            let state = self.inner.state.read();
            (state.level, state.partner.clone(), state.value.clone())
        };
        if level > 0 {
            return Err(Error::SlotLevel {
                slot: self.qualified_name(),
                level,
            });
        }
        if let Some(value) = value {
            if !roi.fits_in(value.shape()) {
                return Err(Error::RoiOutOfBounds {
                    roi,
                    shape: value.shape().to_vec(),
                });
            }
            let data = value.slice(&roi)?;
            return Ok(Request::ready(data, roi));
        }
        match partner {
            Some(partner) => partner.get(roi),
            None => Err(Error::SlotNotReady(self.qualified_name())),
        }
    }

    /// Tells the owning operator that `roi` of this input is stale.
    pub fn set_dirty(&self, roi: &Roi) -> Result<()> {
        self.owner()?.notify_dirty(self, roi)
    }

    pub(crate) fn notify_owner(&self, event: InputEvent) -> Result<()> {
        self.owner()?.on_input_event(self.inner.top, event)
    }

    pub(crate) fn connect_with(&self, partner: &OutputSlot, notify: bool) -> Result<bool> {
        let (level, current, has_value) = {
            let state = self.inner.state.read();
            (state.level, state.partner.clone(), state.value.is_some())
        };
        if has_value {
            return Err(Error::SlotHasValue(self.qualified_name()));
        }

        let partner_level = partner.level();
        if partner_level > level {
            self.owner()?.vectorize(partner_level - level)?;
            return self.connect_with(partner, notify);
        }

        let same = current.as_ref().is_some_and(|p| p.ptr_eq(partner));
        if same && level == 0 {
            return Ok(false);
        }
        if !same {
            self.detach();
            self.inner.state.write().partner = Some(partner.clone());
            if partner_level == level {
                partner.attach(self);
            }
            tracing::trace!(
                target: TRACING_TARGET,
                input = %self.qualified_name(),
                output = partner.name(),
                "input connected"
            );
        }

        let mut changed = !same;
        if level > 0 {
            changed |= if partner_level == level {
                self.mirror_partner(partner)?
            } else {
                self.broadcast_partner(partner)?
            };
        }
        if changed && notify {
            self.notify_owner(InputEvent::Changed)?;
        }
        Ok(changed)
    }

    pub(crate) fn disconnect_with(&self, notify: bool) -> Result<bool> {
        let changed = self.detach();
        if changed && notify {
            self.notify_owner(InputEvent::Changed)?;
        }
        Ok(changed)
    }

    pub(crate) fn set_value_with(&self, value: Arc<Buffer>, notify: bool) -> Result<bool> {
        let (level, previous, connected) = {
            let state = self.inner.state.read();
            (state.level, state.value.clone(), state.partner.is_some())
        };
        if connected {
            return Err(Error::SlotConnected(self.qualified_name()));
        }
        if previous.as_ref().is_some_and(|p| Arc::ptr_eq(p, &value)) {
            return Ok(false);
        }

        {
            let mut state = self.inner.state.write();
            state.meta.assign(&value.meta());
            state.value = Some(value.clone());
        }
        if level > 0 {
            if self.is_empty() {
                self.resize_subs(1)?;
            }
            for sub in self.subs() {
                sub.detach();
                sub.set_value_with(value.clone(), false)?;
            }
        }
        if notify {
            self.notify_owner(InputEvent::Changed)?;
        }
        if previous.is_some() && level == 0 {
            self.set_dirty(&Roi::full(value.shape()))?;
        }
        Ok(true)
    }

    /// Number of elements a vectorized owner needs for this input.
    pub(crate) fn required_length(&self) -> usize {
        let state = self.inner.state.read();
        if state.value.is_some() {
            return 1;
        }
        match &state.partner {
            Some(partner) if partner.level() == state.level => partner.len(),
            Some(_) => 1,
            None => state.subs.len(),
        }
    }

    /// Returns true when one source feeds every sub-slot.
    pub(crate) fn is_broadcast(&self) -> bool {
        let state = self.inner.state.read();
        state.value.is_some()
            || state
                .partner
                .as_ref()
                .is_some_and(|p| p.level() < state.level)
    }

    /// Grows or shrinks the sub-slot list, feeding new sub-slots from the
    /// broadcast source if there is one.
    pub(crate) fn resize_subs(&self, len: usize) -> Result<bool> {
        let (level, current) = {
            let state = self.inner.state.read();
            (state.level, state.subs.len())
        };
        if len == current {
            return Ok(false);
        }
        if len < current {
            let removed: Vec<InputSlot> = self.inner.state.write().subs.drain(len..).collect();
            for sub in removed {
                sub.detach();
            }
            return Ok(true);
        }

        let created: Vec<InputSlot> = (current..len)
            .map(|index| {
                InputSlot::with_position(
                    self.inner.name,
                    self.inner.top,
                    level - 1,
                    self.inner.owner.clone(),
                    Some(index),
                )
            })
            .collect();
        self.inner.state.write().subs.extend(created.iter().cloned());

        match self.source() {
            InputSource::Value(value) => {
                for sub in &created {
                    sub.set_value_with(value.clone(), false)?;
                }
            }
            InputSource::Partner(partner) if partner.level() < level => {
                for sub in &created {
                    sub.connect_with(&partner, false)?;
                }
            }
            _ => {}
        }
        Ok(true)
    }

    /// Makes the sub-slots follow the sub-slots of an equal-level partner.
    pub(crate) fn mirror_partner(&self, partner: &OutputSlot) -> Result<bool> {
        let targets = partner.subs();
        let mut changed = self.resize_subs(targets.len())?;
        for (sub, target) in self.subs().iter().zip(&targets) {
            changed |= sub.connect_with(target, false)?;
        }
        Ok(changed)
    }

    fn broadcast_partner(&self, partner: &OutputSlot) -> Result<bool> {
        let mut changed = false;
        if self.is_empty() {
            changed |= self.resize_subs(1)?;
        }
        for sub in self.subs() {
            changed |= sub.connect_with(partner, false)?;
        }
        Ok(changed)
    }

    /// Inserts a sub-slot at `index` connected to `target`.
    pub(crate) fn insert_sub_connected(&self, index: usize, target: &OutputSlot) -> Result<()> {
        let sub = {
            let mut state = self.inner.state.write();
            let index = index.min(state.subs.len());
            let sub = InputSlot::with_position(
                self.inner.name,
                self.inner.top,
                state.level.saturating_sub(1),
                self.inner.owner.clone(),
                Some(index),
            );
            state.subs.insert(index, sub.clone());
            renumber(&state.subs);
            sub
        };
        sub.connect_with(target, false)?;
        self.notify_owner(InputEvent::Inserted(index))
    }

    /// Removes the sub-slot at `index`.
    pub(crate) fn remove_sub_at(&self, index: usize) -> Result<()> {
        let removed = {
            let mut state = self.inner.state.write();
            if index >= state.subs.len() {
                return Ok(());
            }
            let removed = state.subs.remove(index);
            renumber(&state.subs);
            removed
        };
        removed.detach();
        self.notify_owner(InputEvent::Removed(index))
    }

    /// Drops partner, value and sub-slots without notifying anybody.
    /// Returns true when something was attached.
    pub(crate) fn detach(&self) -> bool {
        let (partner, value, subs) = {
            let mut state = self.inner.state.write();
            state.meta.reset();
            (
                state.partner.take(),
                state.value.take(),
                std::mem::take(&mut state.subs),
            )
        };
        if let Some(partner) = &partner {
            partner.detach_input(&self.inner);
        }
        let had_subs = !subs.is_empty();
        for sub in subs {
            sub.detach();
        }
        partner.is_some() || value.is_some() || had_subs
    }

    /// Detaches and returns the previous source, for re-applying after the
    /// slot level changed.
    pub(crate) fn take_source(&self) -> InputSource {
        let source = self.source();
        self.detach();
        source
    }

    pub(crate) fn raise_level(&self) {
        let mut state = self.inner.state.write();
        state.level += 1;
        state.meta.reset();
    }
}

fn renumber(subs: &[InputSlot]) {
    for (index, sub) in subs.iter().enumerate() {
        sub.inner.state.write().position = Some(index);
    }
}

impl fmt::Debug for InputSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("InputSlot")
            .field("name", &self.inner.name)
            .field("level", &state.level)
            .field("position", &state.position)
            .field("connected", &state.partner.is_some())
            .field("has_value", &state.value.is_some())
            .field("subs", &state.subs.len())
            .finish()
    }
}
