//! Display-order reorder buffer for temporal processing.
//!
//! Frames arrive in decode order. Up to `depth` of them are held back and
//! released smallest presentation time first, which restores display order
//! for streams whose reordering distance does not exceed the depth.

use std::collections::{BTreeMap, HashSet};

use vcs_common::{FrameId, MediaTime};

pub(crate) struct ReorderBuffer<T> {
    depth: usize,
    held: BTreeMap<(MediaTime, FrameId), T>,
    marked: HashSet<FrameId>,
}

impl<T> ReorderBuffer<T> {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            depth,
            held: BTreeMap::new(),
            marked: HashSet::new(),
        }
    }

    pub(crate) fn set_depth(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// Route the result of `id` through the buffer.
    pub(crate) fn mark(&mut self, id: FrameId) {
        self.marked.insert(id);
    }

    /// Whether `id` was marked. Clears the mark.
    pub(crate) fn take_mark(&mut self, id: FrameId) -> bool {
        self.marked.remove(&id)
    }

    /// Hold `item` and release whatever no longer fits, in display order.
    pub(crate) fn push(&mut self, pts: MediaTime, id: FrameId, item: T) -> Vec<(FrameId, T)> {
        self.held.insert((pts, id), item);
        let mut released = Vec::new();
        while self.held.len() > self.depth {
            match self.held.pop_first() {
                Some(((_, id), item)) => released.push((id, item)),
                None => break,
            }
        }
        released
    }

    /// Release every held item with a presentation time up to `until`
    /// (everything when `None`).
    pub(crate) fn release(&mut self, until: Option<MediaTime>) -> Vec<(FrameId, T)> {
        let mut released = Vec::new();
        while let Some(entry) = self.held.first_entry() {
            if until.is_some_and(|u| entry.key().0 > u) {
                break;
            }
            let ((_, id), item) = entry.remove_entry();
            released.push((id, item));
        }
        released
    }

    pub(crate) fn len(&self) -> usize {
        self.held.len()
    }
}
