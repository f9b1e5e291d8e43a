//! Forward-reference resolution for control-flow targets.
//!
//! A branch may precede its target by an arbitrary amount of nested
//! structure; everything is resolved in one forward pass with no
//! backtracking. Each open construct gets a record holding the patch slots
//! that wait on its entry or exit address. Resolution is batched: requests
//! queue up and are drained together at the next location that is real work
//! (not another header or `end`), so runs of adjacent headers all collapse
//! to the same target. The debt counter tracks how many constructs still owe
//! a resolution; when it hits zero the record storage can be reclaimed.

use smallvec::SmallVec;

use crate::entry::JumpTarget;
use crate::stream::{MetadataStream, Slot};

/// A (PC, MC) snapshot. Plain value, freely copyable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Location {
    pub pc: u32,
    pub mc: u32,
}

/// A reserved [`JumpTarget`] slot waiting for its target, together with the
/// source PC the delta is computed against.
#[derive(Debug)]
pub(crate) struct PendingPatch {
    pub pc: u32,
    pub slot: Slot<JumpTarget>,
}

impl PendingPatch {
    fn patch_to(self, here: Location, stream: &mut MetadataStream) {
        let delta = JumpTarget {
            delta_pc: here.pc.wrapping_sub(self.pc) as i32,
            delta_mc: here.mc.wrapping_sub(self.slot.mc()) as i32,
        };
        stream.patch(self.slot, delta);
    }
}

#[derive(Debug, Default)]
struct ConstructRecord {
    is_loop: bool,
    /// Entry target once known. Loops resolve this at open.
    entry: Option<Location>,
    exit_resolved: bool,
    awaiting_entry: SmallVec<[PendingPatch; 4]>,
    awaiting_branch: SmallVec<[PendingPatch; 4]>,
}

#[derive(Debug, Clone, Copy)]
struct QueuedResolve {
    index: u32,
    is_entry: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Coalescer {
    records: Vec<ConstructRecord>,
    queue: SmallVec<[QueuedResolve; 16]>,
    /// Open resolutions still owed. Zero means `records` can be reclaimed.
    debt: u32,
    /// Slots patched to whatever location the next drain lands on
    /// (else/catch/delegate fall-through jumps).
    exit_fixups: SmallVec<[PendingPatch; 8]>,
    /// Branches to the function's top level; resolved at the final `end`.
    top_fixups: Vec<PendingPatch>,
}

impl Coalescer {
    /// Open a block/if/try/try_table: entry address still unknown.
    pub(crate) fn open_construct(&mut self) -> u32 {
        let index = self.records.len() as u32;
        self.queue.push(QueuedResolve {
            index,
            is_entry: true,
        });
        self.records.push(ConstructRecord::default());
        self.debt += 1;
        index
    }

    /// Open a loop: the entry is the loop header itself, known now.
    pub(crate) fn open_loop(&mut self, entry: Location) -> u32 {
        let index = self.records.len() as u32;
        self.records.push(ConstructRecord {
            is_loop: true,
            entry: Some(entry),
            ..ConstructRecord::default()
        });
        self.debt += 1;
        index
    }

    /// Register a slot that jumps to a construct's entry (the construct's
    /// own header metadata).
    pub(crate) fn await_entry(&mut self, index: u32, patch: PendingPatch) {
        self.records[index as usize].awaiting_entry.push(patch);
    }

    /// Register a branch to a construct. Loop back-edges resolve
    /// immediately; everything else waits for the exit sweep.
    pub(crate) fn branch_to(&mut self, index: u32, patch: PendingPatch, stream: &mut MetadataStream) {
        let record = &mut self.records[index as usize];
        if record.is_loop {
            let entry = record.entry.expect("loop entry is resolved at open");
            patch.patch_to(entry, stream);
        } else {
            debug_assert!(!record.exit_resolved);
            record.awaiting_branch.push(patch);
        }
    }

    /// Register a branch to the top level (a return edge).
    pub(crate) fn branch_to_top(&mut self, patch: PendingPatch) {
        self.top_fixups.push(patch);
    }

    /// Register a fall-through jump patched at the next drain location.
    pub(crate) fn defer_exit(&mut self, patch: PendingPatch) {
        self.exit_fixups.push(patch);
    }

    /// Close a construct: its exit resolves at the next drain.
    pub(crate) fn close(&mut self, index: u32) {
        self.queue.push(QueuedResolve {
            index,
            is_entry: false,
        });
        debug_assert!(self.debt > 0);
        self.debt -= 1;
    }

    /// Resolve everything queued to `here`. The caller decides when `here`
    /// is real work; this just writes the deltas.
    pub(crate) fn drain(&mut self, here: Location, stream: &mut MetadataStream) {
        if !self.queue.is_empty() {
            log::trace!(
                "coalesce: draining {} request(s) at pc={} mc={}",
                self.queue.len(),
                here.pc,
                here.mc
            );
        }
        let queue = std::mem::take(&mut self.queue);
        for entry in queue {
            if entry.is_entry {
                self.resolve_entry(entry.index, here, stream);
            } else {
                self.resolve_exit(entry.index, here, stream);
            }
        }
        if self.debt == 0 {
            self.records.clear();
        }
        for patch in std::mem::take(&mut self.exit_fixups) {
            patch.patch_to(here, stream);
        }
    }

    /// The top-level `end`: every remaining edge lands on it.
    pub(crate) fn drain_final(&mut self, here: Location, stream: &mut MetadataStream) {
        let top = std::mem::take(&mut self.top_fixups);
        self.exit_fixups.extend(top);
        self.drain(here, stream);
    }

    fn resolve_entry(&mut self, index: u32, here: Location, stream: &mut MetadataStream) {
        let record = &mut self.records[index as usize];
        debug_assert!(record.entry.is_none());
        for patch in std::mem::take(&mut record.awaiting_entry) {
            patch.patch_to(here, stream);
        }
        record.entry = Some(here);
    }

    fn resolve_exit(&mut self, index: u32, here: Location, stream: &mut MetadataStream) {
        let record = &mut self.records[index as usize];
        debug_assert!(!record.exit_resolved);
        if !record.is_loop {
            for patch in std::mem::take(&mut record.awaiting_branch) {
                patch.patch_to(here, stream);
            }
        }
        record.exit_resolved = true;
    }

    /// True once nothing is queued or pending; checked at finalize.
    pub(crate) fn is_drained(&self) -> bool {
        self.debt == 0
            && self.queue.is_empty()
            && self.exit_fixups.is_empty()
            && self.top_fixups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::BranchInfo;

    fn jump_at(stream: &MetadataStream, mc: u32) -> (i32, i32) {
        let at = mc as usize;
        let bytes = stream.as_bytes();
        (
            i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()),
            i32::from_le_bytes(bytes[at + 4..at + 8].try_into().unwrap()),
        )
    }

    #[test]
    fn block_branch_resolves_at_exit() {
        let mut stream = MetadataStream::new();
        let mut coalescer = Coalescer::default();

        // block (pc 0): header placeholder.
        let index = coalescer.open_construct();
        let slot = stream.reserve(JumpTarget::PENDING);
        coalescer.await_entry(index, PendingPatch { pc: 0, slot });
        // Entry resolves right after the header.
        coalescer.drain(Location { pc: 2, mc: 8 }, &mut stream);
        assert_eq!(jump_at(&stream, 0), (2, 8));

        // br targeting the block (pc 2).
        let slot = stream.reserve(JumpTarget::PENDING);
        stream.push(BranchInfo {
            to_pop: 0,
            to_keep: 0,
            length: 2,
        });
        coalescer.branch_to(index, PendingPatch { pc: 2, slot }, &mut stream);

        // end (pc 4) closes the block; the exit is the next location.
        coalescer.close(index);
        coalescer.drain(Location { pc: 5, mc: 24 }, &mut stream);
        assert_eq!(jump_at(&stream, 8), (3, 16));
        assert!(coalescer.is_drained());
        assert_eq!(stream.outstanding(), 0);
    }

    #[test]
    fn loop_back_edge_resolves_immediately() {
        let mut stream = MetadataStream::new();
        let mut coalescer = Coalescer::default();

        let entry = Location { pc: 0, mc: 0 };
        let index = coalescer.open_loop(entry);

        // A branch from pc 10 back to the loop header.
        stream.push(BranchInfo {
            to_pop: 0,
            to_keep: 0,
            length: 1,
        });
        let slot = stream.reserve(JumpTarget::PENDING);
        coalescer.branch_to(index, PendingPatch { pc: 10, slot }, &mut stream);
        assert_eq!(jump_at(&stream, 8), (-10, -8));

        coalescer.close(index);
        coalescer.drain(Location { pc: 12, mc: 16 }, &mut stream);
        assert!(coalescer.is_drained());
    }

    #[test]
    fn record_storage_reclaimed_when_debt_reaches_zero() {
        let mut stream = MetadataStream::new();
        let mut coalescer = Coalescer::default();

        let a = coalescer.open_construct();
        let slot = stream.reserve(JumpTarget::PENDING);
        coalescer.await_entry(a, PendingPatch { pc: 0, slot });
        coalescer.close(a);
        coalescer.drain(Location { pc: 4, mc: 8 }, &mut stream);
        assert!(coalescer.is_drained());
        assert!(coalescer.records.is_empty());

        // Indices restart after reclaim, matching open order.
        let b = coalescer.open_construct();
        assert_eq!(b, 0);
    }

    #[test]
    fn top_level_branches_wait_for_the_final_end() {
        let mut stream = MetadataStream::new();
        let mut coalescer = Coalescer::default();

        let slot = stream.reserve(JumpTarget::PENDING);
        coalescer.branch_to_top(PendingPatch { pc: 1, slot });
        coalescer.drain(Location { pc: 3, mc: 8 }, &mut stream);
        // Still pending: ordinary drains do not touch return edges.
        assert_eq!(stream.outstanding(), 1);

        coalescer.drain_final(Location { pc: 9, mc: 8 }, &mut stream);
        assert_eq!(stream.outstanding(), 0);
        assert_eq!(jump_at(&stream, 0), (8, 8));
        assert!(coalescer.is_drained());
    }
}
