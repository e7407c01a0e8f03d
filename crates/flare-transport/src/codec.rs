//! # FEC Codec Engine — Interleaved XOR Parity
//!
//! Block FEC over one video frame. The frame is cut into `D` data fragments
//! and protected by `P` parity fragments, each the XOR of a fixed subset of
//! the data fragments.
//!
//! ## Layout
//!
//! - Shard length `S = ceil(len / D)`; data fragment `i` holds bytes
//!   `[i*S, min((i+1)*S, len))`, parity fragments are exactly `S` bytes.
//! - Data and parity slots are interleaved over `G = ceil(D / 32)`
//!   sub-groups (`i % G`, `q % G`) so a burst loss lands in several
//!   sub-groups instead of one.
//! - Inside sub-group `g` with `P_g` parity slots, parity `m` covers the data
//!   slots whose local position `l` satisfies `l % P_g == m`.
//!
//! ## Recovery
//!
//! Peeling: any parity set with exactly one unknown data slot resolves it as
//! the XOR of the parity and the known members. Repeated until nothing
//! changes. The solver only relies on the coverage sets, not on them being
//! disjoint.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::FragmentError;
use crate::stats::FecStats;
use crate::store::{FragmentGroup, GroupState};
use crate::wire::{FragmentRecord, MAX_DATA_FRAGMENTS, MAX_PARITY_FRAGMENTS};

/// Maximum data slots per sub-group before the frame is split further.
pub const MAX_SUBGROUP_DATA: u32 = 32;

// ─── Layout ─────────────────────────────────────────────────────────────────

/// Shape of one frame's fragment set. Validated on construction, so every
/// offset derived from it stays inside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentLayout {
    pub frame_byte_length: u32,
    pub data_count: u32,
    pub parity_count: u32,
}

impl FragmentLayout {
    pub fn new(
        frame_index: u64,
        frame_byte_length: u32,
        data_count: u32,
        parity_count: u32,
        max_frame_bytes: u32,
    ) -> Result<Self, FragmentError> {
        if data_count == 0 {
            return Err(FragmentError::NoDataFragments { frame_index });
        }
        if frame_byte_length == 0 {
            return Err(FragmentError::EmptyFrame { frame_index });
        }
        if frame_byte_length > max_frame_bytes {
            return Err(FragmentError::FrameTooLarge {
                frame_index,
                len: frame_byte_length,
                max: max_frame_bytes,
            });
        }
        if data_count > MAX_DATA_FRAGMENTS {
            return Err(FragmentError::TooManyFragments {
                frame_index,
                kind: "data",
                count: data_count,
                max: MAX_DATA_FRAGMENTS,
            });
        }
        if parity_count > MAX_PARITY_FRAGMENTS {
            return Err(FragmentError::TooManyFragments {
                frame_index,
                kind: "parity",
                count: parity_count,
                max: MAX_PARITY_FRAGMENTS,
            });
        }

        let layout = FragmentLayout {
            frame_byte_length,
            data_count,
            parity_count,
        };
        // Every data slot must carry at least one byte.
        if (data_count as u64 - 1) * layout.shard_len() as u64 >= frame_byte_length as u64 {
            return Err(FragmentError::InconsistentLayout {
                frame_index,
                data_count,
                len: frame_byte_length,
            });
        }
        Ok(layout)
    }

    /// Fragment payload size (all parity slots and all but the last data slot).
    pub fn shard_len(&self) -> usize {
        (self.frame_byte_length as usize).div_ceil(self.data_count as usize)
    }

    /// Byte offset of data slot `index` inside the frame.
    pub fn data_offset(&self, index: u32) -> usize {
        index as usize * self.shard_len()
    }

    /// Length of data slot `index`; the last one may be short.
    pub fn data_slot_len(&self, index: u32) -> usize {
        let len = self.frame_byte_length as usize;
        let start = self.data_offset(index).min(len);
        self.shard_len().min(len - start)
    }

    pub fn subgroup_count(&self) -> u32 {
        self.data_count.div_ceil(MAX_SUBGROUP_DATA).max(1)
    }

    pub fn subgroup_of_data(&self, index: u32) -> u32 {
        index % self.subgroup_count()
    }

    pub fn subgroup_of_parity(&self, index: u32) -> u32 {
        index % self.subgroup_count()
    }

    /// Number of parity slots assigned to sub-group `g`.
    pub fn parity_in_subgroup(&self, g: u32) -> u32 {
        let groups = self.subgroup_count();
        self.parity_count / groups + u32::from(g < self.parity_count % groups)
    }

    /// Data slot indices whose XOR is carried by parity slot `q`.
    pub fn parity_coverage(&self, q: u32) -> impl Iterator<Item = u32> {
        let groups = self.subgroup_count();
        let g = q % groups;
        let m = q / groups;
        let per_group = self.parity_in_subgroup(g).max(1);
        (g..self.data_count)
            .step_by(groups as usize)
            .enumerate()
            .filter(move |(local, _)| *local as u32 % per_group == m)
            .map(|(_, index)| index)
    }
}

fn xor_into(acc: &mut [u8], src: &[u8]) {
    for (a, b) in acc.iter_mut().zip(src) {
        *a ^= b;
    }
}

// ─── FEC Encoder ────────────────────────────────────────────────────────────

/// Sender-side fragmenter. Produces data and parity records for one frame.
#[derive(Debug, Clone)]
pub struct FecEncoder {
    shard_size: usize,
    parity_percent: u32,
}

impl FecEncoder {
    /// `shard_size` is the target payload per fragment, `parity_percent` the
    /// parity overhead relative to the data fragment count.
    pub fn new(shard_size: usize, parity_percent: u32) -> Self {
        FecEncoder {
            shard_size: shard_size.max(1),
            parity_percent,
        }
    }

    pub fn set_parity_percent(&mut self, parity_percent: u32) {
        self.parity_percent = parity_percent;
    }

    /// Layout the encoder would use for a frame of `len` bytes.
    pub fn layout_for(
        &self,
        frame_index: u64,
        len: usize,
    ) -> Result<FragmentLayout, FragmentError> {
        let len = u32::try_from(len).map_err(|_| FragmentError::FrameTooLarge {
            frame_index,
            len: u32::MAX,
            max: u32::MAX,
        })?;
        let data_count = (len as usize).div_ceil(self.shard_size).max(1);
        let data_count = u32::try_from(data_count).unwrap_or(u32::MAX);
        let parity_count = (data_count as u64 * self.parity_percent as u64).div_ceil(100);
        let parity_count = u32::try_from(parity_count).unwrap_or(u32::MAX);
        FragmentLayout::new(frame_index, len, data_count, parity_count, u32::MAX)
    }

    /// Split `frame` into records: data fragments first, then parity.
    pub fn encode_frame(
        &self,
        frame_index: u64,
        frame: &[u8],
    ) -> Result<Vec<FragmentRecord>, FragmentError> {
        let layout = self.layout_for(frame_index, frame.len())?;
        let frame = Bytes::copy_from_slice(frame);
        let shard = layout.shard_len();

        let record = |index: u32, is_parity: bool, payload: Bytes| FragmentRecord {
            frame_index,
            frame_byte_length: layout.frame_byte_length,
            data_fragment_count: layout.data_count,
            parity_fragment_count: layout.parity_count,
            fragment_index: index,
            is_parity,
            payload,
        };

        let mut out = Vec::with_capacity((layout.data_count + layout.parity_count) as usize);
        for i in 0..layout.data_count {
            let start = layout.data_offset(i);
            let payload = frame.slice(start..start + layout.data_slot_len(i));
            out.push(record(i, false, payload));
        }
        for q in 0..layout.parity_count {
            let mut parity = vec![0u8; shard];
            for i in layout.parity_coverage(q) {
                let start = layout.data_offset(i);
                xor_into(&mut parity, &frame[start..start + layout.data_slot_len(i)]);
            }
            out.push(record(q, true, Bytes::from(parity)));
        }
        Ok(out)
    }
}

// ─── Failure Signal ─────────────────────────────────────────────────────────

/// Sticky "unrecoverable loss happened" flag.
///
/// Raised by the reconstructor whenever a frame completes lossy, cleared by
/// whoever handled it (a fresh parameter-set frame, or an upstream refresh
/// request). Cloned handles share the flag, so a collaborator thread may poll it.
#[derive(Debug, Clone, Default)]
pub struct FecFailureSignal(Arc<AtomicBool>);

impl FecFailureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ─── FEC Reconstructor ──────────────────────────────────────────────────────

/// A frame handed to the bitstream splitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructedFrame {
    pub frame_index: u64,
    /// Exactly `frame_byte_length` bytes; unknown regions are zero-filled.
    pub buffer: Bytes,
    /// Some data could not be recovered.
    pub lossy: bool,
    /// Data fragments rebuilt from parity.
    pub recovered_fragments: u32,
    /// Data fragments left as zero-filled placeholders.
    pub missing_fragments: u32,
    /// Time from the first fragment of this frame to assembly.
    pub assembly_latency: Duration,
}

/// Result of a reconstruction attempt.
#[derive(Debug)]
pub enum Completion {
    /// More fragments may still arrive.
    Pending,
    /// The group reached COMPLETE or FAILED and its buffer is assembled.
    Ready(ReconstructedFrame),
}

/// Recoverability of one sub-group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubgroupHealth {
    pub subgroup: u32,
    pub missing: u32,
    pub usable_parity: u32,
}

impl SubgroupHealth {
    pub fn recoverable(&self) -> bool {
        self.missing <= self.usable_parity
    }
}

/// Per-sub-group counts of missing data slots and of the present parity
/// slots able to rebuild one of them.
///
/// A parity slot is usable once exactly one member of its set is unknown.
/// Counting follows the peeling order: a slot rebuilt by a usable parity
/// counts as known when the remaining sets are judged.
pub fn subgroup_health(group: &FragmentGroup) -> Vec<SubgroupHealth> {
    let layout = group.layout();
    let mut health: Vec<SubgroupHealth> = (0..layout.subgroup_count())
        .map(|subgroup| SubgroupHealth {
            subgroup,
            missing: 0,
            usable_parity: 0,
        })
        .collect();

    let mut known: Vec<bool> = group.data_slots.iter().map(Option::is_some).collect();
    for (i, &k) in known.iter().enumerate() {
        if !k {
            health[layout.subgroup_of_data(i as u32) as usize].missing += 1;
        }
    }

    let mut pending: Vec<u32> = (0..layout.parity_count)
        .filter(|&q| group.parity_slots[q as usize].is_some())
        .collect();
    loop {
        let before = pending.len();
        pending.retain(|&q| {
            let unknown: Vec<u32> = layout
                .parity_coverage(q)
                .filter(|&i| !known[i as usize])
                .take(2)
                .collect();
            match unknown.as_slice() {
                [] => false,
                [target] => {
                    known[*target as usize] = true;
                    health[layout.subgroup_of_parity(q) as usize].usable_parity += 1;
                    false
                }
                _ => true,
            }
        });
        if pending.len() == before {
            break;
        }
    }
    health
}

/// Rebuild missing data slots from parity until a fixed point is reached.
/// Returns the number of slots recovered by this call.
fn peel(group: &mut FragmentGroup) -> u32 {
    let layout = group.layout();
    let mut recovered = 0;

    loop {
        let mut progressed = false;
        for q in 0..layout.parity_count {
            let qi = q as usize;
            if group.parity_resolved[qi] {
                continue;
            }
            let Some(parity) = group.parity_slots[qi].clone() else {
                continue;
            };

            let unknown: Vec<u32> = layout
                .parity_coverage(q)
                .filter(|&i| group.data_slots[i as usize].is_none())
                .take(2)
                .collect();

            match unknown.as_slice() {
                [] => group.parity_resolved[qi] = true,
                [target] => {
                    let target = *target;
                    let mut acc = BytesMut::from(&parity[..]);
                    for i in layout.parity_coverage(q).filter(|&i| i != target) {
                        if let Some(data) = &group.data_slots[i as usize] {
                            xor_into(&mut acc, data);
                        }
                    }
                    acc.truncate(layout.data_slot_len(target));
                    group.data_slots[target as usize] = Some(acc.freeze());
                    group.parity_resolved[qi] = true;
                    recovered += 1;
                    progressed = true;
                }
                _ => {}
            }
        }
        if !progressed {
            break;
        }
    }
    recovered
}

/// Concatenate data slots in fragment order; unknown slots become zeros.
fn assemble(group: &FragmentGroup) -> (Bytes, u32) {
    let layout = group.layout();
    let mut buf = BytesMut::with_capacity(layout.frame_byte_length as usize);
    let mut missing = 0;
    for (i, slot) in group.data_slots.iter().enumerate() {
        match slot {
            Some(data) => buf.extend_from_slice(data),
            None => {
                missing += 1;
                buf.put_bytes(0, layout.data_slot_len(i as u32));
            }
        }
    }
    buf.truncate(layout.frame_byte_length as usize);
    (buf.freeze(), missing)
}

/// Recovers the oldest in-flight group from its parity fragments.
pub struct FecReconstructor {
    signal: FecFailureSignal,
    stats: FecStats,
}

impl FecReconstructor {
    pub fn new() -> Self {
        FecReconstructor {
            signal: FecFailureSignal::new(),
            stats: FecStats::default(),
        }
    }

    /// Attempt to finish `group`.
    ///
    /// Returns `Pending` while data is missing and more fragments may arrive.
    /// A sealed group with unknown data fails: its buffer is assembled with
    /// zero-filled gaps, `lossy` is set and the failure signal is raised.
    pub fn try_complete(&mut self, group: &mut FragmentGroup) -> Completion {
        if group.state().is_terminal() {
            tracing::debug!(frame = group.frame_index(), "group already finished");
            return Completion::Pending;
        }

        let recovered = peel(group);
        group.recovered += recovered;
        self.stats.fragments_recovered += recovered as u64;

        let missing = group.missing_data();
        let lossy = if missing == 0 {
            group.state = GroupState::Complete;
            self.stats.frames_complete += 1;
            if group.recovered > 0 {
                self.stats.frames_recovered += 1;
            }
            false
        } else if group.is_sealed() {
            group.state = GroupState::Failed;
            self.stats.frames_lossy += 1;
            let unrecoverable = subgroup_health(group)
                .into_iter()
                .filter(|h| !h.recoverable())
                .count();
            tracing::warn!(
                frame = group.frame_index(),
                missing,
                unrecoverable_subgroups = unrecoverable,
                received_parity = group.received_parity(),
                "unrecoverable fragment loss"
            );
            self.signal.raise();
            true
        } else {
            return Completion::Pending;
        };

        let (buffer, missing_fragments) = assemble(group);
        Completion::Ready(ReconstructedFrame {
            frame_index: group.frame_index(),
            buffer,
            lossy,
            recovered_fragments: group.recovered,
            missing_fragments,
            assembly_latency: group.created_at.elapsed(),
        })
    }

    pub fn fec_failure(&self) -> bool {
        self.signal.is_raised()
    }

    pub fn clear_fec_failure(&self) {
        self.signal.clear();
    }

    /// Shared handle on the failure flag.
    pub fn failure_signal(&self) -> FecFailureSignal {
        self.signal.clone()
    }

    pub fn stats(&self) -> &FecStats {
        &self.stats
    }
}

impl Default for FecReconstructor {
    fn default() -> Self {
        Self::new()
    }
}
