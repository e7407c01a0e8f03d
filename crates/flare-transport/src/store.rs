//! # Fragment Store
//!
//! Holds the fragment groups of the frames currently in flight, keyed by
//! frame index. The number of in-flight frames is bounded by a small window:
//! opening a frame beyond it evicts (seals) the oldest one, so the pipeline
//! never waits on a frame that will not complete.
//!
//! Frame indices only move forward. Once a frame is retired (finished or
//! evicted) any fragment for it, or for an older frame, is stale.

use bytes::Bytes;
use quanta::Instant;
use std::collections::BTreeMap;

use crate::codec::FragmentLayout;
use crate::error::FragmentError;
use crate::stats::StoreStats;
use crate::wire::{Fragment, FragmentRecord, DEFAULT_MAX_FRAME_BYTES};

// ─── Fragment Group ─────────────────────────────────────────────────────────

/// Lifecycle of a group. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Collecting,
    /// Every data slot is known.
    Complete,
    /// Sealed with data still unknown.
    Failed,
}

impl GroupState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, GroupState::Collecting)
    }
}

/// Data and parity slots of one frame.
#[derive(Debug)]
pub struct FragmentGroup {
    frame_index: u64,
    layout: FragmentLayout,
    pub(crate) data_slots: Vec<Option<Bytes>>,
    pub(crate) parity_slots: Vec<Option<Bytes>>,
    /// Parity slots whose coverage set is fully known.
    pub(crate) parity_resolved: Vec<bool>,
    pub(crate) state: GroupState,
    pub(crate) recovered: u32,
    pub(crate) created_at: Instant,
    sealed: bool,
}

impl FragmentGroup {
    pub fn new(frame_index: u64, layout: FragmentLayout) -> Self {
        FragmentGroup {
            frame_index,
            layout,
            data_slots: vec![None; layout.data_count as usize],
            parity_slots: vec![None; layout.parity_count as usize],
            parity_resolved: vec![false; layout.parity_count as usize],
            state: GroupState::Collecting,
            recovered: 0,
            created_at: Instant::now(),
            sealed: false,
        }
    }

    /// Write a fragment into its slot. Returns `false` if the slot was
    /// already filled (the duplicate is ignored).
    pub fn insert(&mut self, fragment: Fragment) -> Result<bool, FragmentError> {
        if fragment.frame_index != self.frame_index || fragment.layout != self.layout {
            return Err(FragmentError::LayoutMismatch {
                frame_index: fragment.frame_index,
            });
        }
        let slots = if fragment.is_parity {
            &mut self.parity_slots
        } else {
            &mut self.data_slots
        };
        let count = slots.len() as u32;
        let Some(slot) = slots.get_mut(fragment.fragment_index as usize) else {
            return Err(FragmentError::IndexOutOfRange {
                frame_index: fragment.frame_index,
                index: fragment.fragment_index,
                count,
            });
        };
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(fragment.payload);
        Ok(true)
    }

    /// Mark that no more fragments will arrive for this frame.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn layout(&self) -> FragmentLayout {
        self.layout
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn received_data(&self) -> u32 {
        self.data_slots.iter().filter(|s| s.is_some()).count() as u32
    }

    pub fn received_parity(&self) -> u32 {
        self.parity_slots.iter().filter(|s| s.is_some()).count() as u32
    }

    pub fn missing_data(&self) -> u32 {
        self.layout.data_count - self.received_data()
    }
}

// ─── Fragment Store ─────────────────────────────────────────────────────────

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum frames in flight.
    pub window: usize,
    /// Largest frame a fragment may declare.
    pub max_frame_bytes: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            window: 2,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// What happened to a fragment offered to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Written into an empty slot.
    Inserted,
    /// Slot already held data; nothing changed.
    Duplicate,
    /// Frame already retired, or older than the whole full window.
    Stale,
}

/// Result of [`FragmentStore::add`].
#[derive(Debug)]
pub struct Admission {
    pub outcome: AddOutcome,
    /// Group pushed out of the window to make room, already sealed.
    pub evicted: Option<FragmentGroup>,
}

impl Admission {
    fn plain(outcome: AddOutcome) -> Self {
        Admission {
            outcome,
            evicted: None,
        }
    }
}

/// In-flight fragment groups, oldest first.
pub struct FragmentStore {
    config: StoreConfig,
    groups: BTreeMap<u64, FragmentGroup>,
    /// Highest frame index ever retired.
    watermark: Option<u64>,
    stats: StoreStats,
}

impl FragmentStore {
    pub fn new(config: StoreConfig) -> Self {
        FragmentStore {
            config: StoreConfig {
                window: config.window.max(1),
                ..config
            },
            groups: BTreeMap::new(),
            watermark: None,
            stats: StoreStats::default(),
        }
    }

    /// Validate a raw record, then [`add`](Self::add) it.
    pub fn ingest(&mut self, record: FragmentRecord) -> Result<Admission, FragmentError> {
        self.stats.fragments_received += 1;
        let fragment = match Fragment::from_record(record, self.config.max_frame_bytes) {
            Ok(fragment) => fragment,
            Err(e) => {
                self.stats.malformed += 1;
                return Err(e);
            }
        };
        self.add(fragment)
    }

    /// Place a fragment into its group, opening the group if needed.
    pub fn add(&mut self, fragment: Fragment) -> Result<Admission, FragmentError> {
        let frame_index = fragment.frame_index;
        if self.is_retired(frame_index) {
            self.stats.stale += 1;
            tracing::debug!(frame = frame_index, "stale fragment dropped");
            return Ok(Admission::plain(AddOutcome::Stale));
        }

        if let Some(group) = self.groups.get_mut(&frame_index) {
            return match group.insert(fragment) {
                Ok(true) => Ok(Admission::plain(AddOutcome::Inserted)),
                Ok(false) => {
                    self.stats.duplicates += 1;
                    Ok(Admission::plain(AddOutcome::Duplicate))
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    Err(e)
                }
            };
        }

        let window_full = self.groups.len() >= self.config.window;
        if window_full
            && self
                .groups
                .keys()
                .next()
                .is_some_and(|&oldest| frame_index < oldest)
        {
            self.stats.stale += 1;
            tracing::debug!(frame = frame_index, "fragment older than full window dropped");
            return Ok(Admission::plain(AddOutcome::Stale));
        }

        // A rejected fragment must not evict anything.
        let mut group = FragmentGroup::new(frame_index, fragment.layout);
        if let Err(e) = group.insert(fragment) {
            self.stats.malformed += 1;
            return Err(e);
        }

        let mut evicted = None;
        if window_full {
            if let Some((_, mut oldest)) = self.groups.pop_first() {
                oldest.seal();
                self.retire(oldest.frame_index());
                self.stats.evicted += 1;
                tracing::warn!(
                    frame = oldest.frame_index(),
                    received = oldest.received_data(),
                    expected = oldest.layout().data_count,
                    by = frame_index,
                    "frame evicted from window"
                );
                evicted = Some(oldest);
            }
        }

        self.groups.insert(frame_index, group);
        self.stats.groups_opened += 1;

        Ok(Admission {
            outcome: AddOutcome::Inserted,
            evicted,
        })
    }

    /// Seal every in-flight group older than `frame_index`.
    /// Returns how many groups were sealed.
    pub fn seal_before(&mut self, frame_index: u64) -> usize {
        let mut sealed = 0;
        for group in self.groups.range_mut(..frame_index).map(|(_, g)| g) {
            if !group.is_sealed() {
                group.seal();
                sealed += 1;
            }
        }
        sealed
    }

    /// The oldest in-flight group, the only one reconstruction runs on.
    pub fn oldest_mut(&mut self) -> Option<&mut FragmentGroup> {
        self.groups.values_mut().next()
    }

    /// Remove the oldest group and advance the staleness watermark.
    pub fn retire_oldest(&mut self) -> Option<FragmentGroup> {
        let (frame_index, group) = self.groups.pop_first()?;
        self.retire(frame_index);
        Some(group)
    }

    pub fn in_flight(&self) -> usize {
        self.groups.len()
    }

    pub fn window(&self) -> usize {
        self.config.window
    }

    /// Highest retired frame index, if any.
    pub fn watermark(&self) -> Option<u64> {
        self.watermark
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    fn is_retired(&self, frame_index: u64) -> bool {
        self.watermark.is_some_and(|w| frame_index <= w)
    }

    fn retire(&mut self, frame_index: u64) {
        self.watermark = Some(self.watermark.map_or(frame_index, |w| w.max(frame_index)));
    }
}

impl Default for FragmentStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
