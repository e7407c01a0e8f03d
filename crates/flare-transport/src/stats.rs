//! # Transport Statistics
//!
//! Counters for the fragment store and the FEC reconstructor.
//! All stats serialize to JSON for periodic logging.

use serde::Serialize;

// ─── Store Stats ────────────────────────────────────────────────────────────

/// Fragment admission counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    /// Records offered to the store (including rejected ones).
    pub fragments_received: u64,
    /// Records rejected by validation or layout checks.
    pub malformed: u64,
    /// Fragments for an already-filled slot.
    pub duplicates: u64,
    /// Fragments for retired frames.
    pub stale: u64,
    /// Groups created.
    pub groups_opened: u64,
    /// Groups pushed out of the window before finishing.
    pub evicted: u64,
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of received fragments that were actually useful.
    pub fn acceptance_ratio(&self) -> f64 {
        if self.fragments_received == 0 {
            0.0
        } else {
            let rejected = self.malformed + self.duplicates + self.stale;
            self.fragments_received.saturating_sub(rejected) as f64
                / self.fragments_received as f64
        }
    }
}

// ─── FEC Stats ──────────────────────────────────────────────────────────────

/// Reconstruction counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FecStats {
    /// Frames whose every data slot became known.
    pub frames_complete: u64,
    /// Complete frames that needed parity to get there.
    pub frames_recovered: u64,
    /// Frames assembled with zero-filled gaps.
    pub frames_lossy: u64,
    /// Data fragments rebuilt from parity.
    pub fragments_recovered: u64,
}

impl FecStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of finished frames that were lossy.
    pub fn loss_rate(&self) -> f64 {
        let finished = self.frames_complete + self.frames_lossy;
        if finished == 0 {
            0.0
        } else {
            self.frames_lossy as f64 / finished as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_ratio_ignores_rejections() {
        let stats = StoreStats {
            fragments_received: 10,
            malformed: 1,
            duplicates: 2,
            stale: 2,
            ..StoreStats::default()
        };
        assert!((stats.acceptance_ratio() - 0.5).abs() < 1e-9);
        assert_eq!(StoreStats::new().acceptance_ratio(), 0.0);
    }

    #[test]
    fn loss_rate_over_finished_frames() {
        let stats = FecStats {
            frames_complete: 3,
            frames_lossy: 1,
            ..FecStats::default()
        };
        assert!((stats.loss_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn stats_serialize_to_json() {
        let json = serde_json::to_string(&FecStats::new()).unwrap();
        assert!(json.contains("\"frames_lossy\":0"));
    }
}
