//! Runtime tuning knobs (spec §4.C).
//!
//! Thread-safe, process-wide, hot-swappable. Consulted by F and E at query
//! time. Grounded on the original system's `runtime_config.py` module, which
//! holds the same three knobs (`default_top_k`, `pgvector_probes`,
//! `os_num_candidates`) behind a lock; here each knob is an independent
//! atomic since no invariant spans more than one of them.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::error::{RagError, Result};

const UNSET: i64 = -1;

/// Process-wide tuning state. Held behind an `Arc` in `AppContext` and cloned
/// into every component that reads it; all operations are lock-free.
pub struct RuntimeTuning {
    default_top_k: AtomicU32,
    ann_probes: AtomicI64,
    ann_num_candidates: AtomicI64,
}

impl Default for RuntimeTuning {
    fn default() -> Self {
        Self {
            default_top_k: AtomicU32::new(10),
            ann_probes: AtomicI64::new(UNSET),
            ann_num_candidates: AtomicI64::new(UNSET),
        }
    }
}

impl RuntimeTuning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_top_k(&self) -> u32 {
        self.default_top_k.load(Ordering::Relaxed)
    }

    pub fn set_default_top_k(&self, v: u32) -> Result<()> {
        if !(1..=1000).contains(&v) {
            return Err(RagError::InvalidArgument(
                "default_top_k must be in 1..=1000".to_string(),
            ));
        }
        self.default_top_k.store(v, Ordering::Relaxed);
        Ok(())
    }

    pub fn ann_probes(&self) -> Option<u32> {
        match self.ann_probes.load(Ordering::Relaxed) {
            UNSET => None,
            v => Some(v as u32),
        }
    }

    pub fn set_ann_probes(&self, v: Option<u32>) -> Result<()> {
        match v {
            None => {
                self.ann_probes.store(UNSET, Ordering::Relaxed);
                Ok(())
            }
            Some(v) if (1..=10_000).contains(&v) => {
                self.ann_probes.store(v as i64, Ordering::Relaxed);
                Ok(())
            }
            Some(_) => Err(RagError::InvalidArgument(
                "ann_probes must be in 1..=10000 or unset".to_string(),
            )),
        }
    }

    pub fn ann_num_candidates(&self) -> Option<u32> {
        match self.ann_num_candidates.load(Ordering::Relaxed) {
            UNSET => None,
            v => Some(v as u32),
        }
    }

    pub fn set_ann_num_candidates(&self, v: Option<u32>) -> Result<()> {
        match v {
            None => {
                self.ann_num_candidates.store(UNSET, Ordering::Relaxed);
                Ok(())
            }
            Some(v) if (1..=1_000_000).contains(&v) => {
                self.ann_num_candidates.store(v as i64, Ordering::Relaxed);
                Ok(())
            }
            Some(_) => Err(RagError::InvalidArgument(
                "ann_num_candidates must be in 1..=1000000 or unset".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let t = RuntimeTuning::new();
        assert_eq!(t.default_top_k(), 10);
        assert_eq!(t.ann_probes(), None);
        assert_eq!(t.ann_num_candidates(), None);
    }

    #[test]
    fn set_default_top_k_rejects_zero() {
        let t = RuntimeTuning::new();
        assert!(t.set_default_top_k(0).is_err());
        assert!(t.set_default_top_k(1001).is_err());
        assert!(t.set_default_top_k(500).is_ok());
        assert_eq!(t.default_top_k(), 500);
    }

    #[test]
    fn ann_probes_can_be_unset_again() {
        let t = RuntimeTuning::new();
        t.set_ann_probes(Some(16)).unwrap();
        assert_eq!(t.ann_probes(), Some(16));
        t.set_ann_probes(None).unwrap();
        assert_eq!(t.ann_probes(), None);
    }

    #[test]
    fn ann_num_candidates_rejects_out_of_bounds() {
        let t = RuntimeTuning::new();
        assert!(t.set_ann_num_candidates(Some(0)).is_err());
        assert!(t.set_ann_num_candidates(Some(1_000_001)).is_err());
    }
}
