pub mod hybrid;

pub use hybrid::{reciprocal_rank_fusion, score_aware_rrf, weighted_fusion, HybridSource};
