//! Doublet detection for single cell count data.
//!
//! Artificial doublets are simulated from random pairs of observed cells,
//! both populations are embedded into one low-dimensional space that is
//! fitted on the observed cells only, and every cell is scored by the
//! fraction of simulated doublets among its nearest neighbours.

pub mod core;
pub mod error;
pub mod single_cell;
pub mod utils;

pub use crate::core::data::sparse_structures::{CountMatrix, CsrMatrix, GeneFilter};
pub use crate::error::{Result, ScrubletError};
pub use crate::single_cell::methods::scrublet::{
    run_scrublet, run_scrublet_batched, BatchedScrubletResult, DoubletCall, ScrubletBatch,
    ScrubletParams, ScrubletResult,
};
