//! Per-tile random-forest gap filling for large classified rasters.
//!
//! A brick (raw imagery plus a sparse label raster) is cut into aligned tiles,
//! each tile is classified in its own worker process under a hard deadline,
//! and the per-tile results are handed to an external merge step.
pub mod classify;
pub mod config;
pub mod error;
pub mod forest;
pub mod logging;
pub mod partition;
pub mod pipeline;
pub mod raster;
pub mod scheduler;
pub mod selection;

pub use error::{Error, Result};
