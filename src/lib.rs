//! Photovoltaic capacity testing per ASTM E2848.
//!
//! Measured (DAS) and simulated (PVsyst) data are loaded into [`CapData`],
//! filtered, fit to the capacity regression and compared at reporting
//! conditions.

pub mod capdata;
pub mod config;
pub mod data;
pub mod error;
pub mod pipeline;
pub mod regression;
pub mod rep_cond;
pub mod results;

pub use capdata::CapData;
pub use error::{CapTestError, Result};
