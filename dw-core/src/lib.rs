//! Drivewatch core library
//!
//! Everything the `drivewatchd` control loop needs that is not process
//! plumbing: the configuration model and directive parser, the transport
//! abstraction over ATA/SCSI/NVMe ports, per-device persistent and runtime
//! state with its on-disk store, the self-test scheduler, the warning
//! engine, and the per-transport health checkers.
//!
//! Raw device command construction and response decoding live behind the
//! port traits in [`device`]; this crate only consumes decoded telemetry.

pub mod check;
pub mod config;
pub mod device;
pub mod schedule;
pub mod state;
pub mod warning;

pub use dw_error::{DwError, Result};

/// Default interval between check cycles in seconds.
pub const DEFAULT_CHECKTIME: u32 = 1800;
