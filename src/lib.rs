//! Offline time tracking engine.
//!
//! The layers, bottom up:
//!
//! - [`clock`]: wall-clock and monotonic time, injectable for tests.
//! - [`db`]: the SQLite entry store and its migrations.
//! - [`session`]: the Idle/Running timer state machine.
//! - [`report`]: totals and groupings over stored entries.
//! - [`integrity`]: the startup scan that restores a running timer and
//!   detects corruption.
//! - [`tracker`] and [`handle`]: the API front ends call, synchronous and
//!   async respectively.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod handle;
pub mod integrity;
pub mod models;
pub mod report;
pub mod session;
pub mod tracker;

pub use error::{Result, TrackerError};
pub use handle::TrackerHandle;
pub use tracker::Tracker;
