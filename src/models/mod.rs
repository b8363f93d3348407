//! Domain models for the tracking engine.
//!
//! # Persistent Entities
//!
//! - [`Project`]: Top-level grouping. Archived projects keep their history but
//!   accept no new tasks or entries.
//! - [`Task`]: Unit of work owned by exactly one project. Time is always
//!   recorded against a task.
//! - [`TimeEntry`]: A span of worked time. An entry without an end is the
//!   running timer; the store never holds more than one.
//!
//! # Transient State
//!
//! - [`SessionState`]: Whether a timer is running, rebuilt from storage at
//!   startup and never persisted itself.
//! - [`SessionEvent`]: Published after every committed session transition.

mod entry;
mod project;
mod session;
mod task;

pub use entry::*;
pub use project::*;
pub use session::*;
pub use task::*;
