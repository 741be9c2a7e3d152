//! # itarget-app - Target State and Orchestration
//!
//! Ties the backends together: a unified registry over simulators and
//! devices, the selected-target state with persistence and an interactive
//! pick seam, and the command orchestrator that runs multi-step workflows
//! with progress, cancellation, and debugserver lifetime tracking.
//!
//! Depends on [`itarget_core`] for domain types and [`itarget_backend`] for
//! the external tools.
//!
//! ## Public API
//!
//! ### Registry (`registry`)
//! - [`TargetRegistry`] - Merged target listing, udid resolution, and cached
//!   validity checks
//! - [`SimulatorApi`] / [`DeviceApi`] - Backend seams the registry dispatches
//!   through
//!
//! ### Selection (`selection`, `store`)
//! - [`TargetSelection`] - The currently selected target: lazy re-validation,
//!   pick fallback, change notifications
//! - [`TargetPicker`] - Interactive pick seam
//! - [`SelectionStore`] / [`JsonFileStore`] - Selection persistence
//!
//! ### Orchestration (`command`)
//! - [`TargetCommands`] - install / launch / install-and-launch / pid / path /
//!   debugserver workflows over a resolved target
//! - [`Progress`] - Step and percentage progress reported while a workflow runs

pub mod command;
pub mod registry;
pub mod selection;
pub mod store;
#[cfg(test)]
pub(crate) mod test_util;

// Public API re-exports
pub use command::{Progress, TargetCommands};
pub use registry::{DeviceApi, SimulatorApi, TargetRegistry};
pub use selection::{TargetPicker, TargetSelection};
pub use store::{JsonFileStore, SelectionStore};
