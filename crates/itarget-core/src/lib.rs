//! # itarget-core - Core Domain Types
//!
//! Foundation crate for itarget. Provides the target data model, error
//! handling, deployment-tool event definitions, and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing).
//!
//! ## Public API
//!
//! ### Targets (`target`)
//! - [`Target`] - A debuggable endpoint, tagged union of the two variants
//! - [`Simulator`], [`Device`] - The variants, with their per-kind metadata
//! - [`TargetSource`] - Local vs companion-relayed device transport
//! - [`SimulatorState`] - Booted / Shutdown
//! - [`LaunchParams`] - Arguments, environment, and debugger options for launch
//!
//! ### Events (`events`)
//! - [`DeployEvent`] - Parsed JSON events from the device-deployment tool
//! - [`parse_deploy_event()`] - Lenient event parsing with unknown fallback
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Typed error enum covering process, operation, and selection failures
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use itarget_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;
pub mod target;

/// Prelude for common imports used throughout all itarget crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use error::{Error, Result, ResultExt};
pub use events::{parse_deploy_event, DeployEvent, DetectedDevice, InstalledApp};
pub use target::{Device, LaunchParams, Simulator, SimulatorState, Target, TargetSource};
