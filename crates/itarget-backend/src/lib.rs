//! # itarget-backend - Target Backends
//!
//! Drives the external tools that own simulators and devices: `xcrun simctl`
//! for the simulator runtime and `ios-deploy` for physical devices, both over
//! a shared process-execution layer.
//!
//! Depends on [`itarget_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Process Execution (`runner`)
//! - [`exec()`] - Buffered execution with captured output
//! - [`exec_streaming()`] / [`exec_streaming_lines()`] - Incremental stdout as
//!   parsed JSON objects or raw lines, with cancellation
//! - [`CancelToken`] / [`CancelHandle`] - Kill a streaming child
//! - [`ProcessHandle`] - A child left running beyond its event stream
//! - [`JsonObjectScanner`] / [`repair_concatenated_json()`] - Boundary repair
//!   for the deployment tool's separator-less JSON output
//!
//! ### Simulator Backend (`simctl`)
//! - [`SimulatorBackend`] - List, validate, boot, shutdown, install, launch,
//!   and pid lookup for simulators
//!
//! ### Device Backend (`deploy`)
//! - [`DeviceBackend`] - List, validate, install, launch, debugserver, app
//!   path and pid lookup for devices, with local/companion source handling
//! - [`Debugserver`] - A started debugserver's port and process handle
//!
//! ### Tooling (`tools`)
//! - [`ToolAvailability`] - Startup probe for required external tools

pub mod deploy;
pub mod runner;
pub mod simctl;
pub mod tools;

// Public API re-exports
pub use deploy::{Debugserver, DeviceBackend};
pub use runner::{
    exec, exec_streaming, exec_streaming_lines, repair_concatenated_json, CancelHandle,
    CancelToken, ExecOutput, ExecStream, JsonObjectScanner, JsonStream, LineStream, ProcessHandle,
};
pub use simctl::SimulatorBackend;
pub use tools::ToolAvailability;
