//! Debuggable target types
//!
//! A [`Target`] is one debuggable endpoint, either a [`Simulator`] managed by
//! the CoreSimulator runtime or a physical [`Device`] reached over usbmuxd.
//! The serialized form matches the record persisted for the selected target,
//! discriminated by a `"type"` tag.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Transport used to reach a physical device.
///
/// `Local` devices are attached to this host. `Companion` devices are relayed
/// through a remote companion process; every external command issued for them
/// must carry the usbmuxd-override environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSource {
    Local,
    Companion,
}

impl std::fmt::Display for TargetSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetSource::Local => write!(f, "local"),
            TargetSource::Companion => write!(f, "companion"),
        }
    }
}

/// Simulator runtime state, as reported by the simulator-control CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulatorState {
    Booted,
    Shutdown,
}

impl From<&str> for SimulatorState {
    fn from(s: &str) -> Self {
        // The CLI reports transient states ("Booting", "Shutting Down") too;
        // anything not fully booted is treated as shut down.
        match s {
            "Booted" => SimulatorState::Booted,
            _ => SimulatorState::Shutdown,
        }
    }
}

/// An iOS simulator target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Simulator {
    pub udid: String,
    pub name: String,
    /// OS version, e.g. "17.2"
    pub version: String,
    pub build_version: String,
    /// Runtime display name, e.g. "iOS 17.2"
    pub runtime: String,
    pub sdk: String,
    /// Data directory owned by the simulator runtime
    pub data_path: String,
    /// Log directory owned by the simulator runtime
    pub log_path: String,
    pub state: SimulatorState,
}

/// A physical iOS device target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub udid: String,
    pub name: String,
    pub version: String,
    pub build_version: String,
    pub runtime: String,
    pub sdk: String,
    pub model_name: String,
    pub source: TargetSource,
}

/// A debuggable endpoint: a simulator or a physical device.
///
/// Tagged union keyed by `type` so the persisted record round-trips, and so
/// every consumption site matches exhaustively on the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Target {
    Simulator(Simulator),
    Device(Device),
}

impl Target {
    pub fn udid(&self) -> &str {
        match self {
            Target::Simulator(s) => &s.udid,
            Target::Device(d) => &d.udid,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Target::Simulator(s) => &s.name,
            Target::Device(d) => &d.name,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Target::Simulator(s) => &s.version,
            Target::Device(d) => &d.version,
        }
    }

    pub fn build_version(&self) -> &str {
        match self {
            Target::Simulator(s) => &s.build_version,
            Target::Device(d) => &d.build_version,
        }
    }

    pub fn runtime(&self) -> &str {
        match self {
            Target::Simulator(s) => &s.runtime,
            Target::Device(d) => &d.runtime,
        }
    }

    /// Platform SDK identifier: "iphonesimulator" or "iphoneos"
    pub fn sdk(&self) -> &str {
        match self {
            Target::Simulator(s) => &s.sdk,
            Target::Device(d) => &d.sdk,
        }
    }

    /// Variant name for display: "Simulator" or "Device"
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Simulator(_) => "Simulator",
            Target::Device(_) => "Device",
        }
    }
}

impl From<Simulator> for Target {
    fn from(simulator: Simulator) -> Self {
        Target::Simulator(simulator)
    }
}

impl From<Device> for Target {
    fn from(device: Device) -> Self {
        Target::Device(device)
    }
}

/// Parameters for launching an installed app on a target.
#[derive(Debug, Clone, Default)]
pub struct LaunchParams {
    /// Command line arguments passed to the app process
    pub args: Vec<String>,
    /// Environment variables set for the app process
    pub env: HashMap<String, String>,
    /// Redirect the app's stdout to this path
    pub stdout_path: Option<PathBuf>,
    /// Redirect the app's stderr to this path
    pub stderr_path: Option<PathBuf>,
    /// Start the process suspended, waiting for a debugger to attach
    pub wait_for_debugger: bool,
}
