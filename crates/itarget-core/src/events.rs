//! Deployment tool event model
//!
//! The device-deployment tool reports progress as a stream of JSON objects on
//! stdout, one object per event, discriminated by an `Event` key. This module
//! parses those objects into typed events, falling back to
//! [`DeployEvent::Unknown`] for event names or shapes we do not recognize.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

/// Device description attached to a `DeviceDetected` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetectedDevice {
    pub device_identifier: String,
    pub device_name: String,
    #[serde(default)]
    pub product_version: String,
    #[serde(default)]
    pub build_version: String,
    #[serde(default, rename = "modelName")]
    pub model_name: String,
}

/// An installed app entry from a `ListBundleId` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstalledApp {
    #[serde(default, rename = "CFBundleIdentifier")]
    pub bundle_identifier: String,
    #[serde(rename = "Path")]
    pub path: Option<String>,
}

/// A parsed deployment tool event.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployEvent {
    /// A connected device was detected
    DeviceDetected { device: DetectedDevice },
    /// A file is being copied into the staging area during install
    BundleCopy { overall_percent: i64, path: String },
    /// Install phase progress; `status` is "Complete" on the final event
    BundleInstall {
        overall_percent: i64,
        status: String,
        path: Option<String>,
    },
    /// The debugserver stub was started and is listening on `port`
    DebugServerLaunched { port: u16 },
    /// Installed-bundle listing, keyed by bundle id
    ListBundleId {
        apps: HashMap<String, InstalledApp>,
    },
    /// Pid lookup result; negative when the app is not running
    GetPid { pid: i64 },
    /// Anything else the tool may emit
    Unknown { event: String, params: Value },
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceDetectedParams {
    device: DetectedDevice,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BundleCopyParams {
    #[serde(default)]
    overall_percent: i64,
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BundleInstallParams {
    #[serde(default)]
    overall_percent: i64,
    #[serde(default)]
    status: String,
    path: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DebugServerParams {
    port: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBundleIdParams {
    #[serde(default)]
    apps: HashMap<String, InstalledApp>,
}

#[derive(Deserialize)]
struct GetPidParams {
    pid: i64,
}

/// Parse one deployment tool JSON object into a typed event.
///
/// Objects without an `Event` key, and known events whose parameters fail to
/// deserialize, come back as [`DeployEvent::Unknown`] rather than an error —
/// a malformed progress event must never abort a running operation.
pub fn parse_deploy_event(value: Value) -> DeployEvent {
    let Some(event) = value.get("Event").and_then(Value::as_str) else {
        return DeployEvent::Unknown {
            event: String::new(),
            params: value,
        };
    };
    let event = event.to_string();

    match event.as_str() {
        "DeviceDetected" => serde_json::from_value(value.clone())
            .map(|p: DeviceDetectedParams| DeployEvent::DeviceDetected { device: p.device })
            .unwrap_or_else(|_| unknown_event(event, value)),
        "BundleCopy" => serde_json::from_value(value.clone())
            .map(|p: BundleCopyParams| DeployEvent::BundleCopy {
                overall_percent: p.overall_percent,
                path: p.path,
            })
            .unwrap_or_else(|_| unknown_event(event, value)),
        "BundleInstall" => serde_json::from_value(value.clone())
            .map(|p: BundleInstallParams| DeployEvent::BundleInstall {
                overall_percent: p.overall_percent,
                status: p.status,
                path: p.path,
            })
            .unwrap_or_else(|_| unknown_event(event, value)),
        "DebugServerLaunched" => serde_json::from_value(value.clone())
            .map(|p: DebugServerParams| DeployEvent::DebugServerLaunched { port: p.port })
            .unwrap_or_else(|_| unknown_event(event, value)),
        "ListBundleId" => serde_json::from_value(value.clone())
            .map(|p: ListBundleIdParams| DeployEvent::ListBundleId { apps: p.apps })
            .unwrap_or_else(|_| unknown_event(event, value)),
        "GetPid" => serde_json::from_value(value.clone())
            .map(|p: GetPidParams| DeployEvent::GetPid { pid: p.pid })
            .unwrap_or_else(|_| unknown_event(event, value)),
        _ => unknown_event(event, value),
    }
}

fn unknown_event(event: String, params: Value) -> DeployEvent {
    DeployEvent::Unknown { event, params }
}

impl DeployEvent {
    /// Short progress text suitable for forwarding to a progress callback.
    ///
    /// `bundle_path` is stripped from copy paths so the message shows the
    /// file being copied relative to the app bundle.
    pub fn progress_message(&self, bundle_path: &str) -> Option<String> {
        match self {
            DeployEvent::BundleCopy { path, .. } => {
                let rel = path
                    .strip_prefix(bundle_path)
                    .map(|p| p.trim_start_matches('/'))
                    .unwrap_or(path);
                Some(format!("Copying {}", rel))
            }
            DeployEvent::BundleInstall { status, .. } => Some(status.clone()),
            _ => None,
        }
    }

    /// Overall percentage for install progress events.
    pub fn overall_percent(&self) -> Option<i64> {
        match self {
            DeployEvent::BundleCopy {
                overall_percent, ..
            }
            | DeployEvent::BundleInstall {
                overall_percent, ..
            } => Some(*overall_percent),
            _ => None,
        }
    }
}
