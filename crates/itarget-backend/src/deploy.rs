//! Physical device backend using ios-deploy
//!
//! Lists, validates, installs to, launches on, and starts debugservers for
//! physical devices by driving the `ios-deploy` CLI. Devices reached through
//! a remote companion relay get a usbmuxd-override environment injected into
//! every invocation; the environment is always derived from the device's own
//! source, never shared across calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;

use itarget_core::prelude::*;
use itarget_core::{parse_deploy_event, DeployEvent, DetectedDevice, Device, TargetSource};

use crate::runner::{
    exec, exec_streaming, exec_streaming_lines, repair_concatenated_json, CancelToken,
    ProcessHandle,
};

/// Environment variable redirecting the tool's usbmuxd transport.
const USBMUXD_OVERRIDE: &str = "USBMUXD_OVERRIDE";
/// Environment variable injecting the override library into the tool.
const DYLD_INSERT_LIBRARIES: &str = "DYLD_INSERT_LIBRARIES";

/// A started debugserver: the listening port and the handle of the process
/// that must stay alive while a debugger is attached.
#[derive(Debug)]
pub struct Debugserver {
    pub port: u16,
    pub handle: ProcessHandle,
}

/// Backend for physical device targets.
#[derive(Debug, Clone)]
pub struct DeviceBackend {
    tool: PathBuf,
    override_dylib: Option<PathBuf>,
    companion_socket: Arc<Mutex<Option<String>>>,
}

impl DeviceBackend {
    /// Locate `ios-deploy` on PATH, falling back to the bare name so spawn
    /// errors stay descriptive when the tool is missing.
    pub fn new() -> Self {
        let tool = which::which("ios-deploy").unwrap_or_else(|_| PathBuf::from("ios-deploy"));
        debug!("Using deployment tool: {}", tool.display());
        Self {
            tool,
            override_dylib: None,
            companion_socket: Arc::new(Mutex::new(None)),
        }
    }

    /// Use an explicit deployment tool binary.
    pub fn with_tool(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool: tool.into(),
            override_dylib: None,
            companion_socket: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the usbmuxd-override library injected for companion devices.
    pub fn override_dylib(mut self, path: impl Into<PathBuf>) -> Self {
        self.override_dylib = Some(path.into());
        self
    }

    /// Update the companion relay's usbmuxd socket path. `None` makes the
    /// companion source unavailable again.
    pub fn set_companion_socket_path(&self, path: Option<String>) {
        *self
            .companion_socket
            .lock()
            .expect("companion socket lock poisoned") = path;
    }

    fn companion_socket_path(&self) -> Option<String> {
        self.companion_socket
            .lock()
            .expect("companion socket lock poisoned")
            .clone()
    }

    fn source_available(&self, source: TargetSource) -> bool {
        match source {
            TargetSource::Local => true,
            TargetSource::Companion => {
                self.override_dylib
                    .as_ref()
                    .map(|p| p.exists())
                    .unwrap_or(false)
                    && self.companion_socket_path().is_some()
            }
        }
    }

    /// Process environment for commands issued against a device of the given
    /// source. Companion commands carry the socket override and the library
    /// injection pair; local commands carry nothing extra.
    fn env_for(&self, source: TargetSource) -> Result<Vec<(String, String)>> {
        if !self.source_available(source) {
            return Err(Error::source_unavailable(source));
        }

        match source {
            TargetSource::Local => Ok(Vec::new()),
            TargetSource::Companion => {
                let socket = self
                    .companion_socket_path()
                    .ok_or_else(|| Error::source_unavailable(source))?;
                let dylib = self
                    .override_dylib
                    .as_ref()
                    .ok_or_else(|| Error::source_unavailable(source))?;
                Ok(vec![
                    (USBMUXD_OVERRIDE.to_string(), socket),
                    (
                        DYLD_INSERT_LIBRARIES.to_string(),
                        dylib.to_string_lossy().into_owned(),
                    ),
                ])
            }
        }
    }

    /// List connected devices for one source. Unavailable sources and tool
    /// failures (tool missing, no devices attached) yield an empty list.
    pub async fn list(&self, source: TargetSource) -> Vec<Device> {
        if !self.source_available(source) {
            return Vec::new();
        }
        let envs = match self.env_for(source) {
            Ok(envs) => envs,
            Err(_) => return Vec::new(),
        };

        info!(
            "Listing devices using {}, source {}",
            self.tool.display(),
            source
        );

        let args = string_args(&["--detect", "--timeout", "1", "--json"]);
        match exec(&self.tool, &args, &envs).await {
            Ok(output) => {
                let devices = devices_from_detect_output(&output.stdout, source);
                info!("Found {} devices for source {}", devices.len(), source);
                devices
            }
            Err(e) => {
                debug!(
                    "Could not find any connected device for source {}: {}",
                    source, e
                );
                Vec::new()
            }
        }
    }

    /// Check whether the device is still reachable. Resolves true as soon as
    /// the detect probe reports the udid, false when the probe exits without
    /// finding it; spawn failures propagate.
    pub async fn is_valid(&self, device: &Device) -> Result<bool> {
        debug!("Checking if device (udid: {}) is still valid", device.udid);

        let envs = self.env_for(device.source)?;
        let args = string_args(&["--detect", "--timeout", "1"]);
        let mut stream = exec_streaming_lines(&self.tool, &args, &envs)?;

        while let Some(line) = stream.next().await {
            if let Some(udid) = parse_detected_udid(&line) {
                debug!("Found device with udid: {}", udid);
                if udid == device.udid {
                    stream.cancel_handle().cancel();
                    return Ok(true);
                }
            }
        }

        // Probe exited without reporting our udid; exit status is irrelevant.
        let _ = stream.wait().await;
        Ok(false)
    }

    /// Install an app bundle, streaming progress events to `on_progress` and
    /// returning the installed path on the device.
    pub async fn install(
        &self,
        device: &Device,
        bundle_path: &Path,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(&DeployEvent),
    ) -> Result<String> {
        info!(
            "Installing app (path: {}) on device (udid: {})",
            bundle_path.display(),
            device.udid
        );

        let envs = self.env_for(device.source)?;
        let deltas_dir = std::env::temp_dir();
        let args = vec![
            "--id".to_string(),
            device.udid.clone(),
            "--faster-path-search".to_string(),
            "--timeout".to_string(),
            "3".to_string(),
            "--bundle".to_string(),
            bundle_path.to_string_lossy().into_owned(),
            "--app_deltas".to_string(),
            deltas_dir.to_string_lossy().into_owned(),
            "--json".to_string(),
        ];

        let mut stream = exec_streaming(&self.tool, &args, &envs)?;
        cancel.arm(stream.cancel_handle());

        let mut install_path: Option<String> = None;
        while let Some(value) = stream.next().await {
            let event = parse_deploy_event(value);
            if let DeployEvent::BundleInstall { status, path, .. } = &event {
                if status == "Complete" {
                    install_path = path.clone();
                }
            }
            on_progress(&event);
        }

        stream.wait().await?;

        let path = install_path
            .ok_or_else(|| Error::install_failed(&device.udid, "no install completion event"))?;
        info!("Installed at device path: {}", path);
        Ok(path)
    }

    /// Launch an already-installed app and detach, returning its pid.
    pub async fn launch(
        &self,
        device: &Device,
        bundle_path: &Path,
        app_args: &[String],
        app_env: &HashMap<String, String>,
    ) -> Result<u32> {
        info!(
            "Launching app (path: {}) on device (udid: {})",
            bundle_path.display(),
            device.udid
        );

        let envs = self.env_for(device.source)?;
        let mut args = vec![
            "--id".to_string(),
            device.udid.clone(),
            "--faster-path-search".to_string(),
            "--timeout".to_string(),
            "3".to_string(),
            "--bundle".to_string(),
            bundle_path.to_string_lossy().into_owned(),
            "--justlaunch".to_string(),
            "--noinstall".to_string(),
        ];
        if !app_args.is_empty() {
            args.push("--args".to_string());
            args.push(app_args.join(" "));
        }
        if !app_env.is_empty() {
            let joined = app_env
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join(" ");
            args.push("--envs".to_string());
            args.push(joined);
        }

        let output = exec(&self.tool, &args, &envs).await?;

        let bundle = bundle_path.to_string_lossy();
        parse_detached_pid(&output.stdout)
            .ok_or_else(|| Error::launch_failed(bundle.into_owned(), &device.udid))
    }

    /// Start a debugserver on the device and resolve the port it listens on.
    /// The underlying process keeps running; the returned handle owns its
    /// lifetime.
    pub async fn debugserver(
        &self,
        device: &Device,
        cancel: &CancelToken,
        mut on_progress: impl FnMut(&DeployEvent),
    ) -> Result<Debugserver> {
        info!("Starting debugserver for device (udid: {})", device.udid);

        let envs = self.env_for(device.source)?;
        let args = vec![
            "--id".to_string(),
            device.udid.clone(),
            "--nolldb".to_string(),
            "--faster-path-search".to_string(),
            "--json".to_string(),
        ];

        let mut stream = exec_streaming(&self.tool, &args, &envs)?;
        cancel.arm(stream.cancel_handle());

        let mut port: Option<u16> = None;
        while let Some(value) = stream.next().await {
            match parse_deploy_event(value) {
                DeployEvent::DebugServerLaunched { port: p } => {
                    port = Some(p);
                    break;
                }
                event => on_progress(&event),
            }
        }

        match port {
            Some(port) => {
                info!("Debugserver listening on port {}", port);
                Ok(Debugserver {
                    port,
                    handle: stream.into_handle(),
                })
            }
            None => {
                // The stream ended without a launch event; surface the tool's
                // failure if it had one, otherwise a typed failure.
                stream.wait().await?;
                Err(Error::debugserver_failed(&device.udid))
            }
        }
    }

    /// Path of an installed app on the device, or `None` when the bundle id
    /// is not installed.
    pub async fn get_app_device_path(
        &self,
        device: &Device,
        bundle_id: &str,
    ) -> Result<Option<String>> {
        debug!(
            "Getting path for app (bundle id: {}) on device (udid: {})",
            bundle_id, device.udid
        );

        let envs = self.env_for(device.source)?;
        let args = vec![
            "--id".to_string(),
            device.udid.clone(),
            "--list_bundle_id".to_string(),
            "--json".to_string(),
            "-k".to_string(),
            "Path".to_string(),
        ];

        let mut stream = exec_streaming(&self.tool, &args, &envs)?;

        let mut path: Option<String> = None;
        while let Some(value) = stream.next().await {
            if let DeployEvent::ListBundleId { apps } = parse_deploy_event(value) {
                path = apps.get(bundle_id).and_then(|app| app.path.clone());
            }
        }

        stream.wait().await?;

        debug!("App device path: {:?}", path);
        Ok(path)
    }

    /// Pid of a running app on the device. A negative reported pid or a
    /// missing lookup event both mean the app is not running.
    pub async fn get_pid_for(&self, device: &Device, bundle_id: &str) -> Result<u32> {
        debug!(
            "Getting pid for app (bundle id: {}) on device (udid: {})",
            bundle_id, device.udid
        );

        let envs = self.env_for(device.source)?;
        let args = vec![
            "--id".to_string(),
            device.udid.clone(),
            "--faster-path-search".to_string(),
            "--timeout".to_string(),
            "3".to_string(),
            "--get_pid".to_string(),
            "--bundle_id".to_string(),
            bundle_id.to_string(),
            "--json".to_string(),
        ];

        let mut stream = exec_streaming(&self.tool, &args, &envs)?;

        let mut pid: Option<i64> = None;
        while let Some(value) = stream.next().await {
            if let DeployEvent::GetPid { pid: p } = parse_deploy_event(value) {
                pid = Some(p);
            }
        }

        stream.wait().await?;

        match pid {
            Some(pid) if pid >= 0 => Ok(pid as u32),
            _ => Err(Error::pid_not_found(bundle_id)),
        }
    }
}

impl Default for DeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn string_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Extract the udid from a detect probe line like
/// `[....] Found 00008101-... (N841AP, iPhone 13 Pro, iphoneos, arm64e) ...`.
fn parse_detected_udid(line: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^\[....\] Found (.*?) \(").expect("detect pattern must compile")
    });
    re.captures(line)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

/// Match the `Process <pid> detached` line printed after a launch.
fn parse_detached_pid(stdout: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?m)^Process (\d+) detached$").expect("detach pattern must compile")
    });
    re.captures(stdout)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Map buffered `--detect --json` output (concatenated objects) to devices.
fn devices_from_detect_output(stdout: &str, source: TargetSource) -> Vec<Device> {
    let repaired = repair_concatenated_json(stdout);
    let values: Vec<serde_json::Value> = match serde_json::from_str(&repaired) {
        Ok(values) => values,
        Err(e) => {
            warn!("Could not parse detect output: {}", e);
            return Vec::new();
        }
    };

    values
        .into_iter()
        .filter_map(|value| match parse_deploy_event(value) {
            DeployEvent::DeviceDetected { device } => Some(device_from_detected(device, source)),
            _ => None,
        })
        .collect()
}

fn device_from_detected(detected: DetectedDevice, source: TargetSource) -> Device {
    Device {
        udid: detected.device_identifier,
        name: detected.device_name,
        runtime: format!("iOS {}", detected.product_version),
        version: detected.product_version,
        build_version: detected.build_version,
        sdk: "iphoneos".to_string(),
        model_name: detected.model_name,
        source,
    }
}
