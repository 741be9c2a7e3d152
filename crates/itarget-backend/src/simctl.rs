//! iOS simulator backend using xcrun simctl
//!
//! Lists, boots, shuts down, installs to, and launches apps on simulators by
//! driving the `xcrun simctl` CLI and parsing its JSON/text output.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;

use serde::Deserialize;

use itarget_core::prelude::*;
use itarget_core::{LaunchParams, Simulator, SimulatorState};

use crate::runner::exec;

const SIMCTL_RUNTIME_PREFIX: &str = "com.apple.CoreSimulator.SimRuntime.";

/// Stderr marker for a boot request against an already-booted simulator.
const ALREADY_BOOTED: &str = "Unable to boot device in current state: Booted";
/// Stderr marker for a shutdown request against an already-shut-down simulator.
const ALREADY_SHUTDOWN: &str = "Unable to shutdown device in current state: Shutdown";

/// Backend for simulator targets.
#[derive(Debug, Clone)]
pub struct SimulatorBackend {
    tool: PathBuf,
}

impl SimulatorBackend {
    pub fn new() -> Self {
        Self::with_tool("xcrun")
    }

    /// Use an explicit binary in place of `xcrun`.
    pub fn with_tool(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    async fn simctl(&self, args: &[String]) -> Result<String> {
        let mut full = vec!["simctl".to_string()];
        full.extend_from_slice(args);
        exec(&self.tool, &full, &[]).await.map(|output| output.stdout)
    }

    /// List available iOS simulators, newest runtime first.
    ///
    /// Listing failures are logged and yield an empty list; a missing
    /// simulator runtime must never break target resolution for devices.
    pub async fn list(&self) -> Vec<Simulator> {
        match self.try_list().await {
            Ok(simulators) => {
                info!("Found {} simulators", simulators.len());
                simulators
            }
            Err(e) => {
                warn!("Could not list simulators: {}", e);
                Vec::new()
            }
        }
    }

    async fn try_list(&self) -> Result<Vec<Simulator>> {
        let stdout = self.simctl(&["list".to_string(), "--json".to_string()]).await?;
        parse_simulator_list(&stdout)
    }

    /// Check whether the simulator still exists, ignoring runtime
    /// availability. False on any CLI failure.
    pub async fn is_valid(&self, simulator: &Simulator) -> bool {
        debug!(
            "Checking if simulator (udid: {}) is still valid",
            simulator.udid
        );

        let stdout = match self
            .simctl(&[
                "list".to_string(),
                "devices".to_string(),
                "--json".to_string(),
            ])
            .await
        {
            Ok(stdout) => stdout,
            Err(e) => {
                warn!("Could not list simulator devices: {}", e);
                return false;
            }
        };

        match parse_available_udids(&stdout) {
            Ok(udids) => udids.iter().any(|udid| udid == &simulator.udid),
            Err(e) => {
                warn!("Could not parse simulator device list: {}", e);
                false
            }
        }
    }

    /// Boot the simulator. Booting an already-booted simulator succeeds.
    pub async fn boot(&self, simulator: &Simulator) -> Result<()> {
        info!("Booting simulator (udid: {})", simulator.udid);

        match self
            .simctl(&["boot".to_string(), simulator.udid.clone()])
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { stderr, .. }) if stderr.contains(ALREADY_BOOTED) => {
                debug!("Simulator already booted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Shut the simulator down. Already shut down is not an error.
    pub async fn shutdown(&self, simulator: &Simulator) -> Result<()> {
        info!("Shutting down simulator (udid: {})", simulator.udid);

        match self
            .simctl(&["shutdown".to_string(), simulator.udid.clone()])
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed { stderr, .. }) if stderr.contains(ALREADY_SHUTDOWN) => {
                debug!("Simulator already shut down");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Install an app bundle on the simulator.
    pub async fn install(&self, simulator: &Simulator, bundle_path: &Path) -> Result<()> {
        info!(
            "Installing app (path: {}) on simulator (udid: {})",
            bundle_path.display(),
            simulator.udid
        );

        self.simctl(&[
            "install".to_string(),
            simulator.udid.clone(),
            bundle_path.to_string_lossy().into_owned(),
        ])
        .await?;

        Ok(())
    }

    /// Launch an installed app, terminating any already-running instance
    /// first. Returns the pid of the launched process.
    ///
    /// App environment variables travel through simctl's child-environment
    /// convention (`SIMCTL_CHILD_` prefix). With `wait_for_debugger` the
    /// process starts suspended until a debugger attaches.
    pub async fn launch(
        &self,
        simulator: &Simulator,
        bundle_id: &str,
        params: &LaunchParams,
    ) -> Result<u32> {
        info!(
            "Launching app (bundle id: {}) on simulator (udid: {})",
            bundle_id, simulator.udid
        );

        let mut args = vec![
            "launch".to_string(),
            "--terminate-running-process".to_string(),
        ];
        if params.wait_for_debugger {
            args.push("--wait-for-debugger".to_string());
        }
        if let Some(path) = &params.stdout_path {
            args.push(format!("--stdout={}", path.display()));
        }
        if let Some(path) = &params.stderr_path {
            args.push(format!("--stderr={}", path.display()));
        }
        args.push(simulator.udid.clone());
        args.push(bundle_id.to_string());
        args.extend(params.args.iter().cloned());

        let envs: Vec<(String, String)> = params
            .env
            .iter()
            .map(|(key, value)| (format!("SIMCTL_CHILD_{}", key), value.clone()))
            .collect();

        let mut full = vec!["simctl".to_string()];
        full.extend(args);
        let output = exec(&self.tool, &full, &envs).await?;

        parse_launch_pid(&output.stdout, bundle_id)
            .ok_or_else(|| Error::launch_failed(bundle_id, &simulator.udid))
    }

    /// Look up the pid of a running app via the simulator's service manager.
    pub async fn get_pid_for(&self, simulator: &Simulator, bundle_id: &str) -> Result<u32> {
        debug!(
            "Getting pid for app (bundle id: {}) on simulator (udid: {})",
            bundle_id, simulator.udid
        );

        let stdout = self
            .simctl(&[
                "spawn".to_string(),
                simulator.udid.clone(),
                "launchctl".to_string(),
                "list".to_string(),
            ])
            .await?;

        parse_launchctl_pid(&stdout, bundle_id).ok_or_else(|| Error::pid_not_found(bundle_id))
    }
}

impl Default for SimulatorBackend {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────
// simctl JSON output model
// ─────────────────────────────────────────────────────────

/// JSON output from `xcrun simctl list --json`
#[derive(Debug, Deserialize)]
struct SimctlList {
    #[serde(default)]
    runtimes: Vec<SimctlRuntime>,
    #[serde(default)]
    devices: HashMap<String, Vec<SimctlDevice>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimctlRuntime {
    identifier: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    buildversion: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_available: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimctlDevice {
    udid: String,
    name: String,
    #[serde(default)]
    data_path: String,
    #[serde(default)]
    log_path: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    is_available: bool,
}

/// Runtime metadata resolved either from the runtimes listing or, for a
/// runtime that is no longer available, derived from its identifier.
struct RuntimeMeta {
    name: String,
    version: String,
    build_version: String,
}

fn runtime_meta<'a>(
    identifier: &str,
    available: &'a HashMap<String, RuntimeMeta>,
) -> Option<&'a RuntimeMeta> {
    available.get(identifier)
}

/// Derive runtime metadata from an identifier like
/// `com.apple.CoreSimulator.SimRuntime.iOS-17-2`. A simulator can be booted
/// on a runtime whose metadata was removed; its devices are still listed, so
/// name and version come from the identifier and the build stays empty.
fn runtime_meta_from_identifier(identifier: &str) -> RuntimeMeta {
    let suffix = identifier
        .strip_prefix(SIMCTL_RUNTIME_PREFIX)
        .unwrap_or(identifier);

    if let Some((os_name, version)) = suffix.split_once('-') {
        let version = version.replace('-', ".");
        RuntimeMeta {
            name: format!("{} {}", os_name, version),
            version,
            build_version: String::new(),
        }
    } else {
        RuntimeMeta {
            name: suffix.to_string(),
            version: String::new(),
            build_version: String::new(),
        }
    }
}

fn parse_simulator_list(json: &str) -> Result<Vec<Simulator>> {
    let list: SimctlList = serde_json::from_str(json)?;

    let available: HashMap<String, RuntimeMeta> = list
        .runtimes
        .into_iter()
        .filter(|r| r.is_available)
        .map(|r| {
            (
                r.identifier,
                RuntimeMeta {
                    name: r.name,
                    version: r.version,
                    build_version: r.buildversion,
                },
            )
        })
        .collect();

    let mut simulators = Vec::new();
    for (runtime_identifier, devices) in list.devices {
        let fallback;
        let meta = match runtime_meta(&runtime_identifier, &available) {
            Some(meta) => meta,
            None => {
                fallback = runtime_meta_from_identifier(&runtime_identifier);
                &fallback
            }
        };

        for device in devices.into_iter().filter(|d| d.is_available) {
            simulators.push(Simulator {
                udid: device.udid,
                name: device.name,
                version: meta.version.clone(),
                build_version: meta.build_version.clone(),
                runtime: meta.name.clone(),
                sdk: "iphonesimulator".to_string(),
                data_path: device.data_path,
                log_path: device.log_path,
                state: SimulatorState::from(device.state.as_str()),
            });
        }
    }

    simulators.retain(|s| s.runtime.starts_with("iOS"));
    simulators.sort_by(|a, b| {
        natural_cmp(&b.runtime, &a.runtime).then_with(|| natural_cmp(&a.name, &b.name))
    });

    Ok(simulators)
}

/// Udids of available devices from `simctl list devices --json`, regardless
/// of whether their runtime is still installed.
fn parse_available_udids(json: &str) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct DevicesOnly {
        #[serde(default)]
        devices: HashMap<String, Vec<SimctlDevice>>,
    }

    let list: DevicesOnly = serde_json::from_str(json)?;
    Ok(list
        .devices
        .into_values()
        .flatten()
        .filter(|d| d.is_available)
        .map(|d| d.udid)
        .collect())
}

/// Parse the `<bundleId>: <pid>` response printed by `simctl launch`.
fn parse_launch_pid(stdout: &str, bundle_id: &str) -> Option<u32> {
    let prefix = format!("{}: ", bundle_id);
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(&prefix))
        .and_then(|rest| rest.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}

/// Find the app's pid in `launchctl list` output. Rows look like
/// `PID\tStatus\tLabel`, with app services labelled
/// `UIKitApplication:<bundleId>[...]`; the pid column is `-` when the
/// service is not running.
fn parse_launchctl_pid(stdout: &str, bundle_id: &str) -> Option<u32> {
    let needle = format!("UIKitApplication:{}[", bundle_id);
    stdout
        .lines()
        .find(|line| line.contains(&needle))
        .and_then(|line| line.split_whitespace().next())
        .and_then(|pid| pid.parse::<u32>().ok())
}

// ─────────────────────────────────────────────────────────
// Numeric-aware string ordering
// ─────────────────────────────────────────────────────────

/// Compare strings treating digit runs as numbers, so "iOS 9.3" sorts before
/// "iOS 10.2" and "iPhone 8" before "iPhone 11".
fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ca = a.chars().peekable();
    let mut cb = b.chars().peekable();

    loop {
        match (ca.peek().copied(), cb.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                match take_number(&mut ca).cmp(&take_number(&mut cb)) {
                    Ordering::Equal => {}
                    ord => return ord,
                }
            }
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => {
                    ca.next();
                    cb.next();
                }
                ord => return ord,
            },
        }
    }
}

fn take_number(chars: &mut Peekable<Chars>) -> u64 {
    let mut n: u64 = 0;
    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
        n = n.saturating_mul(10).saturating_add(digit as u64);
        chars.next();
    }
    n
}
