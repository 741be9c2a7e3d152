//! Target command orchestration
//!
//! Composes backend primitives into the multi-step workflows behind each
//! user-facing command: boot→install, boot→launch, boot→install→launch for
//! simulators; install, launch, pid/path lookup, and debugserver start for
//! devices. Each workflow resolves its target first (explicit argument or
//! the current selection), runs its steps strictly sequentially, reports
//! progress through a caller-supplied callback, and logs failures before
//! propagating them.
//!
//! Started debugservers are tracked by port so they can be killed on
//! explicit cleanup or when this orchestrator is dropped.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use itarget_backend::{CancelToken, DeviceBackend, ProcessHandle, SimulatorBackend};
use itarget_core::prelude::*;
use itarget_core::{Device, LaunchParams, Simulator, Target};

use crate::registry::{DeviceApi, SimulatorApi};
use crate::selection::{TargetPicker, TargetSelection};
use crate::store::SelectionStore;

/// Progress reported while a workflow runs. Callbacks fire zero or more
/// times before the operation settles, never after.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// A coarse workflow step started ("Booting", "Installing app", ...)
    Step { message: String },
    /// Device install progress with a percentage delta
    Install {
        increment: i64,
        message: Option<String>,
    },
}

impl Progress {
    fn step(message: &str) -> Self {
        Progress::Step {
            message: message.to_string(),
        }
    }
}

/// Orchestrator over the two backends and the selection state.
pub struct TargetCommands<St, P, S = SimulatorBackend, D = DeviceBackend> {
    simulators: SimulatorBackend,
    devices: DeviceBackend,
    selection: Arc<TargetSelection<St, P, S, D>>,
    debugservers: Mutex<HashMap<u16, ProcessHandle>>,
}

impl<St, P, S, D> TargetCommands<St, P, S, D>
where
    St: SelectionStore,
    P: TargetPicker,
    S: SimulatorApi,
    D: DeviceApi,
{
    pub fn new(
        simulators: SimulatorBackend,
        devices: DeviceBackend,
        selection: Arc<TargetSelection<St, P, S, D>>,
    ) -> Self {
        Self {
            simulators,
            devices,
            selection,
            debugservers: Mutex::new(HashMap::new()),
        }
    }

    async fn resolve(&self, target: Option<Target>) -> Result<Target> {
        match target {
            Some(target) => Ok(target),
            None => self.selection.get_or_pick().await,
        }
    }

    async fn resolve_simulator(&self, target: Option<Target>) -> Result<Simulator> {
        match self.resolve(target).await? {
            Target::Simulator(simulator) => Ok(simulator),
            Target::Device(device) => Err(Error::target_mismatch("Simulator", device.udid)),
        }
    }

    async fn resolve_device(&self, target: Option<Target>) -> Result<Device> {
        match self.resolve(target).await? {
            Target::Device(device) => Ok(device),
            Target::Simulator(simulator) => Err(Error::target_mismatch("Device", simulator.udid)),
        }
    }

    // ─────────────────────────────────────────────────────────
    // Simulator workflows
    // ─────────────────────────────────────────────────────────

    /// Boot the simulator and install an app bundle.
    pub async fn simulator_install(
        &self,
        target: Option<Target>,
        bundle_path: &Path,
        mut progress: impl FnMut(Progress),
    ) -> Result<()> {
        let simulator = self.resolve_simulator(target).await?;

        progress(Progress::step("Booting"));
        self.simulators
            .boot(&simulator)
            .await
            .inspect_err(|e| error!("Failed to boot simulator: {}", e))?;

        progress(Progress::step("Installing app"));
        self.simulators
            .install(&simulator, bundle_path)
            .await
            .inspect_err(|e| error!("Failed to install app on simulator: {}", e))?;

        Ok(())
    }

    /// Boot the simulator and launch an installed app, returning the pid.
    pub async fn simulator_launch(
        &self,
        target: Option<Target>,
        bundle_id: &str,
        params: &LaunchParams,
        mut progress: impl FnMut(Progress),
    ) -> Result<u32> {
        let simulator = self.resolve_simulator(target).await?;

        progress(Progress::step("Booting"));
        self.simulators
            .boot(&simulator)
            .await
            .inspect_err(|e| error!("Failed to boot simulator: {}", e))?;

        progress(Progress::step("Launching app"));
        self.simulators
            .launch(&simulator, bundle_id, params)
            .await
            .inspect_err(|e| error!("Failed to launch app on simulator: {}", e))
    }

    /// Boot, install, and launch in one workflow.
    pub async fn simulator_install_and_launch(
        &self,
        target: Option<Target>,
        bundle_path: &Path,
        bundle_id: &str,
        params: &LaunchParams,
        mut progress: impl FnMut(Progress),
    ) -> Result<u32> {
        let simulator = self.resolve_simulator(target).await?;

        progress(Progress::step("Booting"));
        self.simulators
            .boot(&simulator)
            .await
            .inspect_err(|e| error!("Failed to boot simulator: {}", e))?;

        progress(Progress::step("Installing app"));
        self.simulators
            .install(&simulator, bundle_path)
            .await
            .inspect_err(|e| error!("Failed to install app on simulator: {}", e))?;

        progress(Progress::step("Launching app"));
        self.simulators
            .launch(&simulator, bundle_id, params)
            .await
            .inspect_err(|e| error!("Failed to install and launch app on simulator: {}", e))
    }

    /// Pid of a running app on the simulator.
    pub async fn simulator_get_pid(
        &self,
        target: Option<Target>,
        bundle_id: &str,
    ) -> Result<u32> {
        let simulator = self.resolve_simulator(target).await?;

        self.simulators
            .get_pid_for(&simulator, bundle_id)
            .await
            .inspect_err(|e| error!("Could not get pid on simulator: {}", e))
    }

    // ─────────────────────────────────────────────────────────
    // Device workflows
    // ─────────────────────────────────────────────────────────

    /// Install an app bundle on the device, reporting percentage progress.
    /// Returns the app's path on the device.
    pub async fn device_install(
        &self,
        target: Option<Target>,
        bundle_path: &Path,
        cancel: &CancelToken,
        mut progress: impl FnMut(Progress),
    ) -> Result<String> {
        let device = self.resolve_device(target).await?;
        let bundle = bundle_path.to_string_lossy().into_owned();

        let mut last_percent = 0i64;
        self.devices
            .install(&device, bundle_path, cancel, |event| {
                debug!("Install event: {:?}", event);
                if let Some(percent) = event.overall_percent() {
                    progress(Progress::Install {
                        increment: percent - last_percent,
                        message: event.progress_message(&bundle),
                    });
                    last_percent = percent;
                }
            })
            .await
            .inspect_err(|e| error!("Failed to install app on device: {}", e))
    }

    /// Launch an installed app on the device, returning the pid.
    pub async fn device_launch(
        &self,
        target: Option<Target>,
        bundle_path: &Path,
        params: &LaunchParams,
    ) -> Result<u32> {
        let device = self.resolve_device(target).await?;

        self.devices
            .launch(&device, bundle_path, &params.args, &params.env)
            .await
            .inspect_err(|e| error!("Failed to launch app on device: {}", e))
    }

    /// Pid of a running app on the device.
    pub async fn device_get_pid(&self, target: Option<Target>, bundle_id: &str) -> Result<u32> {
        let device = self.resolve_device(target).await?;

        self.devices
            .get_pid_for(&device, bundle_id)
            .await
            .inspect_err(|e| error!("Could not get pid on device: {}", e))
    }

    /// Path of an installed app on the device, `None` when not installed.
    pub async fn device_app_path(
        &self,
        target: Option<Target>,
        bundle_id: &str,
    ) -> Result<Option<String>> {
        let device = self.resolve_device(target).await?;

        self.devices
            .get_app_device_path(&device, bundle_id)
            .await
            .inspect_err(|e| error!("Could not get app path on device: {}", e))
    }

    /// Start a debugserver on the device and track its process by port.
    pub async fn device_debugserver(
        &self,
        target: Option<Target>,
        cancel: &CancelToken,
    ) -> Result<u16> {
        let device = self.resolve_device(target).await?;

        let debugserver = self
            .devices
            .debugserver(&device, cancel, |event| debug!("Debugserver event: {:?}", event))
            .await
            .inspect_err(|e| error!("Failed to start debugserver: {}", e))?;

        self.track_debugserver(debugserver.port, debugserver.handle);
        Ok(debugserver.port)
    }

    // ─────────────────────────────────────────────────────────
    // Debugserver lifetime bookkeeping
    // ─────────────────────────────────────────────────────────

    fn track_debugserver(&self, port: u16, handle: ProcessHandle) {
        let mut tracked = self.debugservers.lock().expect("debugserver registry poisoned");
        if let Some(old) = tracked.insert(port, handle) {
            if old.is_running() {
                warn!("Replacing tracked debugserver on port {}", port);
                old.kill();
            }
        }
    }

    /// Ports with a tracked debugserver process.
    pub fn tracked_debugserver_ports(&self) -> Vec<u16> {
        self.debugservers
            .lock()
            .expect("debugserver registry poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Kill and forget the debugserver tracked for this port. Unknown ports
    /// are a no-op.
    pub fn debugserver_cleanup(&self, port: u16) {
        info!("Cleaning up debugserver at port {}", port);

        let handle = self
            .debugservers
            .lock()
            .expect("debugserver registry poisoned")
            .remove(&port);

        if let Some(handle) = handle {
            if handle.is_running() {
                handle.kill();
            }
        }
    }

    /// Kill every tracked debugserver.
    pub fn cleanup_all(&self) {
        let tracked = std::mem::take(
            &mut *self.debugservers.lock().expect("debugserver registry poisoned"),
        );
        for (port, handle) in tracked {
            info!("Cleaning up debugserver at port {}", port);
            if handle.is_running() {
                handle.kill();
            }
        }
    }
}

impl<St, P, S, D> Drop for TargetCommands<St, P, S, D> {
    fn drop(&mut self) {
        let tracked = std::mem::take(
            &mut *self.debugservers.lock().expect("debugserver registry poisoned"),
        );
        for (port, handle) in tracked {
            debug!("Dropping orchestrator, killing debugserver at port {}", port);
            if handle.is_running() {
                handle.kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TargetRegistry;
    use crate::test_util::{
        sample_device, sample_simulator, FakeDevices, FakePicker, FakeSimulators, MemoryStore,
    };
    use itarget_backend::{exec_streaming_lines, SimulatorBackend};
    use itarget_core::TargetSource;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    type TestCommands = TargetCommands<MemoryStore, FakePicker, FakeSimulators, FakeDevices>;

    fn commands_with(
        simulators: SimulatorBackend,
        devices: DeviceBackend,
        picker: FakePicker,
    ) -> TestCommands {
        let registry = Arc::new(TargetRegistry::new(
            FakeSimulators::default(),
            FakeDevices::default(),
        ));
        let selection = Arc::new(TargetSelection::new(registry, MemoryStore::default(), picker));
        TargetCommands::new(simulators, devices, selection)
    }

    fn commands() -> TestCommands {
        commands_with(
            SimulatorBackend::new(),
            DeviceBackend::with_tool("ios-deploy"),
            FakePicker::choosing_nothing(),
        )
    }

    fn fake_tool(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-tool");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    async fn sleeper_handle() -> ProcessHandle {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        exec_streaming_lines("sh", &args, &[]).unwrap().into_handle()
    }

    #[tokio::test]
    async fn test_debugserver_cleanup_removes_and_kills() {
        let commands = commands();
        let handle = sleeper_handle().await;
        assert!(handle.is_running());

        commands.track_debugserver(5001, handle);
        assert_eq!(commands.tracked_debugserver_ports(), vec![5001]);

        commands.debugserver_cleanup(5001);
        assert!(commands.tracked_debugserver_ports().is_empty());
    }

    #[tokio::test]
    async fn test_debugserver_cleanup_unknown_port_is_noop() {
        let commands = commands();
        commands.debugserver_cleanup(6000);
        commands.debugserver_cleanup(6000);
        assert!(commands.tracked_debugserver_ports().is_empty());
    }

    #[tokio::test]
    async fn test_debugserver_cleanup_is_idempotent() {
        let commands = commands();
        commands.track_debugserver(5002, sleeper_handle().await);

        commands.debugserver_cleanup(5002);
        commands.debugserver_cleanup(5002);
        assert!(commands.tracked_debugserver_ports().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_all_drains_registry() {
        let commands = commands();
        commands.track_debugserver(5003, sleeper_handle().await);
        commands.track_debugserver(5004, sleeper_handle().await);
        assert_eq!(commands.tracked_debugserver_ports().len(), 2);

        commands.cleanup_all();
        assert!(commands.tracked_debugserver_ports().is_empty());
    }

    #[tokio::test]
    async fn test_track_replaces_existing_port_entry() {
        let commands = commands();
        commands.track_debugserver(5005, sleeper_handle().await);
        commands.track_debugserver(5005, sleeper_handle().await);
        assert_eq!(commands.tracked_debugserver_ports(), vec![5005]);
    }

    #[tokio::test]
    async fn test_simulator_op_rejects_device_target() {
        let commands = commands();
        let target: Target = sample_device("DEV-1", TargetSource::Local).into();

        let err = commands
            .simulator_get_pid(Some(target), "com.example.app")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TargetMismatch {
                expected: "Simulator",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_device_op_rejects_simulator_target() {
        let commands = commands();
        let target: Target = sample_simulator("SIM-1").into();

        let err = commands
            .device_app_path(Some(target), "com.example.app")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TargetMismatch {
                expected: "Device",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_resolution_without_selection_fails() {
        let commands = commands();
        let err = commands
            .simulator_get_pid(None, "com.example.app")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoTargetSelected));
    }

    #[tokio::test]
    async fn test_simulator_install_and_launch_workflow() {
        let dir = tempfile::tempdir().unwrap();
        // Stands in for every simctl invocation; only launch reads stdout
        let tool = fake_tool(&dir, "echo 'com.example.app: 4242'");

        let commands = commands_with(
            SimulatorBackend::with_tool(&tool),
            DeviceBackend::with_tool("ios-deploy"),
            FakePicker::choosing_nothing(),
        );

        let target: Target = sample_simulator("SIM-1").into();
        let mut steps = Vec::new();
        let pid = commands
            .simulator_install_and_launch(
                Some(target),
                Path::new("/tmp/App.app"),
                "com.example.app",
                &LaunchParams::default(),
                |progress| {
                    if let Progress::Step { message } = progress {
                        steps.push(message);
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(pid, 4242);
        assert_eq!(steps, vec!["Booting", "Installing app", "Launching app"]);
    }

    #[tokio::test]
    async fn test_simulator_workflow_aborts_on_step_failure() {
        let dir = tempfile::tempdir().unwrap();
        // Boot fails outright; install and launch must never run
        let tool = fake_tool(&dir, "echo 'Invalid device' >&2; exit 164");

        let commands = commands_with(
            SimulatorBackend::with_tool(&tool),
            DeviceBackend::with_tool("ios-deploy"),
            FakePicker::choosing_nothing(),
        );

        let target: Target = sample_simulator("SIM-1").into();
        let mut steps = Vec::new();
        let err = commands
            .simulator_install_and_launch(
                Some(target),
                Path::new("/tmp/App.app"),
                "com.example.app",
                &LaunchParams::default(),
                |progress| {
                    if let Progress::Step { message } = progress {
                        steps.push(message);
                    }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(steps, vec!["Booting"]);
    }

    #[tokio::test]
    async fn test_device_install_reports_percent_increments() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            &dir,
            r#"printf '{"Event":"BundleCopy","OverallPercent":10,"Path":"/tmp/App.app/a"}'
printf '{"Event":"BundleInstall","OverallPercent":60,"Status":"Installing","Path":null}'
printf '{"Event":"BundleInstall","OverallPercent":100,"Status":"Complete","Path":"/device/App.app"}'"#,
        );

        let commands = commands_with(
            SimulatorBackend::new(),
            DeviceBackend::with_tool(&tool),
            FakePicker::choosing_nothing(),
        );

        let target: Target = sample_device("DEV-1", TargetSource::Local).into();
        let mut increments = Vec::new();
        let mut messages = Vec::new();
        let path = commands
            .device_install(
                Some(target),
                Path::new("/tmp/App.app"),
                &CancelToken::new(),
                |progress| {
                    if let Progress::Install { increment, message } = progress {
                        increments.push(increment);
                        messages.push(message);
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(path, "/device/App.app");
        assert_eq!(increments, vec![10, 50, 40]);
        assert_eq!(messages[0].as_deref(), Some("Copying a"));
        assert_eq!(messages[1].as_deref(), Some("Installing"));
    }

    #[tokio::test]
    async fn test_device_debugserver_tracks_port() {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(
            &dir,
            r#"printf '{"Event":"DebugServerLaunched","Port":54321}'
sleep 30"#,
        );

        let commands = commands_with(
            SimulatorBackend::new(),
            DeviceBackend::with_tool(&tool),
            FakePicker::choosing_nothing(),
        );

        let target: Target = sample_device("DEV-1", TargetSource::Local).into();
        let port = commands
            .device_debugserver(Some(target), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(port, 54321);
        assert_eq!(commands.tracked_debugserver_ports(), vec![54321]);

        commands.debugserver_cleanup(port);
        assert!(commands.tracked_debugserver_ports().is_empty());
    }
}
