//! Shared test fixtures: sample targets and counting fakes for the backend,
//! store, and picker seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use itarget_core::prelude::*;
use itarget_core::{Device, Simulator, SimulatorState, Target, TargetSource};

use crate::registry::{DeviceApi, SimulatorApi};
use crate::selection::TargetPicker;
use crate::store::SelectionStore;

pub(crate) fn sample_simulator(udid: &str) -> Simulator {
    Simulator {
        udid: udid.to_string(),
        name: format!("iPhone {}", udid),
        version: "17.2".to_string(),
        build_version: "21C62".to_string(),
        runtime: "iOS 17.2".to_string(),
        sdk: "iphonesimulator".to_string(),
        data_path: format!("/data/{}", udid),
        log_path: format!("/logs/{}", udid),
        state: SimulatorState::Shutdown,
    }
}

pub(crate) fn sample_device(udid: &str, source: TargetSource) -> Device {
    Device {
        udid: udid.to_string(),
        name: format!("iPhone {}", udid),
        version: "17.1".to_string(),
        build_version: "21B74".to_string(),
        runtime: "iOS 17.1".to_string(),
        sdk: "iphoneos".to_string(),
        model_name: "iPhone 15 Pro".to_string(),
        source,
    }
}

/// Simulator seam fake: `is_valid` reports presence in the configured list.
#[derive(Default)]
pub(crate) struct FakeSimulators {
    simulators: Vec<Simulator>,
    list_calls: AtomicUsize,
    valid_calls: AtomicUsize,
}

impl FakeSimulators {
    pub(crate) fn with_list(simulators: Vec<Simulator>) -> Self {
        Self {
            simulators,
            ..Self::default()
        }
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn valid_calls(&self) -> usize {
        self.valid_calls.load(Ordering::SeqCst)
    }
}

impl SimulatorApi for FakeSimulators {
    async fn list(&self) -> Vec<Simulator> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.simulators.clone()
    }

    async fn is_valid(&self, simulator: &Simulator) -> bool {
        self.valid_calls.fetch_add(1, Ordering::SeqCst);
        self.simulators.iter().any(|s| s.udid == simulator.udid)
    }
}

/// Device seam fake; `failing_validity()` makes `is_valid` error like a
/// failed probe spawn.
#[derive(Default)]
pub(crate) struct FakeDevices {
    local: Vec<Device>,
    companion: Vec<Device>,
    fail_validity: bool,
    valid_calls: AtomicUsize,
}

impl FakeDevices {
    pub(crate) fn with_lists(local: Vec<Device>, companion: Vec<Device>) -> Self {
        Self {
            local,
            companion,
            ..Self::default()
        }
    }

    pub(crate) fn failing_validity() -> Self {
        Self {
            fail_validity: true,
            ..Self::default()
        }
    }

    pub(crate) fn valid_calls(&self) -> usize {
        self.valid_calls.load(Ordering::SeqCst)
    }
}

impl DeviceApi for FakeDevices {
    async fn list(&self, source: TargetSource) -> Vec<Device> {
        match source {
            TargetSource::Local => self.local.clone(),
            TargetSource::Companion => self.companion.clone(),
        }
    }

    async fn is_valid(&self, device: &Device) -> Result<bool> {
        self.valid_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_validity {
            return Err(Error::spawn("probe failed"));
        }
        Ok(self
            .local
            .iter()
            .chain(self.companion.iter())
            .any(|d| d.udid == device.udid))
    }
}

/// In-memory selection store.
#[derive(Default)]
pub(crate) struct MemoryStore {
    selected: Mutex<Option<Target>>,
}

impl SelectionStore for MemoryStore {
    fn load(&self) -> Result<Option<Target>> {
        Ok(self.selected.lock().expect("store lock poisoned").clone())
    }

    fn save(&self, target: Option<&Target>) -> Result<()> {
        *self.selected.lock().expect("store lock poisoned") = target.cloned();
        Ok(())
    }
}

/// Picker fake returning a preconfigured choice.
#[derive(Default)]
pub(crate) struct FakePicker {
    choice: Option<Target>,
    calls: AtomicUsize,
}

impl FakePicker {
    pub(crate) fn choosing(target: Target) -> Self {
        Self {
            choice: Some(target),
            ..Self::default()
        }
    }

    pub(crate) fn choosing_nothing() -> Self {
        Self::default()
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TargetPicker for FakePicker {
    async fn pick(&self, _targets: Vec<Target>) -> Result<Option<Target>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.choice.clone())
    }
}
