//! Unified target registry
//!
//! Merges device and simulator listings into one polymorphic target list and
//! answers validity checks through a short-lived positive cache. Validity is
//! probed on every debug-launch resolution; without the cache each resolution
//! would re-run the external tools and add user-visible latency.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use itarget_backend::{DeviceBackend, SimulatorBackend};
use itarget_core::prelude::*;
use itarget_core::{Device, Simulator, Target, TargetSource};

/// How long a confirmed validity result is trusted for the same udid.
const VALIDITY_TTL: Duration = Duration::from_secs(10);

/// Listing and validity seam for simulator targets.
#[trait_variant::make(SimulatorApi: Send)]
pub trait LocalSimulatorApi {
    async fn list(&self) -> Vec<Simulator>;
    async fn is_valid(&self, simulator: &Simulator) -> bool;
}

/// Listing and validity seam for device targets.
#[trait_variant::make(DeviceApi: Send)]
pub trait LocalDeviceApi {
    async fn list(&self, source: TargetSource) -> Vec<Device>;
    async fn is_valid(&self, device: &Device) -> Result<bool>;
}

impl SimulatorApi for SimulatorBackend {
    async fn list(&self) -> Vec<Simulator> {
        SimulatorBackend::list(self).await
    }

    async fn is_valid(&self, simulator: &Simulator) -> bool {
        SimulatorBackend::is_valid(self, simulator).await
    }
}

impl DeviceApi for DeviceBackend {
    async fn list(&self, source: TargetSource) -> Vec<Device> {
        DeviceBackend::list(self, source).await
    }

    async fn is_valid(&self, device: &Device) -> Result<bool> {
        DeviceBackend::is_valid(self, device).await
    }
}

/// Last confirmed-valid target. Only positive results are remembered; a
/// device that disappears and reconnects within the TTL window must not be
/// masked by a stale negative.
#[derive(Debug)]
struct ValidityEntry {
    udid: String,
    checked_at: Instant,
}

/// Registry over both backends.
pub struct TargetRegistry<S = SimulatorBackend, D = DeviceBackend> {
    simulators: S,
    devices: D,
    validity_ttl: Duration,
    last_valid: Mutex<Option<ValidityEntry>>,
}

impl<S: SimulatorApi, D: DeviceApi> TargetRegistry<S, D> {
    pub fn new(simulators: S, devices: D) -> Self {
        Self::with_validity_ttl(simulators, devices, VALIDITY_TTL)
    }

    pub fn with_validity_ttl(simulators: S, devices: D, validity_ttl: Duration) -> Self {
        Self {
            simulators,
            devices,
            validity_ttl,
            last_valid: Mutex::new(None),
        }
    }

    /// List all known targets: local devices, companion devices, simulators.
    ///
    /// The three listings are independent and only fan out concurrently for
    /// latency; ordering across kinds is a presentation concern of the
    /// caller.
    pub async fn list_targets(&self) -> Vec<Target> {
        let (local, companion, simulators) = tokio::join!(
            self.devices.list(TargetSource::Local),
            self.devices.list(TargetSource::Companion),
            self.simulators.list(),
        );

        local
            .into_iter()
            .map(Target::Device)
            .chain(companion.into_iter().map(Target::Device))
            .chain(simulators.into_iter().map(Target::Simulator))
            .collect()
    }

    /// Resolve a target by udid from a fresh listing. Zero matches, and
    /// defensively more than one, both come back as `None`.
    pub async fn get_target(&self, udid: &str) -> Option<Target> {
        let mut matches: Vec<Target> = self
            .list_targets()
            .await
            .into_iter()
            .filter(|target| target.udid() == udid)
            .collect();

        match matches.len() {
            1 => matches.pop(),
            0 => None,
            n => {
                warn!("Found {} targets for udid {}, treating as none", n, udid);
                None
            }
        }
    }

    /// Check whether the target still exists, trusting a recent positive
    /// check for the same udid. Any miss discards the cache before the
    /// backend probe; only a confirmed result re-creates it.
    pub async fn is_valid(&self, target: &Target) -> bool {
        {
            let mut last = self.last_valid.lock().expect("validity cache lock poisoned");
            if let Some(entry) = last.as_ref() {
                if entry.udid == target.udid() && entry.checked_at.elapsed() < self.validity_ttl {
                    return true;
                }
            }
            *last = None;
        }

        let valid = match target {
            Target::Simulator(simulator) => self.simulators.is_valid(simulator).await,
            Target::Device(device) => match self.devices.is_valid(device).await {
                Ok(valid) => valid,
                Err(e) => {
                    warn!("Device validity check failed: {}", e);
                    false
                }
            },
        };

        if valid {
            *self.last_valid.lock().expect("validity cache lock poisoned") =
                Some(ValidityEntry {
                    udid: target.udid().to_string(),
                    checked_at: Instant::now(),
                });
        }

        valid
    }
}
