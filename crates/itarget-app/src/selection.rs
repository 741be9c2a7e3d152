//! Target selection state
//!
//! Owns the "currently selected" target. At most one target is selected at a
//! time; it starts unset, is set by an explicit pick or a udid lookup, is
//! cleared when validation fails, and is re-set by the next successful pick.
//! Every other component reads it through this type, never directly.

use std::sync::Arc;

use tokio::sync::watch;

use itarget_backend::{DeviceBackend, SimulatorBackend};
use itarget_core::prelude::*;
use itarget_core::Target;

use crate::registry::{DeviceApi, SimulatorApi, TargetRegistry};
use crate::store::SelectionStore;

/// Interactive pick seam. The editor layer shows a quick-pick, the CLI a
/// terminal menu; either returns the chosen target or `None` when the user
/// dismisses the prompt.
#[trait_variant::make(TargetPicker: Send)]
pub trait LocalTargetPicker {
    async fn pick(&self, targets: Vec<Target>) -> Result<Option<Target>>;
}

/// Selection state over a registry, a persistence store, and a picker.
pub struct TargetSelection<St, P, S = SimulatorBackend, D = DeviceBackend> {
    registry: Arc<TargetRegistry<S, D>>,
    store: St,
    picker: P,
    changed: watch::Sender<Option<Target>>,
}

impl<St, P, S, D> TargetSelection<St, P, S, D>
where
    St: SelectionStore,
    P: TargetPicker,
    S: SimulatorApi,
    D: DeviceApi,
{
    pub fn new(registry: Arc<TargetRegistry<S, D>>, store: St, picker: P) -> Self {
        let initial = store.load().unwrap_or_else(|e| {
            warn!("Could not load selected target: {}", e);
            None
        });
        let (changed, _) = watch::channel(initial);

        Self {
            registry,
            store,
            picker,
            changed,
        }
    }

    /// Observe selection changes (e.g. for a status display).
    pub fn subscribe(&self) -> watch::Receiver<Option<Target>> {
        self.changed.subscribe()
    }

    /// The stored selection, without validation.
    pub fn selected(&self) -> Option<Target> {
        self.store.load().unwrap_or_else(|e| {
            warn!("Could not load selected target: {}", e);
            None
        })
    }

    /// Persist (or clear) the selection and notify observers. No validation
    /// happens here; validate before selecting.
    pub fn set_selected(&self, target: Option<Target>) -> Result<()> {
        self.store.save(target.as_ref())?;
        self.changed.send_replace(target);
        Ok(())
    }

    /// Run an interactive pick over a fresh listing, persisting the choice.
    pub async fn pick(&self) -> Result<Option<Target>> {
        let targets = self.registry.list_targets().await;
        let picked = self.picker.pick(targets).await?;

        if let Some(target) = &picked {
            info!("Picked target {} ({})", target.name(), target.udid());
            self.set_selected(Some(target.clone()))?;
        }

        Ok(picked)
    }

    /// Return the selected target if it is still valid; otherwise clear the
    /// selection and fall back to an interactive pick.
    pub async fn get_or_pick(&self) -> Result<Target> {
        if let Some(target) = self.selected() {
            if self.registry.is_valid(&target).await {
                return Ok(target);
            }
            debug!("Selected target {} is no longer valid", target.udid());
            self.set_selected(None)?;
        }

        self.pick().await?.ok_or(Error::NoTargetSelected)
    }

    /// Resolve a target by udid; a successful lookup implies intent to use
    /// it, so it also becomes the selection.
    pub async fn get_from_udid(&self, udid: &str) -> Result<Option<Target>> {
        let target = self.registry.get_target(udid).await;

        if let Some(target) = &target {
            self.set_selected(Some(target.clone()))?;
        }
        info!(
            "Got target for udid {}: {:?}",
            udid,
            target.as_ref().map(|t| t.name())
        );

        Ok(target)
    }
}
