// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The creation-time sequence for a VM: attach its devices, then drive it to
//! its desired power state.

use std::sync::Arc;

use slog::{info, o, warn, Logger};
use thiserror::Error;
use truenas_client::Gateway;

use crate::devices::{
    AttachError, AttachedDevice, DeviceDeclaration, DeviceReconciler,
};
use crate::state::{InvalidDesiredState, TransitionRequest};
use crate::transition::{ReconcileReport, TransitionEngine};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    InvalidDesiredState(#[from] InvalidDesiredState),

    /// Attachment failed; the power state was not touched.
    #[error(transparent)]
    Attach(#[from] AttachError),
}

#[derive(Debug)]
pub struct ProvisionReport {
    pub devices: Vec<AttachedDevice>,
    pub reconcile: ReconcileReport,
}

pub struct Provisioner {
    devices: DeviceReconciler,
    engine: TransitionEngine,
    log: Logger,
}

impl Provisioner {
    pub fn new(gateway: Arc<dyn Gateway>, log: Logger) -> Self {
        Self::with_engine(
            gateway.clone(),
            TransitionEngine::new(gateway, log.clone()),
            log,
        )
    }

    /// Uses a preconfigured engine (clock, policy) for the power step.
    pub fn with_engine(
        gateway: Arc<dyn Gateway>,
        engine: TransitionEngine,
        log: Logger,
    ) -> Self {
        Self {
            devices: DeviceReconciler::new(gateway, log.clone()),
            engine,
            log,
        }
    }

    /// Attaches `declarations` to `vm_id` and then reconciles its power state
    /// toward `desired`.
    ///
    /// The desired state is validated before any device is created, and the
    /// engine only runs once every device attach has finished.
    pub async fn provision(
        &self,
        vm_id: u64,
        declarations: &[DeviceDeclaration],
        desired: &str,
    ) -> Result<ProvisionReport, ProvisionError> {
        let request = TransitionRequest::new(vm_id, desired)?;
        let log = self.log.new(o!("vm_id" => vm_id));

        let devices =
            match self.devices.attach_devices(vm_id, declarations).await {
                Ok(devices) => devices,
                Err(e) => {
                    warn!(log, "device attachment failed, skipping power state";
                          "attached" => e.attached.len(), "error" => %e);
                    return Err(e.into());
                }
            };

        info!(log, "devices attached, reconciling power state";
              "count" => devices.len(), "desired" => %request.desired);
        let reconcile = self.engine.apply(&request).await;
        Ok(ProvisionReport { devices, reconcile })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::devices::{CdromDevice, Device, NicDevice};
    use crate::state::PowerState;
    use crate::test_utils::FakeTrueNas;
    use truenas_client::api::PowerAction;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn provisioner(fake: &Arc<FakeTrueNas>) -> Provisioner {
        let clock = Arc::new(FakeClock::new());
        let engine = TransitionEngine::new(fake.clone(), test_logger())
            .with_clock(clock);
        Provisioner::with_engine(fake.clone(), engine, test_logger())
    }

    fn decls() -> Vec<DeviceDeclaration> {
        vec![
            DeviceDeclaration::new(Device::Nic(NicDevice {
                nic_attach: "br0".to_string(),
                ..Default::default()
            })),
            DeviceDeclaration::new(Device::Cdrom(CdromDevice {
                path: "/mnt/tank/iso/cloud-init.iso".to_string(),
            })),
        ]
    }

    #[tokio::test]
    async fn devices_are_attached_before_the_vm_starts() {
        let fake = Arc::new(FakeTrueNas::new(PowerState::Stopped));

        let report = provisioner(&fake)
            .provision(11, &decls(), "running")
            .await
            .unwrap();

        assert_eq!(report.devices.len(), 2);
        assert!(report.reconcile.is_converged());

        let calls = fake.calls();
        let last_device = calls
            .iter()
            .rposition(|c| c.path == "/vm/device")
            .unwrap();
        let first_vm_call =
            calls.iter().position(|c| c.path.starts_with("/vm/id/")).unwrap();
        assert!(last_device < first_vm_call);
        assert_eq!(fake.actions(), vec![PowerAction::Start]);
    }

    #[tokio::test]
    async fn attach_failure_skips_reconciliation() {
        let fake = Arc::new(FakeTrueNas::new(PowerState::Stopped));
        fake.fail_device_create_at(1);

        let err = provisioner(&fake)
            .provision(11, &decls(), "RUNNING")
            .await
            .unwrap_err();

        match err {
            ProvisionError::Attach(e) => assert_eq!(e.attached.len(), 1),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(fake.status_reads(), 0);
        assert!(fake.actions().is_empty());
    }

    #[tokio::test]
    async fn invalid_desired_state_creates_nothing() {
        let fake = Arc::new(FakeTrueNas::new(PowerState::Stopped));

        let err = provisioner(&fake)
            .provision(11, &decls(), "hibernate")
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::InvalidDesiredState(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn stopped_vm_with_stopped_target_is_left_alone() {
        let fake = Arc::new(FakeTrueNas::new(PowerState::Stopped));

        let report =
            provisioner(&fake).provision(11, &[], "STOPPED").await.unwrap();

        assert!(report.devices.is_empty());
        assert!(report.reconcile.is_converged());
        assert!(fake.actions().is_empty());
    }
}
