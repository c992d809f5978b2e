// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use thiserror::Error;
use truenas_client::{Gateway, TrueNasApi};

use crate::state::PowerState;

/// Reasons the current power state of a VM could not be determined.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Remote(#[from] truenas_client::Error),

    #[error("unable to determine VM state: record has no status.state")]
    MissingState,

    #[error("unable to determine VM state: unrecognized state {0:?}")]
    UnknownState(String),
}

/// Samples the power state of VMs.
#[derive(Clone)]
pub struct StatusReader {
    gateway: Arc<dyn Gateway>,
}

impl StatusReader {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self { gateway }
    }

    /// Fetches the VM record and returns its normalized power state.
    ///
    /// A record without a state is an error, never a default.
    pub async fn current_state(
        &self,
        vm_id: u64,
    ) -> Result<PowerState, StatusError> {
        let record = self.gateway.vm_get(vm_id).await?;
        let raw = record
            .status
            .and_then(|status| status.state)
            .ok_or(StatusError::MissingState)?;

        raw.to_uppercase().parse().map_err(|_| StatusError::UnknownState(raw))
    }
}
