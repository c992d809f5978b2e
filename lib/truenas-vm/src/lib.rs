// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM lifecycle management for TrueNAS Scale.
//!
//! The pieces, from the bottom up:
//!
//! - [`StatusReader`] samples a VM's power state.
//! - [`DeviceReconciler`] turns declared devices into ordered `vm.device`
//!   creations.
//! - [`TransitionEngine`] drives a VM to a desired [`PowerState`] with
//!   bounded retries.
//! - [`Provisioner`] runs device attachment and then the engine, in that
//!   order, for a newly created VM.
//!
//! Every operation runs sequentially within the calling task and can be
//! cancelled by dropping its future. Nothing here coordinates with other
//! clients of the same VM; see [`transition`] for what that implies.

use std::fmt;

mod clock;
pub mod devices;
mod provision;
mod state;
mod status;
pub mod transition;

#[cfg(test)]
mod test_utils;

pub use clock::{Clock, TokioClock};
pub use devices::{
    AttachError, AttachedDevice, Device, DeviceDeclaration, DeviceReconciler,
};
pub use provision::{ProvisionError, ProvisionReport, Provisioner};
pub use state::{
    resolve_desired, InvalidDesiredState, PowerState, TransitionRequest,
    DEFAULT_DESIRED_STATE,
};
pub use status::{StatusError, StatusReader};
pub use transition::{
    ReconcileOutcome, ReconcileReport, TransitionEngine, TransitionPolicy,
};

/// A non-fatal problem surfaced to the user. The operation that produced it
/// still returned normally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Warning {
    pub summary: String,
    pub detail: String,
}

impl Warning {
    pub fn new(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { summary: summary.into(), detail: detail.into() }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.summary, self.detail)
    }
}
