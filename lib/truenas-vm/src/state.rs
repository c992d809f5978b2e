// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Observable power state of a TrueNAS VM.
///
/// The middleware never reports an in-between state; a VM that is starting
/// or shutting down still reads as one of these three values.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum PowerState {
    Running,
    Stopped,
    Suspended,
}

/// The state a VM is driven to when the caller does not name one.
pub const DEFAULT_DESIRED_STATE: PowerState = PowerState::Stopped;

/// A requested state that is not one of the three power states.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("desired_state must be one of: RUNNING, STOPPED, SUSPENDED. Got: {0}")]
pub struct InvalidDesiredState(pub String);

impl PowerState {
    /// Parses a user-supplied desired state. Matching is case-insensitive.
    pub fn parse_desired(raw: &str) -> Result<Self, InvalidDesiredState> {
        let normalized = raw.to_uppercase();
        normalized.parse().map_err(|_| InvalidDesiredState(normalized))
    }
}

/// Picks the desired state for a newly created VM.
///
/// An explicit, non-empty `desired_state` wins. Otherwise the legacy
/// `start_on_create` flag selects [`PowerState::Running`], and failing both
/// the VM is left [`DEFAULT_DESIRED_STATE`].
pub fn resolve_desired(
    desired_state: Option<&str>,
    start_on_create: Option<bool>,
) -> Result<PowerState, InvalidDesiredState> {
    match desired_state.filter(|s| !s.is_empty()) {
        Some(raw) => PowerState::parse_desired(raw),
        None if start_on_create == Some(true) => Ok(PowerState::Running),
        None => Ok(DEFAULT_DESIRED_STATE),
    }
}

/// One reconciliation pass: drive `vm_id` to `desired`.
///
/// Built fresh for each create or update; never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionRequest {
    pub vm_id: u64,
    pub desired: PowerState,
}

impl TransitionRequest {
    pub fn new(vm_id: u64, desired: &str) -> Result<Self, InvalidDesiredState> {
        Ok(Self { vm_id, desired: PowerState::parse_desired(desired)? })
    }
}
