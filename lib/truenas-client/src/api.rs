// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire types for the TrueNAS `vm` and `vm.device` REST endpoints.
//!
//! Only the fields this crate acts on are modeled explicitly; everything else
//! the server returns is carried through untouched in `extra` so callers can
//! still display it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A VM record as returned by `GET /vm/id/{id}`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VmRecord {
    pub id: u64,

    #[serde(default)]
    pub name: String,

    /// Runtime status. TrueNAS omits this for some error conditions, so it
    /// has to be treated as optional.
    #[serde(default)]
    pub status: Option<VmStatus>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The nested `status` object of a VM record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VmStatus {
    /// Power state as reported by the middleware, e.g. `"RUNNING"`. Casing
    /// is not consistent across TrueNAS releases.
    #[serde(default)]
    pub state: Option<String>,

    #[serde(default)]
    pub pid: Option<i64>,

    #[serde(default)]
    pub domain_state: Option<String>,
}

/// Operations accepted by `POST /vm/id/{id}/{action}`.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum PowerAction {
    Start,
    /// Graceful (ACPI) shutdown.
    Stop,
    /// Immediate power-off without guest cooperation.
    PowerOff,
    Suspend,
    Resume,
    Restart,
}

/// Device type discriminant (`dtype`) understood by `vm.device`.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum DeviceType {
    Nic,
    Disk,
    Cdrom,
    Display,
    Pci,
    Usb,
    Raw,
}

/// Body of `POST /vm/device`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DeviceCreateRequest {
    pub vm: u64,
    pub dtype: DeviceType,
    pub order: i64,
    pub attributes: Map<String, Value>,
}

/// Body of `PUT /vm/device/id/{id}`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct DeviceUpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

/// A device record as returned by the `vm.device` endpoints.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DeviceRecord {
    pub id: u64,

    #[serde(default)]
    pub vm: Option<u64>,

    /// Kept as a string: newer releases report types (e.g. `TPM`) that this
    /// crate does not manage.
    pub dtype: String,

    #[serde(default)]
    pub order: Option<i64>,

    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn vm_record_keeps_unknown_fields() {
        let raw = r#"{
            "id": 12,
            "name": "builder",
            "vcpus": 2,
            "status": {
                "state": "Running",
                "pid": 4411,
                "domain_state": "RUNNING"
            }
        }"#;
        let vm: VmRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(vm.id, 12);
        assert_eq!(vm.status.unwrap().state.as_deref(), Some("Running"));
        assert_eq!(vm.extra.get("vcpus"), Some(&Value::from(2)));
    }

    #[test]
    fn vm_record_without_status() {
        let vm: VmRecord = serde_json::from_str(r#"{"id": 3}"#).unwrap();
        assert!(vm.status.is_none());
        assert!(vm.name.is_empty());
    }

    #[test]
    fn power_action_paths_are_lowercase() {
        assert_eq!(PowerAction::PowerOff.to_string(), "poweroff");
        assert_eq!(PowerAction::Resume.to_string(), "resume");
        assert_eq!(
            PowerAction::from_str("suspend").unwrap(),
            PowerAction::Suspend
        );
    }

    #[test]
    fn device_type_wire_format() {
        let req = DeviceCreateRequest {
            vm: 4,
            dtype: DeviceType::Cdrom,
            order: 1000,
            attributes: Map::new(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["dtype"], "CDROM");
        assert_eq!(DeviceType::from_str("nic").unwrap(), DeviceType::Nic);
    }

    #[test]
    fn empty_update_serializes_to_empty_object() {
        let body =
            serde_json::to_value(DeviceUpdateRequest::default()).unwrap();
        assert_eq!(body, serde_json::json!({}));
    }
}
