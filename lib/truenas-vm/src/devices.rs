// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Declared virtual devices and their translation into `vm.device` calls.
//!
//! Boot order is assigned deterministically. Declarations are grouped by
//! kind and visited in [`ATTACH_ORDER`], keeping declaration order within a
//! kind. A single counter starting at [`AUTO_ORDER_BASE`] is shared by every
//! kind and advances once per device, whether or not that device carried an
//! explicit order; explicit orders are sent verbatim.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use slog::{debug, info, o, Logger};
use thiserror::Error;
use truenas_client::api::{
    DeviceCreateRequest, DeviceRecord, DeviceType, DeviceUpdateRequest,
};
use truenas_client::{Gateway, TrueNasApi};

/// First order handed out to devices declared without one.
pub const AUTO_ORDER_BASE: i64 = 1000;

/// Emulated model used for NICs and disks that do not name one.
pub const DEFAULT_DEVICE_MODEL: &str = "VIRTIO";

/// Order in which device kinds are attached to a new VM.
pub const ATTACH_ORDER: [DeviceType; 7] = [
    DeviceType::Nic,
    DeviceType::Disk,
    DeviceType::Cdrom,
    DeviceType::Display,
    DeviceType::Pci,
    DeviceType::Usb,
    DeviceType::Raw,
];

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NicDevice {
    /// Host interface the NIC is bridged to.
    pub nic_attach: String,
    #[serde(default, rename = "type")]
    pub model: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub trust_guest_rx_filters: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiskDevice {
    pub path: String,
    #[serde(default, rename = "type")]
    pub model: Option<String>,
    #[serde(default)]
    pub iotype: Option<String>,
    #[serde(default)]
    pub physical_sectorsize: Option<i64>,
    #[serde(default)]
    pub logical_sectorsize: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CdromDevice {
    pub path: String,
}

/// A SPICE/VNC display. Only fields that are set are sent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DisplayDevice {
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub web: Option<bool>,
    #[serde(default, rename = "type")]
    pub model: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub web_port: Option<i64>,
    #[serde(default)]
    pub wait: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PciDevice {
    /// Passthrough device identifier, e.g. `pci_0000_3b_00_0`.
    pub pptdev: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct UsbDevice {
    pub device: String,
    #[serde(default)]
    pub controller: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RawDevice {
    pub path: String,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub boot: Option<bool>,
}

/// A virtual device, tagged by `kind`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Device {
    Nic(NicDevice),
    Disk(DiskDevice),
    Cdrom(CdromDevice),
    Display(DisplayDevice),
    Pci(PciDevice),
    Usb(UsbDevice),
    Raw(RawDevice),
}

fn put<V: Into<Value>>(attrs: &mut Map<String, Value>, key: &str, value: V) {
    attrs.insert(key.to_string(), value.into());
}

fn put_some<V: Into<Value>>(
    attrs: &mut Map<String, Value>,
    key: &str,
    value: Option<V>,
) {
    if let Some(value) = value {
        put(attrs, key, value);
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl Device {
    pub fn kind(&self) -> DeviceType {
        match self {
            Device::Nic(_) => DeviceType::Nic,
            Device::Disk(_) => DeviceType::Disk,
            Device::Cdrom(_) => DeviceType::Cdrom,
            Device::Display(_) => DeviceType::Display,
            Device::Pci(_) => DeviceType::Pci,
            Device::Usb(_) => DeviceType::Usb,
            Device::Raw(_) => DeviceType::Raw,
        }
    }

    /// The `attributes` object sent to the middleware, with the per-kind
    /// defaults applied.
    pub fn attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        match self {
            Device::Nic(nic) => {
                put(&mut attrs, "nic_attach", nic.nic_attach.as_str());
                put(
                    &mut attrs,
                    "type",
                    non_empty(&nic.model).unwrap_or(DEFAULT_DEVICE_MODEL),
                );
                put_some(&mut attrs, "mac", non_empty(&nic.mac));
                put(
                    &mut attrs,
                    "trust_guest_rx_filters",
                    nic.trust_guest_rx_filters.unwrap_or(false),
                );
            }
            Device::Disk(disk) => {
                put(&mut attrs, "path", disk.path.as_str());
                put(
                    &mut attrs,
                    "type",
                    non_empty(&disk.model).unwrap_or(DEFAULT_DEVICE_MODEL),
                );
                put_some(&mut attrs, "iotype", non_empty(&disk.iotype));
                put_some(
                    &mut attrs,
                    "physical_sectorsize",
                    disk.physical_sectorsize.filter(|&n| n > 0),
                );
                put_some(
                    &mut attrs,
                    "logical_sectorsize",
                    disk.logical_sectorsize.filter(|&n| n > 0),
                );
            }
            Device::Cdrom(cdrom) => {
                put(&mut attrs, "path", cdrom.path.as_str());
            }
            Device::Display(display) => {
                put_some(&mut attrs, "port", display.port);
                put_some(&mut attrs, "bind", display.bind.as_deref());
                put_some(&mut attrs, "password", display.password.as_deref());
                put_some(&mut attrs, "web", display.web);
                put_some(&mut attrs, "type", display.model.as_deref());
                put_some(
                    &mut attrs,
                    "resolution",
                    display.resolution.as_deref(),
                );
                put_some(&mut attrs, "web_port", display.web_port);
                put_some(&mut attrs, "wait", display.wait);
            }
            Device::Pci(pci) => {
                put(&mut attrs, "pptdev", pci.pptdev.as_str());
            }
            Device::Usb(usb) => {
                put(&mut attrs, "device", usb.device.as_str());
                put_some(&mut attrs, "controller", non_empty(&usb.controller));
            }
            Device::Raw(raw) => {
                put(&mut attrs, "path", raw.path.as_str());
                put_some(&mut attrs, "size", raw.size);
                put_some(&mut attrs, "boot", raw.boot);
            }
        }
        attrs
    }
}

/// A device as declared by the user: the device itself plus an optional
/// boot order (lower boots first).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviceDeclaration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,

    #[serde(flatten)]
    pub device: Device,
}

impl DeviceDeclaration {
    pub fn new(device: Device) -> Self {
        Self { order: None, device }
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = Some(order);
        self
    }

    /// The declared order, if it is usable. Zero and negative values are
    /// treated as unset.
    pub fn explicit_order(&self) -> Option<i64> {
        self.order.filter(|&o| o > 0)
    }

    fn create_request(&self, vm_id: u64, order: i64) -> DeviceCreateRequest {
        DeviceCreateRequest {
            vm: vm_id,
            dtype: self.device.kind(),
            order,
            attributes: self.device.attributes(),
        }
    }
}

/// Computes the creation request for every declaration, in the order they
/// must be sent.
pub fn plan_attachments(
    vm_id: u64,
    declarations: &[DeviceDeclaration],
) -> Vec<DeviceCreateRequest> {
    let mut counter = AUTO_ORDER_BASE;
    let mut plan = Vec::with_capacity(declarations.len());
    for kind in ATTACH_ORDER {
        for decl in declarations.iter().filter(|d| d.device.kind() == kind) {
            let order = decl.explicit_order().unwrap_or(counter);
            counter += 1;
            plan.push(decl.create_request(vm_id, order));
        }
    }
    plan
}

/// A device created by [`DeviceReconciler::attach_devices`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttachedDevice {
    pub id: u64,
    pub dtype: DeviceType,
    pub order: i64,
}

/// Device attachment stopped at the first failed creation. Devices created
/// before it are left in place.
#[derive(Debug, Error)]
#[error("unable to create {dtype} device with order {order}: {source}")]
pub struct AttachError {
    pub dtype: DeviceType,
    pub order: i64,
    pub attached: Vec<AttachedDevice>,
    #[source]
    pub source: truenas_client::Error,
}

/// Creates and manages the virtual devices of a VM.
pub struct DeviceReconciler {
    gateway: Arc<dyn Gateway>,
    log: Logger,
}

impl DeviceReconciler {
    pub fn new(gateway: Arc<dyn Gateway>, log: Logger) -> Self {
        Self { gateway, log }
    }

    /// Creates every declared device on `vm_id`, one request at a time.
    ///
    /// The first failure aborts the remaining creations. Nothing is rolled
    /// back.
    pub async fn attach_devices(
        &self,
        vm_id: u64,
        declarations: &[DeviceDeclaration],
    ) -> Result<Vec<AttachedDevice>, AttachError> {
        let log = self.log.new(o!("vm_id" => vm_id));
        let mut attached = Vec::with_capacity(declarations.len());

        for request in plan_attachments(vm_id, declarations) {
            debug!(log, "creating device";
                   "dtype" => %request.dtype, "order" => request.order);
            match self.gateway.vm_device_create(&request).await {
                Ok(record) => attached.push(AttachedDevice {
                    id: record.id,
                    dtype: request.dtype,
                    order: request.order,
                }),
                Err(source) => {
                    return Err(AttachError {
                        dtype: request.dtype,
                        order: request.order,
                        attached,
                        source,
                    });
                }
            }
        }

        info!(log, "attached devices"; "count" => attached.len());
        Ok(attached)
    }

    /// Creates a single device. A declared order is sent as given, even when
    /// not positive; without one the device gets [`AUTO_ORDER_BASE`].
    pub async fn create_device(
        &self,
        vm_id: u64,
        declaration: &DeviceDeclaration,
    ) -> Result<DeviceRecord, truenas_client::Error> {
        let order = declaration.order.unwrap_or(AUTO_ORDER_BASE);
        let request = declaration.create_request(vm_id, order);
        debug!(self.log, "creating device";
               "vm_id" => vm_id, "dtype" => %request.dtype, "order" => order);
        self.gateway.vm_device_create(&request).await
    }

    pub async fn get_device(
        &self,
        device_id: u64,
    ) -> Result<DeviceRecord, truenas_client::Error> {
        self.gateway.vm_device_get(device_id).await
    }

    /// Rewrites the attributes (and, if declared, the order, verbatim) of an
    /// existing device. The device keeps its ID.
    pub async fn update_device(
        &self,
        device_id: u64,
        declaration: &DeviceDeclaration,
    ) -> Result<DeviceRecord, truenas_client::Error> {
        let request = DeviceUpdateRequest {
            order: declaration.order,
            attributes: declaration.device.attributes(),
        };
        debug!(self.log, "updating device"; "device_id" => device_id);
        self.gateway.vm_device_update(device_id, &request).await
    }

    pub async fn delete_device(
        &self,
        device_id: u64,
    ) -> Result<(), truenas_client::Error> {
        debug!(self.log, "deleting device"; "device_id" => device_id);
        self.gateway.vm_device_delete(device_id).await
    }
}
