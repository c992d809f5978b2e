// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory stand-in for the TrueNAS middleware, serving the handful of
//! `vm` and `vm.device` endpoints this crate uses.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use truenas_client::api::PowerAction;
use truenas_client::{Error, Gateway, Method};

use crate::clock::FakeClock;
use crate::state::PowerState;

#[derive(Clone, Debug)]
pub(crate) struct Call {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    /// Virtual time of the call, if the fake was given a clock.
    pub at: Duration,
}

impl Call {
    fn power_action(&self) -> Option<PowerAction> {
        if self.method != "POST" {
            return None;
        }
        match self.path.split('/').collect::<Vec<_>>().as_slice() {
            ["", "vm", "id", _, action] => action.parse().ok(),
            _ => None,
        }
    }

    pub(crate) fn is_status_read(&self) -> bool {
        self.method == "GET" && self.path.starts_with("/vm/id/")
    }
}

struct Inner {
    state: String,
    hide_status: bool,
    frozen: bool,
    read_script: VecDeque<Option<String>>,
    failing: HashSet<PowerAction>,
    failing_but_applied: HashSet<PowerAction>,
    lag: usize,
    stale: Option<(String, usize)>,
    device_failure_at: Option<usize>,
    devices_created: usize,
    next_device_id: u64,
    devices: BTreeMap<u64, Value>,
    calls: Vec<Call>,
}

pub(crate) struct FakeTrueNas {
    inner: Mutex<Inner>,
    clock: Option<Arc<FakeClock>>,
}

fn server_error(status: u16, body: &str) -> Error {
    Error::Status { status, body: body.to_string() }
}

fn ok_json(value: Value) -> Result<Bytes, Error> {
    Ok(Bytes::from(value.to_string()))
}

impl FakeTrueNas {
    pub(crate) fn new(initial: PowerState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: initial.to_string(),
                hide_status: false,
                frozen: false,
                read_script: VecDeque::new(),
                failing: HashSet::new(),
                failing_but_applied: HashSet::new(),
                lag: 0,
                stale: None,
                device_failure_at: None,
                devices_created: 0,
                next_device_id: 100,
                devices: BTreeMap::new(),
                calls: Vec::new(),
            }),
            clock: None,
        }
    }

    /// Stamps every recorded call with the virtual time of `clock`.
    pub(crate) fn with_clock(mut self, clock: Arc<FakeClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Overrides the raw state string reported by the middleware.
    pub(crate) fn set_reported_state(&self, state: &str) {
        self.inner.lock().unwrap().state = state.to_string();
    }

    /// Omits the `status` object from VM records.
    pub(crate) fn hide_status(&self) {
        self.inner.lock().unwrap().hide_status = true;
    }

    /// Power operations succeed but never change the VM's state.
    pub(crate) fn freeze(&self) {
        self.inner.lock().unwrap().frozen = true;
    }

    /// Queues responses for the next status reads: `Some` reports that state
    /// string, `None` fails the read with a 500.
    pub(crate) fn script_reads<'a>(
        &self,
        reads: impl IntoIterator<Item = Option<&'a str>>,
    ) {
        self.inner
            .lock()
            .unwrap()
            .read_script
            .extend(reads.into_iter().map(|r| r.map(str::to_string)));
    }

    /// Makes `action` fail with a 500 and leave the VM untouched.
    pub(crate) fn fail_action(&self, action: PowerAction) {
        self.inner.lock().unwrap().failing.insert(action);
    }

    /// Makes `action` report a 500 even though the VM does change state.
    pub(crate) fn fail_action_but_apply(&self, action: PowerAction) {
        self.inner.lock().unwrap().failing_but_applied.insert(action);
    }

    /// After each applied power operation, the next `reads` status reads
    /// still report the previous state.
    pub(crate) fn lag_reads(&self, reads: usize) {
        self.inner.lock().unwrap().lag = reads;
    }

    /// Fails the device creation with the given zero-based index.
    pub(crate) fn fail_device_create_at(&self, index: usize) {
        self.inner.lock().unwrap().device_failure_at = Some(index);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub(crate) fn actions(&self) -> Vec<PowerAction> {
        self.calls().iter().filter_map(Call::power_action).collect()
    }

    pub(crate) fn status_reads(&self) -> usize {
        self.calls().iter().filter(|c| c.is_status_read()).count()
    }

    /// Bodies of every `POST /vm/device` call, failed or not.
    pub(crate) fn device_requests(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == "POST" && c.path == "/vm/device")
            .filter_map(|c| c.body)
            .collect()
    }

    pub(crate) fn device(&self, id: u64) -> Option<Value> {
        self.inner.lock().unwrap().devices.get(&id).cloned()
    }
}

impl Inner {
    fn read_vm(&mut self, vm_id: u64) -> Result<Bytes, Error> {
        let state = match self.read_script.pop_front() {
            Some(Some(scripted)) => scripted,
            Some(None) => return Err(server_error(500, "middleware timeout")),
            None => match self.stale.take() {
                Some((old, remaining)) if remaining > 0 => {
                    self.stale = Some((old.clone(), remaining - 1));
                    old
                }
                _ => self.state.clone(),
            },
        };

        if self.hide_status {
            return ok_json(json!({ "id": vm_id, "name": "fake" }));
        }
        ok_json(json!({
            "id": vm_id,
            "name": "fake",
            "status": { "state": state, "pid": null, "domain_state": state },
        }))
    }

    fn power(&mut self, action: PowerAction) -> Result<Bytes, Error> {
        if self.failing.contains(&action) {
            return Err(server_error(500, &format!("{} failed", action)));
        }

        let current = self.state.to_uppercase();
        let next = match (action, current.as_str()) {
            (PowerAction::Start, "STOPPED") => "RUNNING",
            (PowerAction::Resume, "SUSPENDED") => "RUNNING",
            (PowerAction::Suspend, "RUNNING") => "SUSPENDED",
            (PowerAction::Stop | PowerAction::PowerOff, "RUNNING") => "STOPPED",
            (PowerAction::Restart, "RUNNING") => "RUNNING",
            _ => {
                return Err(server_error(
                    422,
                    &format!("cannot {} a VM in state {}", action, current),
                ))
            }
        };

        if !self.frozen {
            if self.lag > 0 {
                self.stale = Some((self.state.clone(), self.lag));
            }
            self.state = next.to_string();
        }

        if self.failing_but_applied.contains(&action) {
            return Err(server_error(500, "connection reset"));
        }
        ok_json(Value::Bool(true))
    }

    fn create_device(&mut self, body: Option<Value>) -> Result<Bytes, Error> {
        let index = self.devices_created;
        self.devices_created += 1;
        if self.device_failure_at == Some(index) {
            return Err(server_error(
                422,
                "[EINVAL] attributes.path: not found",
            ));
        }

        let body = body.unwrap_or(Value::Null);
        let id = self.next_device_id;
        self.next_device_id += 1;
        let record = json!({
            "id": id,
            "vm": body["vm"],
            "dtype": body["dtype"],
            "order": body["order"],
            "attributes": body["attributes"],
        });
        self.devices.insert(id, record.clone());
        ok_json(record)
    }

    fn update_device(
        &mut self,
        id: u64,
        body: Option<Value>,
    ) -> Result<Bytes, Error> {
        let Some(record) = self.devices.get_mut(&id) else {
            return Err(server_error(404, "device not found"));
        };
        let body = body.unwrap_or(Value::Null);
        if let Some(order) = body.get("order") {
            record["order"] = order.clone();
        }
        if let Some(Value::Object(attrs)) = body.get("attributes") {
            for (k, v) in attrs {
                record["attributes"][k] = v.clone();
            }
        }
        ok_json(record.clone())
    }
}

#[async_trait]
impl Gateway for FakeTrueNas {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Bytes, Error> {
        let at = self.clock.as_ref().map(|c| c.elapsed()).unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call {
            method: method.as_str().to_string(),
            path: path.to_string(),
            body: body.clone(),
            at,
        });

        let segments: Vec<&str> = path.split('/').collect();
        match (method.as_str(), segments.as_slice()) {
            ("GET", ["", "vm", "id", id]) => {
                inner.read_vm(id.parse().unwrap_or_default())
            }
            ("POST", ["", "vm", "id", _, action]) => match action.parse() {
                Ok(action) => inner.power(action),
                Err(_) => Err(server_error(404, "no such action")),
            },
            ("POST", ["", "vm", "device"]) => inner.create_device(body),
            ("GET", ["", "vm", "device", "id", id]) => {
                let id: u64 = id.parse().unwrap_or_default();
                match inner.devices.get(&id) {
                    Some(record) => ok_json(record.clone()),
                    None => Err(server_error(404, "device not found")),
                }
            }
            ("PUT", ["", "vm", "device", "id", id]) => {
                inner.update_device(id.parse().unwrap_or_default(), body)
            }
            ("DELETE", ["", "vm", "device", "id", id]) => {
                let id: u64 = id.parse().unwrap_or_default();
                match inner.devices.remove(&id) {
                    Some(_) => ok_json(Value::Bool(true)),
                    None => Err(server_error(404, "device not found")),
                }
            }
            _ => Err(server_error(404, "no such endpoint")),
        }
    }
}
