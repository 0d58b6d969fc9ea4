//! Sensor-bus seam between the bridge and the rest of the autopilot.
//!
//! The bridge only ever talks through [`BusClient`]: watch a key,
//! drain deltas, publish a parsed reading, report a lost device. The
//! in-process [`Hub`] behind it stores the values, applies source
//! arbitration on inbound writes, and pushes watched-key deltas back;
//! the host side injects computed values (attitude, heading, the
//! outbound client target) through a [`HubHandle`].

use std::collections::{HashMap, HashSet};

use log::debug;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::{BridgeError, Result};
use crate::nmea::parse::{Kind, SensorReport};
use crate::source::{should_emit, Source};

/// Requests flowing into the hub.
#[derive(Debug)]
pub(crate) enum BusMsg {
    Watch { name: String, on: bool },
    Write { report: SensorReport, source: Source },
    LostDevice { device: String },
    Set { name: String, value: Value },
}

/// Bridge-side client: publish/subscribe plus device-loss reports.
pub struct BusClient {
    tx: UnboundedSender<BusMsg>,
    rx: UnboundedReceiver<(String, Value)>,
}

impl BusClient {
    /// Enable or disable delta updates for a key.
    pub fn watch(&self, name: &str, on: bool) -> Result<()> {
        self.send(BusMsg::Watch { name: name.to_string(), on })
    }

    /// Wait for the next watched-key delta. `None` means the hub is
    /// gone.
    pub async fn next_update(&mut self) -> Option<(String, Value)> {
        self.rx.recv().await
    }

    /// Drain all pending deltas; later values win per key.
    pub fn receive(&mut self) -> HashMap<String, Value> {
        let mut updates = HashMap::new();
        while let Ok((name, value)) = self.rx.try_recv() {
            updates.insert(name, value);
        }
        updates
    }

    /// Publish a parsed reading under a source tag. The hub arbitrates
    /// whether it actually lands.
    pub fn write(&self, report: SensorReport, source: Source) -> Result<()> {
        self.send(BusMsg::Write { report, source })
    }

    /// Report that the device identified by `device` has gone away.
    pub fn lostdevice(&self, device: &str) -> Result<()> {
        self.send(BusMsg::LostDevice { device: device.to_string() })
    }

    fn send(&self, msg: BusMsg) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| BridgeError::Bus("sensor hub closed".into()))
    }
}

/// Host-side handle for injecting values and device-loss reports.
#[derive(Clone)]
pub struct HubHandle {
    tx: UnboundedSender<BusMsg>,
}

impl HubHandle {
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        self.tx
            .send(BusMsg::Set { name: name.to_string(), value })
            .map_err(|_| BridgeError::Bus("sensor hub closed".into()))
    }

    pub fn lostdevice(&self, device: &str) -> Result<()> {
        self.tx
            .send(BusMsg::LostDevice { device: device.to_string() })
            .map_err(|_| BridgeError::Bus("sensor hub closed".into()))
    }
}

/// The value store. Runs until every sender is dropped.
pub struct Hub {
    rx: UnboundedReceiver<BusMsg>,
    update_tx: UnboundedSender<(String, Value)>,
    values: HashMap<String, Value>,
    watched: HashSet<String>,
}

/// Build a hub with its host handle and the bridge client.
pub fn hub() -> (Hub, HubHandle, BusClient) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let hub = Hub {
        rx,
        update_tx,
        values: HashMap::new(),
        watched: HashSet::new(),
    };
    let handle = HubHandle { tx: tx.clone() };
    let client = BusClient { tx, rx: update_rx };
    (hub, handle, client)
}

/// A bare client whose hub side is driven by the caller, for
/// supervisor tests.
#[cfg(test)]
pub(crate) fn client_pair() -> (
    BusClient,
    UnboundedReceiver<BusMsg>,
    UnboundedSender<(String, Value)>,
) {
    let (tx, hub_rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    (BusClient { tx, rx: update_rx }, hub_rx, update_tx)
}

impl Hub {
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg);
        }
    }

    fn handle(&mut self, msg: BusMsg) {
        match msg {
            BusMsg::Watch { name, on } => {
                if on {
                    if self.watched.insert(name.clone()) {
                        // a fresh watch is seeded with the current value
                        if let Some(v) = self.values.get(&name) {
                            self.update_tx.send((name, v.clone())).ok();
                        }
                    }
                } else {
                    self.watched.remove(&name);
                }
            }
            BusMsg::Set { name, value } => self.set(&name, value),
            BusMsg::Write { report, source } => self.write(report, source),
            BusMsg::LostDevice { device } => self.lostdevice(&device),
        }
    }

    fn set(&mut self, name: &str, value: Value) {
        if self.watched.contains(name) {
            self.update_tx.send((name.to_string(), value.clone())).ok();
        }
        self.values.insert(name.to_string(), value);
    }

    fn write(&mut self, report: SensorReport, source: Source) {
        let kind = report.reading.kind();
        let current = self
            .values
            .get(kind.source_key())
            .and_then(Value::as_str)
            .map_or(Source::None, Source::from_tag);
        if !should_emit(source, current) {
            debug!(
                "{} reading from {} dropped, {} owns the channel",
                kind.name(),
                source.tag(),
                current.tag()
            );
            return;
        }
        self.set(kind.source_key(), json!(source.tag()));
        self.set(kind.device_key(), json!(report.device.clone()));
        if let Ok(value) = serde_json::to_value(&report) {
            self.set(kind.name(), value);
        }
    }

    fn lostdevice(&mut self, device: &str) {
        for kind in Kind::ALL {
            let owned = self
                .values
                .get(kind.device_key())
                .and_then(Value::as_str)
                .is_some_and(|d| d == device || d.get(2..) == Some(device));
            if owned {
                debug!("{} source lost its device {device}", kind.name());
                self.set(kind.source_key(), json!("none"));
                self.set(kind.device_key(), json!(""));
            }
        }
    }
}
