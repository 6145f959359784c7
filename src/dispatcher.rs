// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Target fanout and the quiescence gate (spec §4.5, §4.6). Grounded on
//! `original_source/src/device.c` (`set_targets`, `do_target_copy`,
//! `do_target_some`) and `original_source/src/action.c` (`act_initiate`,
//! `act_finish`): every targeted or UPDATE_* action is handed to *every*
//! device, which decides locally whether it has anything to do (spec
//! §4.5 case 2/3) — `do_target_some`'s per-device scan is now
//! `Device::resolve_targets`, run inside that device's own task.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::action::{Action, ClientId, CommandKind, Seq};
use crate::cluster::PowerState;
use crate::device::{DeviceCommand, DeviceId};

pub struct DeviceHandle {
    pub name: String,
    pub control_tx: mpsc::UnboundedSender<DeviceCommand>,
}

/// Tracks, per in-flight global action, how many devices have yet to
/// report in (either `Skipped` or `ActionDone`) — the action, and the
/// whole global queue behind it, only advances once that count hits zero
/// (spec's "at most one global action in flight" invariant).
pub struct Dispatcher {
    devices: Vec<DeviceHandle>,
    pending: HashMap<Seq, PendingAction>,
}

struct PendingAction {
    command: CommandKind,
    client: Option<ClientId>,
    outstanding: usize,
    node_states: Vec<(String, PowerState, PowerState)>,
}

impl Dispatcher {
    pub fn new(devices: Vec<DeviceHandle>) -> Self {
        Self { devices, pending: HashMap::new() }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn is_quiescent(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fan `action` out to every device and start tracking its
    /// completion. Caller must not dispatch another action until this
    /// one resolves (enforced by `Engine`, not here).
    pub fn dispatch(&mut self, action: &Action) -> Option<FinishedAction> {
        self.pending.insert(
            action.seq,
            PendingAction {
                command: action.command,
                client: action.client,
                outstanding: self.devices.len(),
                node_states: Vec::new(),
            },
        );
        for dev in &self.devices {
            let _ = dev.control_tx.send(DeviceCommand::Dispatch {
                command: action.command,
                client: action.client,
                seq: action.seq,
                target: action.target.clone(),
            });
        }
        // A fleet with no devices at all resolves immediately — nobody is
        // ever going to report in.
        if self.devices.is_empty() {
            return self.resolve_one(action.seq);
        }
        None
    }

    pub fn retry_connections(&self) {
        for dev in &self.devices {
            let _ = dev.control_tx.send(DeviceCommand::RetryConnect);
        }
    }

    pub fn shutdown(&self) {
        for dev in &self.devices {
            let _ = dev.control_tx.send(DeviceCommand::Shutdown);
        }
    }

    pub fn device_name(&self, id: DeviceId) -> Option<&str> {
        self.devices.get(id).map(|d| d.name.as_str())
    }

    /// A device has nothing more to say about `seq`. Returns the finished
    /// action's collected state once every device has reported in.
    pub fn record_skip(&mut self, seq: Seq) -> Option<FinishedAction> {
        self.resolve_one(seq)
    }

    /// A device finished running `seq`'s script; `node_states` are
    /// already resolved to names by the caller (only `Engine` has the
    /// `Cluster` needed to turn a `NodeHandle` into one).
    pub fn record_done(&mut self, seq: Seq, node_states: Vec<(String, PowerState, PowerState)>) -> Option<FinishedAction> {
        if let Some(pending) = self.pending.get_mut(&seq) {
            pending.node_states.extend(node_states);
        }
        self.resolve_one(seq)
    }

    fn resolve_one(&mut self, seq: Seq) -> Option<FinishedAction> {
        let done = {
            let pending = self.pending.get_mut(&seq)?;
            pending.outstanding = pending.outstanding.saturating_sub(1);
            pending.outstanding == 0
        };
        if !done {
            return None;
        }
        let pending = self.pending.remove(&seq)?;
        Some(FinishedAction {
            command: pending.command,
            seq,
            client: pending.client,
            node_states: pending.node_states,
        })
    }
}

pub struct FinishedAction {
    pub command: CommandKind,
    pub seq: Seq,
    pub client: Option<ClientId>,
    pub node_states: Vec<(String, PowerState, PowerState)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::CommandKind;

    fn handle(name: &str) -> (DeviceHandle, mpsc::UnboundedReceiver<DeviceCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeviceHandle { name: name.to_string(), control_tx: tx }, rx)
    }

    #[test]
    fn resolves_only_after_every_device_reports() {
        let (h0, _rx0) = handle("a");
        let (h1, _rx1) = handle("b");
        let mut dispatcher = Dispatcher::new(vec![h0, h1]);
        let action = Action::new(CommandKind::PowerOn, Some(1), 42).with_target("node1");
        dispatcher.dispatch(&action);
        assert!(!dispatcher.is_quiescent());

        assert!(dispatcher.record_skip(42).is_none());
        let finished = dispatcher.record_skip(42).expect("second report resolves the action");
        assert_eq!(finished.seq, 42);
        assert!(dispatcher.is_quiescent());
    }
}
