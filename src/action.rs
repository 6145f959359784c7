// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Logical operation units (C5, spec §3/§4.5) — `Action` on the global
//! queue, and `DeviceAction`, its per-device fanout. Grounded on
//! `original_source/src/action.c` (`Action`, `pm_coms`) and `device.c`
//! (`do_target_copy`).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::{NodeHandle, PowerState};
use crate::device::PlugRole;
use crate::script::{CompiledScript, ScriptCursor};

/// The closed set of client-facing command kinds. Order matches
/// `original_source/src/action.c`'s `pm_coms` table exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Error,
    LogIn,
    CheckLogin,
    LogOut,
    UpdatePlugs,
    UpdateNodes,
    PowerOn,
    PowerOff,
    PowerCycle,
    Reset,
    Names,
}

impl CommandKind {
    /// Informational commands are answered directly with no device traffic
    /// at all. Matches `original_source/src/action.c`'s `act_initiate`
    /// switch exactly: `PM_NAMES` lists known node names from the engine's
    /// own `Cluster` and never reaches a device, same as the other four.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::Error | Self::LogIn | Self::CheckLogin | Self::LogOut | Self::Names)
    }

    /// UPDATE_* commands fan out to every device with no per-node target.
    pub fn is_fleet_wide(&self) -> bool {
        matches!(self, Self::UpdatePlugs | Self::UpdateNodes)
    }

    /// Targeted commands accept a node selector and go through LITERAL/REGEX
    /// fanout (spec §4.5 case 3).
    pub fn is_targeted(&self) -> bool {
        matches!(self, Self::PowerOn | Self::PowerOff | Self::PowerCycle | Self::Reset)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "PM_ERROR",
            Self::LogIn => "PM_LOG_IN",
            Self::CheckLogin => "PM_CHECK_LOGIN",
            Self::LogOut => "PM_LOG_OUT",
            Self::UpdatePlugs => "PM_UPDATE_PLUGS",
            Self::UpdateNodes => "PM_UPDATE_NODES",
            Self::PowerOn => "PM_POWER_ON",
            Self::PowerOff => "PM_POWER_OFF",
            Self::PowerCycle => "PM_POWER_CYCLE",
            Self::Reset => "PM_RESET",
            Self::Names => "PM_NAMES",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to a connected client, supplied by the (out-of-scope)
/// listener component. `None` on an `Action` means internally generated
/// (periodic refresh) — never checked for liveness, never replied to.
pub type ClientId = u64;

/// Monotone sequence number, assigned by whoever creates an `Action`.
pub type Seq = u64;

/// A logical operation on the global queue (C5). Carries everything
/// `original_source/src/action.c`'s `Action` struct does except the
/// script iterator, which only exists once an `Action` has been fanned out
/// to a specific device (`DeviceAction` below) — the global `Action` itself
/// never runs a script directly.
#[derive(Debug, Clone)]
pub struct Action {
    pub command: CommandKind,
    /// Absent for internally generated refreshes (spec §3).
    pub client: Option<ClientId>,
    pub seq: Seq,
    /// Selector string; interpretation depends on the target device's mode
    /// (spec §3). Unused for informational and UPDATE_* commands.
    pub target: Option<String>,
}

impl Action {
    pub fn new(command: CommandKind, client: Option<ClientId>, seq: Seq) -> Self {
        Self { command, client, seq, target: None }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Outcome of a completed global `Action`, handed to `ClientSink::reply`.
/// A global action whose devices all complete — even with some reporting
/// UNKNOWN — is successful (spec §7); there is no partial-failure variant.
#[derive(Debug, Clone)]
pub struct CompletedAction {
    pub command: CommandKind,
    pub seq: Seq,
    /// Who asked. The engine never calls `ClientSink::reply` with `None`
    /// here — internally generated actions have no client to tell and are
    /// never replied to (spec §3 invariant: only a client-originated
    /// `Action` reaches the reply step).
    pub client: ClientId,
    /// Node name -> (plug state, node state) snapshot, populated for
    /// PM_UPDATE_PLUGS/PM_UPDATE_NODES and PM_NAMES; empty otherwise.
    pub node_states: Vec<(String, PowerState, PowerState)>,
}

/// A per-device action (C5, the "fanned out" form), exclusively owned by one
/// `Device`'s queue. Grounded on `do_target_copy` in
/// `original_source/src/device.c`: it copies `client`/`seq` from the
/// originating global `Action` purely for tracing — only the global action
/// replies (spec §4.6).
///
/// `targets` holds every device-local target this one global dispatch
/// expands to on this device (spec §4.5 case 3): a single verbatim regex for
/// a REGEX-mode device, a single "all" token when every bound plug on a
/// LITERAL device matches, or one entry per matching plug otherwise
/// (`do_target_some`'s per-plug enqueue, folded into one `DeviceAction` so
/// the device still reports exactly one `Busy`/`ActionDone` pair per seq).
/// The script replays once per target, in order.
pub struct DeviceAction {
    pub command: CommandKind,
    pub client: Option<ClientId>,
    pub seq: Seq,
    targets: Vec<Option<String>>,
    target_index: usize,
    pub script: ScriptCursor,
    /// Node/plug state observed from EXPECT captures so far, accumulated
    /// as the script runs and handed to the engine when the action
    /// finishes (spec §4.4).
    pub node_updates: Vec<(NodeHandle, PlugRole, PowerState)>,
}

impl DeviceAction {
    /// `targets` must be non-empty; a command with nothing to target is
    /// never enqueued (the device reports `Skipped` instead — see
    /// `device::Device::handle_dispatch`).
    pub fn new(
        command: CommandKind,
        client: Option<ClientId>,
        seq: Seq,
        targets: Vec<Option<String>>,
        script: Arc<CompiledScript>,
    ) -> Self {
        debug_assert!(!targets.is_empty(), "DeviceAction must carry at least one target");
        Self {
            command,
            client,
            seq,
            targets,
            target_index: 0,
            script: ScriptCursor::new(script),
            node_updates: Vec::new(),
        }
    }

    /// The device-local target substituted into the current SEND, if any.
    pub fn current_target(&self) -> Option<&str> {
        self.targets.get(self.target_index).and_then(|t| t.as_deref())
    }

    /// Whether there's another target queued up after the current one
    /// finishes its pass through the script.
    pub fn has_next_target(&self) -> bool {
        self.target_index + 1 < self.targets.len()
    }

    /// Advance to the next target and replay the script from the start.
    pub fn advance_target(&mut self) {
        self.target_index += 1;
        self.script.reset();
    }
}
