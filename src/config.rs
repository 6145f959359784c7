// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-level configuration and the config shapes the engine consumes.
//!
//! Parsing a config file into these shapes is out of scope (spec §1) — this
//! module only defines what a caller hands the engine after its own parser
//! has run. `DaemonConfig` is the one piece actually read from argv/env.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::action::CommandKind;

/// Process-level knobs for `pdud`.
#[derive(Debug, Parser)]
#[command(name = "pdud", version, about = "Remote power distribution daemon")]
pub struct DaemonConfig {
    /// Path to the cluster/device configuration file (format out of scope
    /// here; the caller's loader produces a `ClusterSpec`).
    #[arg(long, env = "PDUD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Seconds between periodic PM_UPDATE_PLUGS/PM_UPDATE_NODES refreshes.
    #[arg(long, env = "PDUD_UPDATE_SECONDS", default_value_t = 100)]
    pub update_seconds: u64,

    /// Default per-EXPECT timeout in milliseconds, used for devices whose
    /// spec omits one.
    #[arg(long, env = "PDUD_DEFAULT_EXPECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub default_expect_timeout_ms: u64,

    /// Emit per-byte send/receive telemetry at trace level.
    #[arg(long, env = "PDUD_LOGIT")]
    pub logit: bool,
}

impl DaemonConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_seconds)
    }

    pub fn default_expect_timeout(&self) -> Duration {
        Duration::from_millis(self.default_expect_timeout_ms)
    }
}

/// Whether a device's own protocol understands a regex target or only
/// literal plug names / the device's "all" token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetMode {
    Literal,
    Regex,
}

/// Transport kind for a device connection. `Tty` and `Snmp` are named from
/// the original's closed set but never dialed — `Device::new` rejects them
/// with `ConfigError::UnimplementedTransport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Raw TCP dialogue.
    Tcp,
    /// Telnet (option negotiation is handled below the line buffer; out of
    /// scope for the core dialogue engine beyond treating it as a TCP
    /// stream with a different default port convention).
    Telnet,
    /// Inter-daemon proxy: the remote end is itself an instance of this
    /// daemon, replying with a positional 0/1 vector (spec §4.4b).
    Proxy,
    /// Serial TTY line. Unimplemented.
    Tty,
    /// SNMP power control. Unimplemented.
    Snmp,
}

impl TransportKind {
    /// `None` for dialable transports; `Some(name)` for ones `Device::new`
    /// must refuse.
    fn unimplemented_name(&self) -> Option<&'static str> {
        match self {
            Self::Tcp | Self::Telnet | Self::Proxy => None,
            Self::Tty => Some("tty"),
            Self::Snmp => Some("snmp"),
        }
    }
}

/// A single SEND/EXPECT/DELAY element as read from configuration, prior to
/// regex compilation. See `script::ScriptElement` for the compiled form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScriptElementSpec {
    Send { format: String },
    Expect { completion: String, capture: String, map: Vec<InterpretationSpec> },
    Delay { millis: u64 },
}

/// One (plug-name, subgroup-index) binding inside an EXPECT's interpretation
/// map, prior to resolving the plug name to a handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpretationSpec {
    pub plug_name: String,
    pub match_pos: usize,
}

/// A full per-command script, prior to compilation.
pub type ScriptSpec = Vec<ScriptElementSpec>;

/// Configuration for a single physical plug on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlugSpec {
    /// Device-local name (e.g. "3", "a1"); also compiled as a regex for
    /// LITERAL-mode node-name matching is not needed here — plug *names*
    /// are matched verbatim against device-local targets, only *node*
    /// names are matched against a user selector regex (spec §4.5).
    pub name: String,
    /// Name of the node plugged into this outlet, if any.
    pub node: Option<String>,
}

/// Configuration for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub transport: TransportKind,
    pub host: String,
    pub service: String,
    pub mode: TargetMode,
    /// Device-local literal meaning "every plug" (only used in LITERAL mode).
    pub all_token: String,
    pub on_regex: String,
    pub off_regex: String,
    pub expect_timeout_ms: Option<u64>,
    pub plugs: Vec<PlugSpec>,
    /// One script per command kind; absent entries mean the device does not
    /// implement that command (spec §4.3 "device's script... is absent").
    pub scripts: Vec<(CommandKind, ScriptSpec)>,
}

/// A node's binding to one or two devices (hard power vs soft power /
/// liveness — spec §3, SPEC_FULL §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub hard_device: Option<String>,
    pub hard_plug: Option<String>,
    pub soft_device: Option<String>,
    pub soft_plug: Option<String>,
}

/// The full config tree the engine is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub devices: Vec<DeviceSpec>,
    pub nodes: Vec<NodeSpec>,
}
