// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Closed error taxonomies for the engine. Runtime device/protocol errors
//! are recovered locally (see `device.rs`); these enums exist for the
//! handful of cases a caller needs to observe (construction-time
//! configuration mistakes) or that are worth a typed log field.

use std::fmt;

/// Fatal, construction-time configuration errors. Never produced once the
/// engine is running — a malformed config is a process-exit-before-the-loop
/// condition (spec §7), not a recoverable runtime error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A device named an unimplemented transport kind (TTY, SNMP).
    UnimplementedTransport { device: String, kind: &'static str },
    /// A plug's name could not be compiled as a POSIX extended regex.
    InvalidPlugName { device: String, plug: String, source: String },
    /// A script element's regex failed to compile.
    InvalidScriptRegex { device: String, detail: String },
    /// A node references a device that was never declared.
    UnknownDevice { node: String, device: String },
    /// A node references a plug that does not exist on its device.
    UnknownPlug { node: String, device: String, plug: String },
    /// Two plugs on the same device share a name.
    DuplicatePlug { device: String, plug: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnimplementedTransport { device, kind } => {
                write!(f, "device {device}: transport {kind} is not implemented")
            }
            Self::InvalidPlugName { device, plug, source } => {
                write!(f, "device {device}: plug {plug} name is not a valid regex: {source}")
            }
            Self::InvalidScriptRegex { device, detail } => {
                write!(f, "device {device}: script regex error: {detail}")
            }
            Self::UnknownDevice { node, device } => {
                write!(f, "node {node}: references unknown device {device}")
            }
            Self::UnknownPlug { node, device, plug } => {
                write!(f, "node {node}: references unknown plug {plug} on device {device}")
            }
            Self::DuplicatePlug { device, plug } => {
                write!(f, "device {device}: duplicate plug name {plug}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Closed set of runtime error kinds surfaced to engine callers. Every
/// other runtime fault (I/O, protocol desync, timeouts) is recovered
/// locally inside a `Device` and never reaches this enum; see spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// `Engine::submit` called after shutdown was requested.
    ShuttingDown,
    /// Internal invariant violated (should be unreachable; logged and
    /// treated as a no-op rather than panicking, per spec §9).
    Invariant,
}

impl EngineErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Invariant => "INVARIANT_VIOLATION",
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub detail: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for EngineError {}
