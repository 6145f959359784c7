// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `Device` task (C4): one remote power controller's connection,
//! protocol dialogue, and per-device action queue. Grounded almost
//! line-for-line on `original_source/src/device.c`
//! (`initiate_nonblocking_connect`, `do_Device_connect`,
//! `handle_Device_read`/`handle_Device_write`, `process_script`,
//! `process_send`/`process_expect`/`process_delay`, `stalled_Device`,
//! `recover_Device`, `set_targets`, `do_target_some`, `do_Device_semantics`,
//! `do_PMD_semantics`) — reworked from a per-fd slot in one big `select()`
//! loop into its own task, exclusively owning its socket, buffers, script
//! cursor, and per-device queue. It never touches `Cluster` directly: node
//! state changes and lifecycle transitions are reported to the `Engine`
//! over `event_tx`, which is the sole mutator of shared state (DESIGN.md,
//! "Single-threaded cooperative loop, realized with tokio").

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use regex::Regex;
use slab::Slab;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::action::{ClientId, CommandKind, DeviceAction, Seq};
use crate::cluster::{NodeHandle, PowerState};
use crate::config::{DeviceSpec, ScriptElementSpec, TargetMode, TransportKind};
use crate::error::ConfigError;
use crate::script::{CompiledScript, Interpretation, ScriptElement};

/// Stable handle into a device's own plug arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlugHandle(pub usize);

/// Index assigned by whoever builds the device table (`lib.rs`); stable for
/// the life of the process, used as the foreign key in `Node::hard`/`soft`.
pub type DeviceId = usize;

/// Which of a node's two independent power relationships a plug serves.
/// spec §3: a node's hard (outlet) power and soft (liveness / IPMI-style)
/// power may live on different devices; a plug only ever serves one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugRole {
    Hard,
    Soft,
}

/// One physical (or logical, for a `Proxy` device) outlet. Owned by its
/// `Device`, never shared — `Node::hard`/`soft` hold `(DeviceId, PlugHandle)`
/// back-edges rather than a pointer to this struct.
#[derive(Debug)]
pub struct Plug {
    pub name: String,
    pub node: Option<NodeHandle>,
    pub node_name: Option<String>,
    pub role: PlugRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    NotConnected,
    Connecting,
    Connected,
}

/// Message sent from the engine (or the dispatcher acting on its behalf) to
/// one device task's control channel.
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    /// Fan this action out if (and only if) one of our plugs matches
    /// `target`. `target` is `None` for UPDATE_*/fleet-wide commands, which
    /// always match (spec §4.5 case 2).
    Dispatch { command: CommandKind, client: Option<ClientId>, seq: Seq, target: Option<String> },
    /// Sent on every periodic update tick; a no-op unless we're currently
    /// `NotConnected` (spec §4.3: "the next periodic update tick will
    /// retry" — reconnection is never attempted on its own clock).
    RetryConnect,
    Shutdown,
}

/// Message from a device task back to the central engine task. The engine
/// is the only place `Cluster` is mutated; these events carry everything it
/// needs to do that without ever reaching into a device's own state.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Our queue went from empty to non-empty.
    Busy,
    /// Our queue went from non-empty to empty.
    Idle,
    /// One `DeviceAction` ran to completion (its script exhausted).
    ActionDone {
        command: CommandKind,
        client: Option<ClientId>,
        seq: Seq,
        updates: Vec<(NodeHandle, PlugRole, PowerState)>,
    },
    /// This device was asked about `seq` and has nothing further to say
    /// about it — either no plug matched the target, the device's script
    /// table doesn't implement the command, the command was refused by
    /// the login gate (spec §4.3 "while loggedin == false..."), or the
    /// action was abandoned by a stall recovery. Lets the engine count
    /// down to "every device has weighed in" for quiescence (spec §4.6)
    /// without guessing from `Busy`/`Idle` transitions alone. `command`
    /// lets the engine recognize and ignore device-internal PM_LOG_IN
    /// bookkeeping, which never goes through the dispatcher.
    Skipped { command: CommandKind, seq: Seq },
    /// Connection dropped, whether by EOF/ECONNRESET or a stalled EXPECT
    /// (spec §7): every node this device has a plug bound to has both its
    /// plug-state and node-state invalidated to UNKNOWN.
    ConnectionLost { invalidated: Vec<NodeHandle> },
}

pub type EventSender = mpsc::UnboundedSender<(DeviceId, DeviceEvent)>;

pub struct Device {
    pub name: String,
    host: String,
    service: String,
    transport: TransportKind,
    mode: TargetMode,
    all_token: String,
    on_re: Regex,
    off_re: Regex,
    expect_timeout: Duration,

    status: DeviceStatus,
    socket: Option<TcpStream>,
    incoming: crate::buffer::LineBuffer,
    outgoing: crate::buffer::LineBuffer,
    sending: bool,
    expecting: bool,
    loggedin: bool,
    error: bool,
    last_progress: Instant,
    pending_delay_until: Option<Instant>,

    plugs: Slab<Plug>,
    plug_by_name: IndexMap<String, PlugHandle>,
    scripts: HashMap<CommandKind, Arc<CompiledScript>>,

    queue: VecDeque<DeviceAction>,
}

impl Device {
    pub fn new(spec: &DeviceSpec, default_timeout: Duration, logit: bool) -> Result<Self, ConfigError> {
        if let Some(kind) = spec.transport.unimplemented_name() {
            return Err(ConfigError::UnimplementedTransport { device: spec.name.clone(), kind });
        }

        let on_re = Regex::new(&spec.on_regex).map_err(|e| ConfigError::InvalidScriptRegex {
            device: spec.name.clone(),
            detail: e.to_string(),
        })?;
        let off_re = Regex::new(&spec.off_regex).map_err(|e| ConfigError::InvalidScriptRegex {
            device: spec.name.clone(),
            detail: e.to_string(),
        })?;

        let mut plugs = Slab::new();
        let mut plug_by_name = IndexMap::new();
        for plug_spec in &spec.plugs {
            if plug_by_name.contains_key(&plug_spec.name) {
                return Err(ConfigError::DuplicatePlug {
                    device: spec.name.clone(),
                    plug: plug_spec.name.clone(),
                });
            }
            // REGEX-mode devices address plugs by pattern, not by literal
            // name; validate the pattern compiles at config time rather
            // than discovering a bad admin-authored regex mid-dispatch.
            if spec.mode == TargetMode::Regex {
                Regex::new(&plug_spec.name).map_err(|e| ConfigError::InvalidPlugName {
                    device: spec.name.clone(),
                    plug: plug_spec.name.clone(),
                    source: e.to_string(),
                })?;
            }
            let plug = Plug {
                name: plug_spec.name.clone(),
                node: None,
                node_name: plug_spec.node.clone(),
                role: PlugRole::Hard,
            };
            let key = plugs.insert(plug);
            plug_by_name.insert(plug_spec.name.clone(), PlugHandle(key));
        }

        let mut scripts = HashMap::new();
        for (kind, script_spec) in &spec.scripts {
            let compiled = compile_script(&spec.name, script_spec, &plug_by_name)?;
            scripts.insert(*kind, Arc::new(compiled));
        }

        let mut incoming = crate::buffer::LineBuffer::with_default_capacity();
        let mut outgoing = crate::buffer::LineBuffer::with_default_capacity();
        if logit {
            incoming.enable_logit(spec.name.clone(), "from");
            outgoing.enable_logit(spec.name.clone(), "to");
        }

        Ok(Self {
            name: spec.name.clone(),
            host: spec.host.clone(),
            service: spec.service.clone(),
            transport: spec.transport,
            mode: spec.mode,
            all_token: spec.all_token.clone(),
            on_re,
            off_re,
            expect_timeout: spec
                .expect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
            status: DeviceStatus::NotConnected,
            socket: None,
            incoming,
            outgoing,
            sending: false,
            expecting: false,
            loggedin: false,
            error: false,
            last_progress: Instant::now(),
            pending_delay_until: None,
            plugs,
            plug_by_name,
            scripts,
            queue: VecDeque::new(),
        })
    }

    pub fn plug_handle(&self, name: &str) -> Option<PlugHandle> {
        self.plug_by_name.get(name).copied()
    }

    /// Bind a plug to its node and role once the owning `Cluster` exists.
    /// Called by the config-loading code in `lib.rs`, never at runtime.
    pub fn bind_plug(&mut self, handle: PlugHandle, node: NodeHandle, role: PlugRole) {
        if let Some(plug) = self.plugs.get_mut(handle.0) {
            plug.node = Some(node);
            plug.role = role;
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn is_logged_in(&self) -> bool {
        self.loggedin
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    /// The device task's run loop. Consumes `self`; runs until told to
    /// shut down or the control channel closes.
    pub async fn run(
        mut self,
        id: DeviceId,
        mut control_rx: mpsc::UnboundedReceiver<DeviceCommand>,
        event_tx: EventSender,
    ) {
        self.status = DeviceStatus::Connecting;
        let res = Self::dial(&self.host, &self.service).await;
        self.on_connect_result(res, &event_tx, id);

        loop {
            let want_read = self.wants_read();
            let want_write = self.wants_write();
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                cmd = control_rx.recv() => {
                    match cmd {
                        None | Some(DeviceCommand::Shutdown) => break,
                        Some(DeviceCommand::Dispatch { command, client, seq, target }) => {
                            self.handle_dispatch(command, client, seq, target, &event_tx, id);
                        }
                        Some(DeviceCommand::RetryConnect) => {
                            if self.status == DeviceStatus::NotConnected {
                                self.status = DeviceStatus::Connecting;
                                let res = Self::dial(&self.host, &self.service).await;
                                self.on_connect_result(res, &event_tx, id);
                            }
                        }
                    }
                }

                res = Self::wait_readable(&self.socket), if want_read => {
                    self.on_readable(res, &event_tx, id);
                }

                res = Self::wait_writable(&self.socket), if want_write => {
                    self.on_writable(res, &event_tx, id);
                }

                () = Self::wait_until(deadline), if deadline.is_some() => {
                    if self.expecting {
                        self.on_stall(&event_tx, id);
                    } else {
                        self.on_delay_elapsed(&event_tx, id);
                    }
                }
            }
        }

        tracing::debug!(device = %self.name, "device task shutting down");
    }

    async fn dial(host: &str, service: &str) -> std::io::Result<TcpStream> {
        TcpStream::connect(format!("{host}:{service}")).await
    }

    async fn wait_readable(socket: &Option<TcpStream>) -> std::io::Result<()> {
        match socket {
            Some(s) => s.readable().await,
            None => std::future::pending().await,
        }
    }

    async fn wait_writable(socket: &Option<TcpStream>) -> std::io::Result<()> {
        match socket {
            Some(s) => s.writable().await,
            None => std::future::pending().await,
        }
    }

    async fn wait_until(deadline: Option<Instant>) {
        match deadline {
            Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
            None => std::future::pending().await,
        }
    }

    fn wants_read(&self) -> bool {
        self.socket.is_some()
    }

    fn wants_write(&self) -> bool {
        self.socket.is_some() && self.sending && !self.outgoing.is_empty()
    }

    /// The EXPECT timeout while waiting on a reply, or a pending DELAY's
    /// deadline — never both; a script runs one element at a time.
    fn next_deadline(&self) -> Option<Instant> {
        if self.expecting {
            Some(self.last_progress + self.expect_timeout)
        } else {
            self.pending_delay_until
        }
    }

    fn on_connect_result(
        &mut self,
        res: std::io::Result<TcpStream>,
        event_tx: &EventSender,
        id: DeviceId,
    ) {
        match res {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                self.socket = Some(stream);
                self.status = DeviceStatus::Connected;
                self.error = false;
                self.loggedin = false;
                self.incoming.clear();
                self.outgoing.clear();
                self.sending = false;
                self.expecting = false;
                self.pending_delay_until = None;
                self.last_progress = Instant::now();
                tracing::info!(device = %self.name, "connected");
                match self.scripts.get(&CommandKind::LogIn).cloned() {
                    Some(script) => {
                        let login = DeviceAction::new(CommandKind::LogIn, None, 0, vec![None], script);
                        self.enqueue(login, event_tx, id);
                    }
                    None => {
                        // No PM_LOG_IN script configured: nothing to run, so
                        // there is nothing that will ever flip `loggedin`
                        // via the normal action-completion path (spec §4.3
                        // step 4). Treat it the same as any other absent
                        // script (edge policy) rather than permanently
                        // refusing every other command via the login gate.
                        self.loggedin = true;
                        self.pump(event_tx, id);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(device = %self.name, error = %err, "connect failed, retrying on next update tick");
                self.status = DeviceStatus::NotConnected;
                self.error = true;
            }
        }
    }

    fn on_readable(&mut self, res: std::io::Result<()>, event_tx: &EventSender, id: DeviceId) {
        if res.is_err() {
            self.on_connection_lost(event_tx, id);
            return;
        }
        let Some(socket) = self.socket.as_ref() else { return };
        let mut buf = [0u8; 4096];
        match socket.try_read(&mut buf) {
            Ok(0) => self.on_connection_lost(event_tx, id),
            Ok(n) => {
                self.incoming.append_raw(&buf[..n]);
                self.last_progress = Instant::now();
                self.pump(event_tx, id);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => self.on_connection_lost(event_tx, id),
        }
    }

    fn on_writable(&mut self, res: std::io::Result<()>, event_tx: &EventSender, id: DeviceId) {
        if res.is_err() {
            self.on_connection_lost(event_tx, id);
            return;
        }
        let Some(socket) = self.socket.as_ref() else { return };
        let chunk = self.outgoing.peek(self.outgoing.len()).to_vec();
        if chunk.is_empty() {
            self.sending = false;
            return;
        }
        match socket.try_write(&chunk) {
            Ok(0) => {}
            Ok(n) => {
                self.outgoing.drain_for_write(n);
                self.last_progress = Instant::now();
                if self.outgoing.is_empty() {
                    self.sending = false;
                    if let Some(action) = self.queue.front_mut() {
                        action.script.advance();
                    }
                    self.pump(event_tx, id);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => self.on_connection_lost(event_tx, id),
        }
    }

    /// The EXPECT at the head of the queue timed out: the device is
    /// *stalled* (spec §4.3 step 5, `recover_Device`). Every queued
    /// per-device action is abandoned, each reported `Skipped` so the
    /// dispatcher's outstanding count for its seq still resolves, before
    /// the connection is torn down and every bound node invalidated.
    fn on_stall(&mut self, event_tx: &EventSender, id: DeviceId) {
        tracing::warn!(device = %self.name, "EXPECT timed out, recovering connection");
        while let Some(action) = self.queue.pop_front() {
            let _ = event_tx.send((id, DeviceEvent::Skipped { command: action.command, seq: action.seq }));
        }
        self.reset_connection(event_tx, id);
    }

    fn on_delay_elapsed(&mut self, event_tx: &EventSender, id: DeviceId) {
        self.pending_delay_until = None;
        if let Some(action) = self.queue.front_mut() {
            action.script.advance();
        }
        self.pump(event_tx, id);
    }

    /// EOF/ECONNRESET/IO error (spec §4.3 step 6, `do_Device_reconnect`):
    /// unlike a stall, only the head action is touched, and only if it was
    /// PM_LOG_IN — dropped outright, since reconnecting synthesizes a fresh
    /// one. Anything else at the head is preserved with its script cursor
    /// reset so it resumes once re-login completes.
    fn on_connection_lost(&mut self, event_tx: &EventSender, id: DeviceId) {
        tracing::warn!(device = %self.name, "connection lost, will retry on next update tick");
        match self.queue.front() {
            Some(action) if action.command == CommandKind::LogIn => {
                self.queue.pop_front();
            }
            Some(_) => {
                if let Some(action) = self.queue.front_mut() {
                    action.script.reset();
                }
            }
            None => {}
        }
        self.reset_connection(event_tx, id);
    }

    /// Shared tail of both recovery paths (spec §7): drop the socket,
    /// reset connection-local state, and invalidate every node this device
    /// has a plug bound to (both plug-state and node-state, regardless of
    /// which role this device actually serves for that node) to UNKNOWN.
    /// Reconnection itself rides the next periodic update tick
    /// (`DeviceCommand::RetryConnect`), same as any other freshly
    /// `NOT_CONNECTED` device.
    fn reset_connection(&mut self, event_tx: &EventSender, id: DeviceId) {
        self.socket = None;
        self.status = DeviceStatus::NotConnected;
        self.error = true;
        self.loggedin = false;
        self.sending = false;
        self.expecting = false;
        self.pending_delay_until = None;
        self.incoming.clear();
        self.outgoing.clear();
        let invalidated = self.bound_node_handles();
        let _ = event_tx.send((id, DeviceEvent::ConnectionLost { invalidated }));
    }

    /// Every node this device currently has a plug bound to, in no
    /// particular order; duplicates are harmless (the engine's invalidation
    /// write is idempotent).
    fn bound_node_handles(&self) -> Vec<NodeHandle> {
        self.plugs.iter().filter_map(|(_, plug)| plug.node).collect()
    }

    fn handle_dispatch(
        &mut self,
        command: CommandKind,
        client: Option<ClientId>,
        seq: Seq,
        target: Option<String>,
        event_tx: &EventSender,
        id: DeviceId,
    ) {
        // spec §4.3 edge policy / I3: nothing but PM_LOG_IN ever reaches a
        // device this way (PM_LOG_IN is informational and is always
        // self-synthesized, never dispatched through here), so any command
        // seen here is refused outright while not yet logged in.
        if !self.loggedin {
            tracing::debug!(device = %self.name, command = %command, "refusing command, device is not logged in");
            let _ = event_tx.send((id, DeviceEvent::Skipped { command, seq }));
            return;
        }

        let targets = if command.is_fleet_wide() {
            vec![None]
        } else if command.is_targeted() {
            let resolved = self.resolve_targets(target.as_deref());
            if resolved.is_empty() {
                let _ = event_tx.send((id, DeviceEvent::Skipped { command, seq }));
                return;
            }
            resolved
        } else {
            vec![target]
        };

        let Some(script) = self.scripts.get(&command).cloned() else {
            tracing::debug!(device = %self.name, command = %command, "command not implemented by this device, ignoring");
            let _ = event_tx.send((id, DeviceEvent::Skipped { command, seq }));
            return;
        };
        let action = DeviceAction::new(command, client, seq, targets, script);
        self.enqueue(action, event_tx, id);
    }

    /// spec §4.5 case 4: a freshly synthesized PM_LOG_IN preempts whatever
    /// is currently running — the preempted head's cursor resets so it
    /// replays from the start once login completes.
    fn enqueue(&mut self, action: DeviceAction, event_tx: &EventSender, id: DeviceId) {
        let was_empty = self.queue.is_empty();
        if action.command == CommandKind::LogIn {
            if let Some(head) = self.queue.front_mut() {
                head.script.reset();
            }
            self.queue.push_front(action);
        } else {
            self.queue.push_back(action);
        }
        if was_empty {
            let _ = event_tx.send((id, DeviceEvent::Busy));
        }
        self.pump(event_tx, id);
    }

    /// Expand a user-level target into the concrete, device-local targets
    /// this device's per-device action should run against — `set_targets` /
    /// `do_target_some` (spec §4.5 case 3). Returns an empty `Vec` when
    /// nothing on this device matches.
    ///
    /// REGEX-mode devices understand the selector natively, so it passes
    /// through verbatim as the single target. LITERAL-mode devices only
    /// understand plug names and the device's "all" token, so `target` is
    /// evaluated here as an extended POSIX regex, anchored to full-string
    /// equality, against every plug's node name: if every bound plug
    /// matches (and no plug is unbound), the whole device is addressed via
    /// its "all" token in one shot; otherwise each matching plug gets its
    /// own target, by device-local plug name, run one after another.
    fn resolve_targets(&self, target: Option<&str>) -> Vec<Option<String>> {
        let Some(target) = target else { return Vec::new() };
        match self.mode {
            TargetMode::Regex => vec![Some(target.to_string())],
            TargetMode::Literal => {
                let re = match Regex::new(target) {
                    Ok(re) => re,
                    Err(_) => {
                        tracing::warn!(device = %self.name, target, "target regex failed to compile");
                        return Vec::new();
                    }
                };
                let mut any = false;
                let mut all_bound_match = true;
                let mut matched_plug_names = Vec::new();
                for (_, plug) in self.plugs.iter() {
                    match &plug.node_name {
                        Some(name) => {
                            let is_match = re
                                .find(name)
                                .map(|m| m.start() == 0 && m.end() == name.len())
                                .unwrap_or(false);
                            if is_match {
                                any = true;
                                matched_plug_names.push(plug.name.clone());
                            } else {
                                all_bound_match = false;
                            }
                        }
                        None => all_bound_match = false,
                    }
                }
                if any && all_bound_match {
                    vec![Some(self.all_token.clone())]
                } else if any {
                    matched_plug_names.into_iter().map(Some).collect()
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Drive the head action's script as far as it can go without external
    /// input: runs SENDs into the outgoing buffer, resolves EXPECTs already
    /// satisfied by buffered bytes, fires elapsed DELAYs, and finishes
    /// actions whose script is exhausted — looping until it hits something
    /// that needs a socket-readiness or timer event to proceed.
    fn pump(&mut self, event_tx: &EventSender, id: DeviceId) {
        loop {
            let current = match self.queue.front().and_then(|a| a.script.current()) {
                Some(el) => el.clone(),
                None => {
                    match self.queue.front_mut() {
                        // One target's pass through the script is done but
                        // another is queued (spec §4.5 "one per-device
                        // action per matching plug"): replay the script
                        // against the next target rather than finishing.
                        Some(action) if action.has_next_target() => {
                            action.advance_target();
                            continue;
                        }
                        Some(_) => {
                            self.finish_head(event_tx, id);
                            continue;
                        }
                        None => return,
                    }
                }
            };
            match current {
                ScriptElement::Send { format } => {
                    if self.sending {
                        return;
                    }
                    let target = self.queue.front().and_then(|a| a.current_target().map(str::to_string));
                    self.outgoing.append_format(&format, target.as_deref());
                    self.sending = true;
                    return;
                }
                ScriptElement::Expect { completion, capture, map } => {
                    self.expecting = true;
                    match self.incoming.try_consume_regex(&completion) {
                        Some(consumed) => {
                            self.expecting = false;
                            self.last_progress = Instant::now();
                            self.apply_interpretation(&capture, &consumed, map.as_deref());
                            if let Some(action) = self.queue.front_mut() {
                                action.script.advance();
                            }
                        }
                        None => return,
                    }
                }
                ScriptElement::Delay { duration } => {
                    let deadline = *self.pending_delay_until.get_or_insert_with(|| Instant::now() + duration);
                    if Instant::now() >= deadline {
                        self.pending_delay_until = None;
                        if let Some(action) = self.queue.front_mut() {
                            action.script.advance();
                        }
                    } else {
                        return;
                    }
                }
            }
        }
    }

    fn finish_head(&mut self, event_tx: &EventSender, id: DeviceId) {
        let Some(action) = self.queue.pop_front() else { return };
        if action.command == CommandKind::LogIn && action.client.is_none() {
            self.loggedin = true;
        }
        let _ = event_tx.send((
            id,
            DeviceEvent::ActionDone {
                command: action.command,
                client: action.client,
                seq: action.seq,
                updates: action.node_updates,
            },
        ));
        if self.queue.is_empty() {
            let _ = event_tx.send((id, DeviceEvent::Idle));
        }
    }

    /// `Proxy` transports reply with a positional 0/1 vector (spec §4.4b,
    /// `do_PMD_semantics`): the whole consumed string, not a capture group,
    /// is the status vector, one character per plug in device-plug order.
    /// A length mismatch against this device's plug count is undefined in
    /// the original; SPEC_FULL §9 resolves it by discarding the update and
    /// marking every bound plug on this device UNKNOWN for this cycle.
    fn apply_interpretation(&mut self, capture: &Regex, consumed: &str, map: Option<&[Interpretation]>) {
        let Some(map) = map else { return };
        if self.transport == TransportKind::Proxy {
            let bits: &str = consumed.trim_end_matches(['\r', '\n']);
            let mut updates = Vec::new();
            if bits.len() != self.plugs.len() || !bits.bytes().all(|b| b == b'0' || b == b'1') {
                tracing::warn!(
                    device = %self.name,
                    expected = self.plugs.len(),
                    got = bits.len(),
                    "proxy status vector length mismatch, discarding update"
                );
                for (_, plug) in self.plugs.iter() {
                    if let Some(node) = plug.node {
                        updates.push((node, plug.role, PowerState::Unknown));
                    }
                }
            } else {
                for (ordinal, (_, plug)) in self.plugs.iter().enumerate() {
                    let Some(node) = plug.node else { continue };
                    let state = match bits.as_bytes()[ordinal] {
                        b'1' => PowerState::On,
                        b'0' => PowerState::Off,
                        _ => PowerState::Unknown,
                    };
                    updates.push((node, plug.role, state));
                }
            }
            if let Some(action) = self.queue.front_mut() {
                action.node_updates.extend(updates);
            }
            return;
        }
        let Some(caps) = capture.captures(consumed) else {
            tracing::warn!(device = %self.name, "EXPECT capture regex did not match consumed text");
            return;
        };
        let mut updates = Vec::new();
        for interp in map {
            let Some(group) = caps.get(interp.match_pos) else { continue };
            // Trim from the first whitespace character onward only — any
            // *leading* whitespace stays part of the probe tested against
            // the ON/OFF regexes (SPEC_FULL §4.3/4.4).
            let probe = trim_after_first_whitespace(group.as_str());
            let state = self.classify_power(probe);
            self.push_update(interp, state, &mut updates);
        }
        if let Some(action) = self.queue.front_mut() {
            action.node_updates.extend(updates);
        }
    }

    /// A null plug binding means "skip" (spec §4.4a).
    fn push_update(
        &self,
        interp: &Interpretation,
        state: PowerState,
        out: &mut Vec<(NodeHandle, PlugRole, PowerState)>,
    ) {
        let Some(handle) = interp.plug else { return };
        let Some(plug) = self.plugs.get(handle.0) else { return };
        let Some(node) = plug.node else { return };
        out.push((node, plug.role, state));
    }

    fn classify_power(&self, text: &str) -> PowerState {
        if self.on_re.is_match(text) {
            PowerState::On
        } else if self.off_re.is_match(text) {
            PowerState::Off
        } else {
            PowerState::Unknown
        }
    }
}

/// Drop everything from the first whitespace character onward, keeping any
/// *leading* whitespace intact — matches the original's `while (*end &&
/// !isspace(*end)...)` trailing trim exactly (SPEC_FULL §4.3/§4.4); a naive
/// `str::trim`/`split_whitespace` would also eat leading whitespace and
/// change what gets probed against the ON/OFF regexes.
fn trim_after_first_whitespace(s: &str) -> &str {
    match s.find(char::is_whitespace) {
        Some(idx) => &s[..idx],
        None => s,
    }
}

fn compile_script(
    device_name: &str,
    script_spec: &[ScriptElementSpec],
    plug_by_name: &IndexMap<String, PlugHandle>,
) -> Result<CompiledScript, ConfigError> {
    script_spec
        .iter()
        .map(|el| match el {
            ScriptElementSpec::Send { format } => Ok(ScriptElement::Send { format: format.clone() }),
            ScriptElementSpec::Delay { millis } => {
                Ok(ScriptElement::Delay { duration: Duration::from_millis(*millis) })
            }
            ScriptElementSpec::Expect { completion, capture, map } => {
                let completion_re = Regex::new(completion).map_err(|e| ConfigError::InvalidScriptRegex {
                    device: device_name.to_string(),
                    detail: e.to_string(),
                })?;
                let capture_re = Regex::new(capture).map_err(|e| ConfigError::InvalidScriptRegex {
                    device: device_name.to_string(),
                    detail: e.to_string(),
                })?;
                let interpretations = if map.is_empty() {
                    None
                } else {
                    Some(
                        map.iter()
                            .map(|i| Interpretation {
                                plug: plug_by_name.get(&i.plug_name).copied(),
                                match_pos: i.match_pos,
                            })
                            .collect(),
                    )
                };
                Ok(ScriptElement::Expect { completion: completion_re, capture: capture_re, map: interpretations })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterpretationSpec, PlugSpec, ScriptSpec};

    fn base_spec(mode: TargetMode, transport: TransportKind) -> DeviceSpec {
        DeviceSpec {
            name: "pdu0".to_string(),
            transport,
            host: "127.0.0.1".to_string(),
            service: "0".to_string(),
            mode,
            all_token: "all".to_string(),
            on_regex: "^ON$".to_string(),
            off_regex: "^OFF$".to_string(),
            expect_timeout_ms: Some(50),
            plugs: vec![
                PlugSpec { name: "1".to_string(), node: Some("node1".to_string()) },
                PlugSpec { name: "2".to_string(), node: Some("node2".to_string()) },
            ],
            scripts: vec![],
        }
    }

    #[test]
    fn literal_mode_all_token_addresses_every_plug_at_once() {
        let spec = base_spec(TargetMode::Literal, TransportKind::Tcp);
        let dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        // Every plug is bound and every plug's node name matches this
        // selector, so `resolve_targets` collapses to the device's "all"
        // token in a single target (spec §4.5 "all" branch) — R2.
        assert_eq!(dev.resolve_targets(Some("node[12]")), vec![Some("all".to_string())]);
    }

    #[test]
    fn literal_mode_partial_match_targets_each_matching_plug_by_device_local_name() {
        let spec = base_spec(TargetMode::Literal, TransportKind::Tcp);
        let dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        // Only node1 matches; not every bound plug does, so this is the
        // "any but not all" branch — one target per matching plug, named by
        // the device's own plug name, not the node selector (R3).
        assert_eq!(dev.resolve_targets(Some("node1")), vec![Some("1".to_string())]);
    }

    #[test]
    fn literal_mode_no_match_yields_no_targets() {
        let spec = base_spec(TargetMode::Literal, TransportKind::Tcp);
        let dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        assert!(dev.resolve_targets(Some("node9")).is_empty());
    }

    #[test]
    fn regex_mode_passes_the_selector_through_verbatim() {
        let spec = base_spec(TargetMode::Regex, TransportKind::Tcp);
        let dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        assert_eq!(dev.resolve_targets(Some("node1")), vec![Some("node1".to_string())]);
    }

    #[test]
    fn duplicate_plug_name_is_rejected() {
        let mut spec = base_spec(TargetMode::Literal, TransportKind::Tcp);
        spec.plugs.push(PlugSpec { name: "1".to_string(), node: None });
        assert!(matches!(
            Device::new(&spec, Duration::from_secs(1), false),
            Err(ConfigError::DuplicatePlug { .. })
        ));
    }

    #[test]
    fn enqueue_login_preempts_head_and_resets_its_cursor() {
        let mut spec = base_spec(TargetMode::Literal, TransportKind::Tcp);
        spec.scripts.push((
            CommandKind::PowerOn,
            vec![ScriptElementSpec::Send { format: "on %s\r\n".to_string() }],
        ));
        spec.scripts.push((
            CommandKind::LogIn,
            vec![ScriptElementSpec::Send { format: "login\r\n".to_string() }],
        ));
        let mut dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let power_on = DeviceAction::new(
            CommandKind::PowerOn,
            Some(7),
            1,
            vec![Some("1".to_string())],
            dev.scripts.get(&CommandKind::PowerOn).unwrap().clone(),
        );
        dev.enqueue(power_on, &tx, 0);
        assert_eq!(dev.outgoing.peek(dev.outgoing.len()), b"on 1\r\n");

        let login = DeviceAction::new(CommandKind::LogIn, None, 0, vec![None], dev.scripts.get(&CommandKind::LogIn).unwrap().clone());
        dev.enqueue(login, &tx, 0);

        // Login preempted PowerOn: login's SEND is now what's queued to go out.
        assert_eq!(dev.queue.front().unwrap().command, CommandKind::LogIn);
        assert_eq!(dev.queue.back().unwrap().command, CommandKind::PowerOn);
        assert!(dev.queue.back().unwrap().script.current().is_some());

        let _ = rx.try_recv();
    }

    #[test]
    fn pump_runs_send_then_completes_on_buffered_expect() {
        let mut spec = base_spec(TargetMode::Literal, TransportKind::Tcp);
        spec.scripts.push((
            CommandKind::PowerOn,
            vec![
                ScriptElementSpec::Send { format: "on %s\r\n".to_string() },
                ScriptElementSpec::Expect {
                    completion: r"^(ON|OFF)\r\n".to_string(),
                    capture: r"^(ON|OFF)\r\n".to_string(),
                    map: vec![InterpretationSpec { plug_name: "1".to_string(), match_pos: 1 }],
                },
            ],
        ));
        let mut dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        dev.bind_plug(dev.plug_handle("1").unwrap(), NodeHandle(0), PlugRole::Hard);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let action = DeviceAction::new(
            CommandKind::PowerOn,
            Some(1),
            5,
            vec![Some("1".to_string())],
            dev.scripts.get(&CommandKind::PowerOn).unwrap().clone(),
        );
        dev.enqueue(action, &tx, 3);
        assert_eq!(dev.outgoing.peek(dev.outgoing.len()), b"on 1\r\n");
        assert!(matches!(rx.try_recv(), Ok((3, DeviceEvent::Busy))));

        // Simulate the write completing, then the reply arriving.
        dev.outgoing.drain_for_write(dev.outgoing.len());
        dev.sending = false;
        if let Some(a) = dev.queue.front_mut() {
            a.script.advance();
        }
        dev.pump(&tx, 3);
        dev.incoming.append_raw(b"ON\r\n");
        dev.pump(&tx, 3);

        match rx.try_recv() {
            Ok((3, DeviceEvent::ActionDone { command, updates, .. })) => {
                assert_eq!(command, CommandKind::PowerOn);
                assert_eq!(updates, vec![(NodeHandle(0), PlugRole::Hard, PowerState::On)]);
            }
            other => panic!("expected ActionDone, got {other:?}"),
        }
        assert!(matches!(rx.try_recv(), Ok((3, DeviceEvent::Idle))));
    }

    #[test]
    fn trim_after_first_whitespace_keeps_leading_whitespace() {
        // SPEC_FULL §4.3/§4.4: trailing content after the first whitespace
        // is dropped before probing ON/OFF, but leading whitespace is kept
        // as part of the probe — a plain `split_whitespace`/`trim` would
        // get this wrong.
        assert_eq!(trim_after_first_whitespace("ON trailing junk"), "ON");
        assert_eq!(trim_after_first_whitespace(" ON"), " ON");
        assert_eq!(trim_after_first_whitespace("OFF"), "OFF");
    }

    #[test]
    fn capture_trims_trailing_content_after_first_whitespace_before_classifying() {
        let mut spec = base_spec(TargetMode::Literal, TransportKind::Tcp);
        spec.scripts.push((
            CommandKind::PowerOn,
            vec![
                ScriptElementSpec::Send { format: "on %s\r\n".to_string() },
                ScriptElementSpec::Expect {
                    completion: r"^.*\r\n".to_string(),
                    capture: r"^(.*)\r\n".to_string(),
                    map: vec![InterpretationSpec { plug_name: "1".to_string(), match_pos: 1 }],
                },
            ],
        ));
        let mut dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        dev.bind_plug(dev.plug_handle("1").unwrap(), NodeHandle(0), PlugRole::Hard);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let action = DeviceAction::new(
            CommandKind::PowerOn,
            Some(1),
            5,
            vec![Some("1".to_string())],
            dev.scripts.get(&CommandKind::PowerOn).unwrap().clone(),
        );
        dev.enqueue(action, &tx, 3);
        dev.outgoing.drain_for_write(dev.outgoing.len());
        dev.sending = false;
        if let Some(a) = dev.queue.front_mut() {
            a.script.advance();
        }
        // "ON since 12:04" would fail `^ON$` untrimmed; trimming at the
        // first whitespace leaves exactly "ON".
        dev.incoming.append_raw(b"ON since 12:04\r\n");
        dev.pump(&tx, 3);

        match rx.try_recv() {
            Ok((3, DeviceEvent::ActionDone { updates, .. })) => {
                assert_eq!(updates, vec![(NodeHandle(0), PlugRole::Hard, PowerState::On)]);
            }
            other => panic!("expected ActionDone, got {other:?}"),
        }
    }

    #[test]
    fn proxy_transport_decodes_positional_vector() {
        let mut spec = base_spec(TargetMode::Regex, TransportKind::Proxy);
        spec.scripts.push((
            CommandKind::UpdatePlugs,
            vec![
                ScriptElementSpec::Send { format: "stat\r\n".to_string() },
                ScriptElementSpec::Expect {
                    completion: r"^.*\r\n".to_string(),
                    capture: r"^(.*)\r\n".to_string(),
                    map: vec![
                        InterpretationSpec { plug_name: "1".to_string(), match_pos: 0 },
                        InterpretationSpec { plug_name: "2".to_string(), match_pos: 1 },
                    ],
                },
            ],
        ));
        let mut dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        dev.bind_plug(dev.plug_handle("1").unwrap(), NodeHandle(0), PlugRole::Hard);
        dev.bind_plug(dev.plug_handle("2").unwrap(), NodeHandle(1), PlugRole::Hard);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let action = DeviceAction::new(
            CommandKind::UpdatePlugs,
            None,
            9,
            vec![None],
            dev.scripts.get(&CommandKind::UpdatePlugs).unwrap().clone(),
        );
        dev.enqueue(action, &tx, 0);
        dev.outgoing.drain_for_write(dev.outgoing.len());
        dev.sending = false;
        if let Some(a) = dev.queue.front_mut() {
            a.script.advance();
        }
        // R1: a contiguous "10" for two plugs in device-plug order.
        dev.incoming.append_raw(b"10\r\n");
        dev.pump(&tx, 0);

        let _ = rx.try_recv(); // Busy
        match rx.try_recv() {
            Ok((0, DeviceEvent::ActionDone { updates, .. })) => {
                assert_eq!(
                    updates,
                    vec![
                        (NodeHandle(0), PlugRole::Hard, PowerState::On),
                        (NodeHandle(1), PlugRole::Hard, PowerState::Off),
                    ]
                );
            }
            other => panic!("expected ActionDone, got {other:?}"),
        }
    }

    #[test]
    fn proxy_length_mismatch_discards_update_and_marks_bound_plugs_unknown() {
        let mut spec = base_spec(TargetMode::Regex, TransportKind::Proxy);
        spec.scripts.push((
            CommandKind::UpdatePlugs,
            vec![
                ScriptElementSpec::Send { format: "stat\r\n".to_string() },
                ScriptElementSpec::Expect {
                    completion: r"^.*\r\n".to_string(),
                    capture: r"^(.*)\r\n".to_string(),
                    map: vec![InterpretationSpec { plug_name: "1".to_string(), match_pos: 0 }],
                },
            ],
        ));
        let mut dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        dev.bind_plug(dev.plug_handle("1").unwrap(), NodeHandle(0), PlugRole::Hard);
        dev.bind_plug(dev.plug_handle("2").unwrap(), NodeHandle(1), PlugRole::Hard);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let action = DeviceAction::new(
            CommandKind::UpdatePlugs,
            None,
            9,
            vec![None],
            dev.scripts.get(&CommandKind::UpdatePlugs).unwrap().clone(),
        );
        dev.enqueue(action, &tx, 0);
        dev.outgoing.drain_for_write(dev.outgoing.len());
        dev.sending = false;
        if let Some(a) = dev.queue.front_mut() {
            a.script.advance();
        }
        // Device has 2 plugs but the proxy only reports 1 bit: a mismatch
        // per spec §9, discarded entirely rather than partially applied.
        dev.incoming.append_raw(b"1\r\n");
        dev.pump(&tx, 0);

        let _ = rx.try_recv(); // Busy
        match rx.try_recv() {
            Ok((0, DeviceEvent::ActionDone { updates, .. })) => {
                assert_eq!(
                    updates,
                    vec![
                        (NodeHandle(0), PlugRole::Hard, PowerState::Unknown),
                        (NodeHandle(1), PlugRole::Hard, PowerState::Unknown),
                    ]
                );
            }
            other => panic!("expected ActionDone, got {other:?}"),
        }
    }

    #[test]
    fn literal_any_not_all_fanout_reports_once_after_every_plug_runs() {
        // Two plugs, both bound, but the selector only matches one of them:
        // spec §4.5's "any but not all" branch enqueues one per-device
        // action per matching plug inside a single `DeviceAction` — the
        // device must still emit exactly one Busy and one ActionDone for
        // the seq, after replaying the script once per target.
        let mut spec = base_spec(TargetMode::Literal, TransportKind::Tcp);
        spec.plugs.push(PlugSpec { name: "3".to_string(), node: Some("node13".to_string()) });
        spec.scripts.push((
            CommandKind::PowerOn,
            vec![
                ScriptElementSpec::Send { format: "on %s\r\n".to_string() },
                ScriptElementSpec::Expect {
                    completion: r"^OK\r\n".to_string(),
                    capture: r"^OK\r\n".to_string(),
                    map: vec![],
                },
            ],
        ));
        let dev = Device::new(&spec, Duration::from_secs(1), false).unwrap();
        // "node1" and "node13" both match the anchored-full-match regex
        // `node1.?` against this device's three plug names, but "node2"
        // does not — any, not all.
        let targets = dev.resolve_targets(Some("node1.?"));
        assert_eq!(targets, vec![Some("1".to_string()), Some("3".to_string())]);

        let mut dev = dev;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let action = DeviceAction::new(
            CommandKind::PowerOn,
            Some(1),
            11,
            targets,
            dev.scripts.get(&CommandKind::PowerOn).unwrap().clone(),
        );
        dev.enqueue(action, &tx, 0);
        assert!(matches!(rx.try_recv(), Ok((0, DeviceEvent::Busy))));
        assert_eq!(dev.outgoing.peek(dev.outgoing.len()), b"on 1\r\n");

        // First target's SEND+EXPECT completes...
        dev.outgoing.drain_for_write(dev.outgoing.len());
        dev.sending = false;
        if let Some(a) = dev.queue.front_mut() {
            a.script.advance();
        }
        dev.incoming.append_raw(b"OK\r\n");
        dev.pump(&tx, 0);
        // ...which replays the script against the second target rather
        // than finishing the action.
        assert_eq!(dev.outgoing.peek(dev.outgoing.len()), b"on 3\r\n");
        assert!(rx.try_recv().is_err(), "no report until every target has run");

        dev.outgoing.drain_for_write(dev.outgoing.len());
        dev.sending = false;
        if let Some(a) = dev.queue.front_mut() {
            a.script.advance();
        }
        dev.incoming.append_raw(b"OK\r\n");
        dev.pump(&tx, 0);

        assert!(matches!(rx.try_recv(), Ok((0, DeviceEvent::ActionDone { .. }))));
        assert!(matches!(rx.try_recv(), Ok((0, DeviceEvent::Idle))));
    }
}
