// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The central task (C8): owns `Cluster`, the global `ActionQueue`, and
//! every device task's control handle. Everything else in this crate is
//! driven by, or reports into, this one `tokio::select!` loop — the only
//! place `Cluster` and the queue are ever mutated (spec §5). Background-loop
//! shape grounded on `crates/mux/src/upstream/health.rs` and
//! `crates/mux/src/upstream/poller.rs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::action::{Action, ClientId, CommandKind, CompletedAction, Seq};
use crate::cluster::{Cluster, PowerState};
use crate::device::{Device, DeviceCommand, DeviceEvent, DeviceId, PlugRole};
use crate::dispatcher::{DeviceHandle, Dispatcher, FinishedAction};
use crate::error::{EngineError, EngineErrorKind};
use crate::queue::ActionQueue;

/// Delivers a finished action's result back out of the engine, and answers
/// whether a given client is still around to receive one. Implemented by
/// whatever owns the (out-of-scope) client listener; the engine never
/// assumes anything about transport.
pub trait ClientSink: Send + Sync {
    fn reply(&self, completed: CompletedAction);
    fn is_connected(&self, client: ClientId) -> bool;
}

/// Cheap, cloneable front door onto a running `Engine`. Every client-facing
/// submission and the shutdown signal both go through here — the engine
/// task itself is never touched directly once spawned.
#[derive(Clone)]
pub struct EngineHandle {
    submit_tx: mpsc::UnboundedSender<Action>,
    shutdown: CancellationToken,
    next_seq: Arc<AtomicU64>,
}

impl EngineHandle {
    /// Allocate the next client-originated sequence number. Starts at 1;
    /// internally generated actions always use `seq: 0` (spec §4.6), so the
    /// two numbering spaces never collide.
    pub fn next_seq(&self) -> Seq {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn submit(&self, action: Action) -> Result<(), EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::new(EngineErrorKind::ShuttingDown, "engine is shutting down"));
        }
        // seq 0 is reserved for internally generated actions (spec §4.6);
        // a client-originated action claiming it would collide with the
        // dispatcher's global in-flight bookkeeping.
        if action.client.is_some() && action.seq == 0 {
            return Err(EngineError::new(
                EngineErrorKind::Invariant,
                "client-originated action must not use seq 0",
            ));
        }
        self.submit_tx
            .send(action)
            .map_err(|_| EngineError::new(EngineErrorKind::ShuttingDown, "engine task has exited"))
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct Engine {
    cluster: Cluster,
    queue: ActionQueue,
    dispatcher: Dispatcher,
    sink: Arc<dyn ClientSink>,
    submit_rx: mpsc::UnboundedReceiver<Action>,
    event_rx: mpsc::UnboundedReceiver<(DeviceId, DeviceEvent)>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Spawn one task per device (each on this same current-thread runtime —
    /// spec §5's "no worker threads" is about OS threads, not tokio tasks),
    /// wire their control/event channels, and hand back the `Engine` ready
    /// to `run()` plus the handle clients submit actions through.
    pub fn build(cluster: Cluster, devices: Vec<Device>, sink: Arc<dyn ClientSink>) -> (Self, EngineHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut handles = Vec::with_capacity(devices.len());
        for (id, device) in devices.into_iter().enumerate() {
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let name = device.name.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(device.run(id, control_rx, event_tx));
            handles.push(DeviceHandle { name, control_tx });
        }

        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let engine = Self {
            cluster,
            queue: ActionQueue::new(),
            dispatcher: Dispatcher::new(handles),
            sink,
            submit_rx,
            event_rx,
            shutdown: shutdown.clone(),
        };
        let handle = EngineHandle { submit_tx, shutdown, next_seq: Arc::new(AtomicU64::new(0)) };
        (engine, handle)
    }

    /// The loop itself. Runs until `EngineHandle::request_shutdown` is
    /// called or every client handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.cluster.update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    self.dispatcher.shutdown();
                    break;
                }

                _ = ticker.tick() => {
                    self.on_update_tick();
                }

                action = self.submit_rx.recv() => {
                    match action {
                        None => break,
                        Some(action) => {
                            self.queue.push(action);
                            self.advance_queue();
                        }
                    }
                }

                event = self.event_rx.recv() => {
                    match event {
                        None => break,
                        Some((id, event)) => {
                            self.handle_device_event(id, event);
                            self.advance_queue();
                        }
                    }
                }
            }
        }

        tracing::info!("engine task shutting down");
    }

    /// Retry any not-yet-connected devices (spec §4.3: reconnection rides
    /// the update timer's clock, never its own), and enqueue a fresh
    /// UPDATE_PLUGS/UPDATE_NODES pair once `update_interval` has elapsed
    /// since the last one (spec §4.6).
    fn on_update_tick(&mut self) {
        self.dispatcher.retry_connections();

        let now = std::time::Instant::now();
        if self.cluster.refresh_due(now) {
            self.cluster.mark_refreshed(now);
            self.queue.push(Action::new(CommandKind::UpdatePlugs, None, 0));
            self.queue.push(Action::new(CommandKind::UpdateNodes, None, 0));
        }

        self.advance_queue();
    }

    /// Pop and dispatch queued actions while the dispatcher is quiescent —
    /// at most one global action is ever in flight (spec §4.6). Informational
    /// commands never touch a device and resolve in the same pass.
    fn advance_queue(&mut self) {
        let sink = Arc::clone(&self.sink);
        while self.dispatcher.is_quiescent() {
            let Some(action) = self.queue.pop_ready(|client| sink.is_connected(client)) else {
                return;
            };

            if action.command.is_informational() {
                self.answer_informational(&action);
                continue;
            }

            match self.dispatcher.dispatch(&action) {
                Some(finished) => self.finish_action(finished),
                None => return,
            }
        }
    }

    /// Internally generated actions (`client: None`) never reach a reply
    /// step at all — there is no client to tell (spec §3 invariant).
    fn answer_informational(&self, action: &Action) {
        let Some(client) = action.client else { return };
        let node_states = if action.command == CommandKind::Names {
            self.cluster
                .iter()
                .map(|(_, node)| (node.name.clone(), node.plug_state, node.node_state))
                .collect()
        } else {
            Vec::new()
        };
        self.sink.reply(CompletedAction { command: action.command, seq: action.seq, client, node_states });
    }

    fn handle_device_event(&mut self, id: DeviceId, event: DeviceEvent) {
        match event {
            DeviceEvent::Busy | DeviceEvent::Idle => {}
            DeviceEvent::Skipped { command, seq } => {
                // PM_LOG_IN is always device-internal (synthesized directly
                // by the device, never routed through the dispatcher) and
                // always carries seq 0 — the same seq internally generated
                // UPDATE_* actions use. It must never be mistaken for a
                // report against a genuine in-flight global action.
                if command == CommandKind::LogIn {
                    return;
                }
                if let Some(finished) = self.dispatcher.record_skip(seq) {
                    self.finish_action(finished);
                }
            }
            DeviceEvent::ActionDone { command, seq, updates, .. } => {
                self.apply_updates(&updates);
                if command == CommandKind::LogIn {
                    return;
                }
                // Resolve handles to names here, not in the dispatcher — only
                // `Engine` owns the `Cluster` needed to do it.
                let node_states = updates
                    .iter()
                    .filter_map(|(handle, _, _)| {
                        self.cluster.get(*handle).map(|node| (node.name.clone(), node.plug_state, node.node_state))
                    })
                    .collect::<Vec<_>>();
                if let Some(finished) = self.dispatcher.record_done(seq, node_states) {
                    self.finish_action(finished);
                }
            }
            DeviceEvent::ConnectionLost { invalidated } => {
                tracing::warn!(device = %self.dispatcher.device_name(id).unwrap_or("?"), "connection lost");
                self.invalidate_nodes(&invalidated);
            }
        }
    }

    /// spec §7: a device dropping its connection (EOF, reset, or a stalled
    /// EXPECT) invalidates every node it has a plug bound to, in both
    /// states, regardless of which one this device actually drives for
    /// that node.
    fn invalidate_nodes(&mut self, nodes: &[crate::cluster::NodeHandle]) {
        for handle in nodes {
            if let Some(node) = self.cluster.get_mut(*handle) {
                node.plug_state = PowerState::Unknown;
                node.node_state = PowerState::Unknown;
            }
        }
    }

    /// Fold EXPECT-captured `(node, role, state)` observations into the
    /// cluster (spec §4.4) — the only place `Node::plug_state`/`node_state`
    /// are ever written.
    fn apply_updates(&mut self, updates: &[(crate::cluster::NodeHandle, PlugRole, PowerState)]) {
        for (handle, role, state) in updates {
            if let Some(node) = self.cluster.get_mut(*handle) {
                match role {
                    PlugRole::Hard => node.plug_state = *state,
                    PlugRole::Soft => node.node_state = *state,
                }
            }
        }
    }

    /// Deliver the reply for a fanned-out global action — unless its client
    /// was never there (internally generated refresh) or vanished while the
    /// fanout was still in flight (spec §3/§8 I5: zero-or-one reply, zero
    /// iff the client disappeared first).
    fn finish_action(&self, finished: FinishedAction) {
        let Some(client) = finished.client else { return };
        if !self.sink.is_connected(client) {
            tracing::debug!(seq = finished.seq, "client disappeared mid-flight, suppressing reply");
            return;
        }
        self.sink.reply(CompletedAction {
            command: finished.command,
            seq: finished.seq,
            client,
            node_states: finished.node_states,
        });
    }
}
