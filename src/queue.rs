// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The global action queue (C6). Grounded on
//! `original_source/src/action.c` (`act_add`, `act_find`,
//! `act_del_queuehead`): a plain FIFO, except that the engine must never
//! dispatch (or keep sitting on) an action whose requesting client has
//! since disconnected — nobody is left to receive the reply.

use std::collections::VecDeque;

use crate::action::{Action, ClientId};

#[derive(Default)]
pub struct ActionQueue {
    items: VecDeque<Action>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self { items: VecDeque::new() }
    }

    pub fn push(&mut self, action: Action) {
        self.items.push_back(action);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Pop and discard actions at the head whose client has disconnected
    /// (spec §8 "client abort"), returning the first surviving action —
    /// internally generated actions (`client: None`) always survive.
    /// `is_alive` is never asked about `None`.
    pub fn pop_ready(&mut self, is_alive: impl Fn(ClientId) -> bool) -> Option<Action> {
        while let Some(action) = self.items.front() {
            match action.client {
                Some(client) if !is_alive(client) => {
                    let dropped = self.items.pop_front();
                    tracing::debug!(
                        seq = dropped.as_ref().map(|a| a.seq).unwrap_or_default(),
                        "discarding action for disconnected client"
                    );
                }
                _ => return self.items.pop_front(),
            }
        }
        None
    }

    pub fn front(&self) -> Option<&Action> {
        self.items.front()
    }
}
