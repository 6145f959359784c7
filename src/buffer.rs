// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fixed-capacity byte buffer attached to a device socket (C1, spec §4.1).
//! Grounded on the *contract* `original_source/src/device.c` assumes of its
//! (unretrieved) `buffer.c`: `get_String_from_Buffer`, `peek_string_Buffer`,
//! `send_Buffer`, `clear_Buffer`, `is_empty_Buffer`. The original's raw
//! `_buflogfun_to/_buflogfun_from` callback-with-`void*` telemetry hook is
//! replaced with `tracing::trace!` spans, keyed on the device name.

use bytes::{Buf, BytesMut};
use regex::Regex;

/// Matches `original_source/src/config.h`'s `MAX_BUF` sizing discipline —
/// devices are slow, chatty text terminals, not high-throughput streams.
pub const MAX_BUF: usize = 8192;

/// A bidirectional line buffer. One instance is the outgoing queue, another
/// the incoming queue, for a given device's socket.
#[derive(Debug)]
pub struct LineBuffer {
    data: BytesMut,
    capacity: usize,
    logit: bool,
    device: String,
    direction: &'static str,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { data: BytesMut::with_capacity(capacity), capacity, logit: false, device: String::new(), direction: "" }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(MAX_BUF)
    }

    /// Turn on per-chunk trace telemetry for this buffer (spec §4.1,
    /// `--logit`/`PDUD_LOGIT`): the original's `_buflogfun_to`/
    /// `_buflogfun_from` callback, replaced with `tracing::trace!` spans
    /// keyed on `device` and `direction` ("to"/"from" the device).
    pub fn enable_logit(&mut self, device: impl Into<String>, direction: &'static str) {
        self.logit = true;
        self.device = device.into();
        self.direction = direction;
    }

    /// Format `fmt` with at most one `%s` substitution (the single `arg`,
    /// if any) and enqueue the result. Matches spec §4.1's `append_format`.
    /// Silently truncates at capacity rather than growing unbounded — a
    /// device that floods past `MAX_BUF` without a recognizable completion
    /// is already a protocol-desync condition the EXPECT timeout will
    /// catch (spec §7).
    pub fn append_format(&mut self, fmt: &str, arg: Option<&str>) {
        let rendered = match arg {
            Some(a) => fmt.replacen("%s", a, 1),
            None => fmt.to_string(),
        };
        self.append_raw(rendered.as_bytes());
    }

    pub fn append_raw(&mut self, bytes: &[u8]) {
        let room = self.capacity.saturating_sub(self.data.len());
        let take = bytes.len().min(room);
        self.data.extend_from_slice(&bytes[..take]);
        if self.logit {
            tracing::trace!(
                device = %self.device,
                direction = self.direction,
                bytes = take,
                chunk = %String::from_utf8_lossy(&bytes[..take]),
                "buffer chunk appended"
            );
        }
    }

    /// If `completion_re` matches a prefix of the buffered bytes, consume
    /// and return that prefix as an owned string, atomically — on no
    /// match the buffer is left completely intact (spec §4.1 guarantee).
    pub fn try_consume_regex(&mut self, completion_re: &Regex) -> Option<String> {
        let text = String::from_utf8_lossy(&self.data);
        let m = completion_re.find(&text)?;
        if m.start() != 0 {
            // Only a prefix match counts as "complete"; garbage preceding
            // the match means the buffer is not yet resolvable.
            return None;
        }
        let consumed_len = m.end();
        let consumed = text[..consumed_len].to_string();
        self.data.advance(consumed_len);
        Some(consumed)
    }

    /// Non-destructive inspection, for telemetry only.
    pub fn peek(&self, n: usize) -> &[u8] {
        let take = n.min(self.data.len());
        &self.data[..take]
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Drain up to `n` bytes for writing to the socket; used by the
    /// writable-readiness handler (`device::Device::handle_writable`).
    pub fn drain_for_write(&mut self, n: usize) -> BytesMut {
        let take = n.min(self.data.len());
        let chunk = self.data.split_to(take);
        if self.logit {
            tracing::trace!(
                device = %self.device,
                direction = self.direction,
                bytes = take,
                chunk = %String::from_utf8_lossy(&chunk),
                "buffer chunk drained"
            );
        }
        chunk
    }
}
