// ABOUTME: Line-buffering Server-Sent Events decoder for streamed generation responses
// ABOUTME: Reassembles lines split across TCP reads and emits every event in a read
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

//! # SSE Stream Decoding
//!
//! `reqwest` hands back the response body as arbitrary byte chunks. SSE framing
//! is line based, so a chunk may hold several events or end halfway through a
//! JSON payload (or halfway through a UTF-8 sequence). [`SseLineBuffer`] keeps
//! the unterminated tail between reads and [`decode_sse_stream`] turns the byte
//! stream into a [`FragmentStream`] using a client-supplied payload decoder.

use std::mem;

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use super::{Fragment, FragmentStream};
use crate::errors::AppError;

/// A decoded SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` field, prefix removed
    Data(String),
    /// `data: [DONE]` end-of-stream marker
    Done,
}

/// Accumulates raw bytes until complete lines are available
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a network read and return the events completed by it
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Drain whatever is left once the body has ended without a final newline
    pub fn flush(&mut self) -> Option<SseEvent> {
        let rest = mem::take(&mut self.pending);
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();

    // Blank separators, comments and non-data fields (event:, id:, retry:)
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(data.to_owned()))
}

/// Wrap an HTTP body stream into a stream of generation fragments.
///
/// `decode` maps one `data:` payload to a fragment; returning `None` skips the
/// event (metadata-only payloads). A decode error ends the stream after it is
/// yielded. Fragments with empty text are dropped unless they carry a finish
/// reason.
pub fn decode_sse_stream<S, F>(body: S, decode: F, client_name: &'static str) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    F: Fn(&str) -> Option<Result<Fragment, AppError>> + Send + 'static,
{
    let fragments = stream! {
        let mut body = Box::pin(body);
        let mut buffer = SseLineBuffer::new();

        'read: loop {
            let (events, body_done) = match body.next().await {
                Some(Ok(bytes)) => (buffer.feed(&bytes), false),
                Some(Err(e)) => {
                    yield Err(AppError::upstream_unavailable(format!(
                        "{client_name} stream read failed: {e}"
                    )));
                    break 'read;
                }
                None => (buffer.flush().into_iter().collect(), true),
            };

            for event in events {
                match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Data(payload) => match decode(&payload) {
                        Some(Ok(fragment)) => {
                            if !fragment.text.is_empty() || fragment.finish_reason.is_some() {
                                yield Ok(fragment);
                            }
                        }
                        Some(Err(e)) => {
                            yield Err(e);
                            break 'read;
                        }
                        None => {}
                    },
                }
            }

            if body_done {
                break 'read;
            }
        }
    };

    Box::pin(fragments)
}
