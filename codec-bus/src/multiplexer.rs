//! Turns a codec's asynchronous notifications into pollable state.
//!
//! Notifications arrive on a channel that is drained by a dedicated thread.
//! Input indices and output entries are kept in two FIFO queues; every
//! entry carries the sequence number it was delivered with so the global
//! delivery order is still observable through [`EventMultiplexer::dequeue_next`].
//!
//! A flush posts a marker behind everything the codec has already sent. Until
//! the worker reaches that marker the queues report nothing, and when it does
//! they are cleared, so nothing delivered before the flush survives it.

use std::{
    collections::VecDeque,
    sync::{Arc, mpsc},
    thread::JoinHandle,
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{CodecEvent, CodecEventSender, Notification},
    error::{AdapterError, AdapterResult, CodecError},
    types::{BufferInfo, FORMAT_CHANGED, FormatDescriptor, NO_BUFFER},
};

enum OutputEntry {
    Buffer(i32, BufferInfo),
    FormatChanged(FormatDescriptor),
}

#[derive(Default)]
struct MuxState {
    next_seq: u64,
    inputs: VecDeque<(u64, i32)>,
    outputs: VecDeque<(u64, OutputEntry)>,
    current_format: Option<FormatDescriptor>,
    // last format that was flushed away before anyone dequeued it
    pending_output_format: Option<FormatDescriptor>,
    error: Option<CodecError>,
    pending_flush_count: u32,
    shut_down: bool,
}

impl MuxState {
    fn on_event(&mut self, event: CodecEvent) {
        if self.shut_down {
            return;
        }
        match event {
            CodecEvent::InputAvailable(index) => {
                let seq = self.next_seq();
                self.inputs.push_back((seq, index));
            }
            CodecEvent::OutputAvailable(index, info) => {
                if let Some(format) = self.pending_output_format.take() {
                    self.add_output_format(format);
                }
                let seq = self.next_seq();
                self.outputs.push_back((seq, OutputEntry::Buffer(index, info)));
            }
            CodecEvent::FormatChanged(format) => {
                self.add_output_format(format);
                self.pending_output_format = None;
            }
            CodecEvent::Error(error) => {
                log::error!("codec reported error: {}", error);
                if self.error.is_none() {
                    self.error = Some(error);
                }
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn add_output_format(&mut self, format: FormatDescriptor) {
        let seq = self.next_seq();
        self.outputs
            .push_back((seq, OutputEntry::FormatChanged(format)));
    }

    fn on_flush_completed(&mut self) {
        if self.shut_down {
            return;
        }
        self.pending_flush_count = self.pending_flush_count.saturating_sub(1);
        if self.pending_flush_count > 0 {
            return;
        }
        self.flush_internal();
    }

    fn flush_internal(&mut self) {
        let last_format = self.outputs.iter().rev().find_map(|(_, entry)| match entry {
            OutputEntry::FormatChanged(format) => Some(format.clone()),
            OutputEntry::Buffer(..) => None,
        });
        if last_format.is_some() {
            self.pending_output_format = last_format;
        }
        self.inputs.clear();
        self.outputs.clear();
    }

    fn is_flushing_or_shut_down(&self) -> bool {
        self.pending_flush_count > 0 || self.shut_down
    }

    fn check_error(&self) -> AdapterResult<()> {
        match &self.error {
            Some(error) => Err(AdapterError::CodecRuntime(error.clone())),
            None => Ok(()),
        }
    }

    fn take_output(&mut self, info: &mut BufferInfo) -> Option<i32> {
        let (_, entry) = self.outputs.pop_front()?;
        match entry {
            OutputEntry::Buffer(index, buffer_info) => {
                info.set(&buffer_info);
                Some(index)
            }
            OutputEntry::FormatChanged(format) => {
                self.current_format = Some(format);
                Some(FORMAT_CHANGED)
            }
        }
    }
}

pub struct EventMultiplexer {
    label: String,
    state: Arc<Mutex<MuxState>>,
    sender: Mutex<Option<CodecEventSender>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl EventMultiplexer {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Arc::new(Mutex::new(MuxState::default())),
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the worker thread and returns the sender the codec publishes into.
    pub fn start(&self) -> AdapterResult<CodecEventSender> {
        let mut sender_slot = self.sender.lock();
        if sender_slot.is_some() || self.state.lock().shut_down {
            return Err(AdapterError::usage(format!(
                "event multiplexer {} already started",
                self.label
            )));
        }

        let (tx, rx) = mpsc::channel::<Notification>();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let handle = std::thread::Builder::new()
            .name(self.label.clone())
            .spawn(move || Self::event_loop(state, rx, cancel))
            .map_err(|e| {
                AdapterError::Configuration(CodecError::fatal(
                    crate::error::ERROR_INSUFFICIENT_RESOURCE,
                    format!("failed to spawn callback thread: {}", e),
                ))
            })?;
        log::debug!("event multiplexer {} started", self.label);

        let sender = CodecEventSender::new(tx);
        *sender_slot = Some(sender.clone());
        *self.worker.lock() = Some(handle);
        Ok(sender)
    }

    fn event_loop(
        state: Arc<Mutex<MuxState>>,
        rx: mpsc::Receiver<Notification>,
        cancel: CancellationToken,
    ) {
        while let Ok(notification) = rx.recv() {
            if cancel.is_cancelled() {
                break;
            }
            match notification {
                Notification::Event(event) => state.lock().on_event(event),
                Notification::FlushCompleted => state.lock().on_flush_completed(),
                Notification::Shutdown => break,
            }
        }
        log::trace!("event loop finished");
    }

    /// Next input buffer index, or [`NO_BUFFER`].
    pub fn dequeue_input_buffer_index(&self) -> AdapterResult<i32> {
        let mut state = self.state.lock();
        state.check_error()?;
        if state.is_flushing_or_shut_down() {
            return Ok(NO_BUFFER);
        }
        Ok(state
            .inputs
            .pop_front()
            .map(|(_, index)| index)
            .unwrap_or(NO_BUFFER))
    }

    /// Next output buffer index, [`FORMAT_CHANGED`] or [`NO_BUFFER`]. `info` is
    /// filled only when a buffer index is returned.
    pub fn dequeue_output_buffer_index(&self, info: &mut BufferInfo) -> AdapterResult<i32> {
        let mut state = self.state.lock();
        state.check_error()?;
        if state.is_flushing_or_shut_down() {
            return Ok(NO_BUFFER);
        }
        Ok(state.take_output(info).unwrap_or(NO_BUFFER))
    }

    /// Next event of any kind in delivery order. A captured error is returned
    /// on every call.
    pub fn dequeue_next(&self) -> Option<CodecEvent> {
        let mut state = self.state.lock();
        if let Some(error) = &state.error {
            return Some(CodecEvent::Error(error.clone()));
        }
        if state.is_flushing_or_shut_down() {
            return None;
        }
        let input_seq = state.inputs.front().map(|(seq, _)| *seq);
        let output_seq = state.outputs.front().map(|(seq, _)| *seq);
        match (input_seq, output_seq) {
            (Some(i), Some(o)) if i < o => state.inputs.pop_front().map(|(_, index)| {
                CodecEvent::InputAvailable(index)
            }),
            (Some(_), None) => state
                .inputs
                .pop_front()
                .map(|(_, index)| CodecEvent::InputAvailable(index)),
            (_, Some(_)) => {
                let mut info = BufferInfo::default();
                match state.take_output(&mut info)? {
                    FORMAT_CHANGED => state.current_format.clone().map(CodecEvent::FormatChanged),
                    index => Some(CodecEvent::OutputAvailable(index, info)),
                }
            }
            (None, None) => None,
        }
    }

    /// Format of the last dequeued format change.
    pub fn output_format(&self) -> Option<FormatDescriptor> {
        self.state.lock().current_format.clone()
    }

    pub fn maybe_raise_error(&self) -> AdapterResult<()> {
        self.state.lock().check_error()
    }

    /// Discards everything queued and everything the codec delivered before
    /// this call. Returns immediately; polls report [`NO_BUFFER`] until the
    /// worker has passed the barrier.
    pub fn flush(&self) {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.pending_flush_count += 1;
        }
        let posted = self
            .sender
            .lock()
            .as_ref()
            .map(|sender| sender.post(Notification::FlushCompleted))
            .unwrap_or(false);
        if !posted {
            // no worker to post to, the barrier is trivially reached
            self.state.lock().on_flush_completed();
        }
    }

    /// Stops accepting notifications and joins the worker. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.flush_internal();
        }
        self.cancel.cancel();
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.post(Notification::Shutdown);
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::warn!("event multiplexer {} worker panicked", self.label);
            }
        }
        log::debug!("event multiplexer {} shut down", self.label);
    }
}

impl Drop for EventMultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "multiplexer_test.rs"]
mod multiplexer_test;
