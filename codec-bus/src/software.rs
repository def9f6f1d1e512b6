//! Codec session backed by an in-process decode engine.
//!
//! [`SoftwareCodec`] owns fixed pools of input and output buffer slots and a
//! decode thread. It speaks both delivery modes of the [`Codec`] contract:
//! with a registered [`CodecEventSender`] every state change is announced as
//! a [`CodecEvent`]; without one the caller polls with `dequeue_*`.
//!
//! Every flush bumps a generation counter. Work started under an older
//! generation is dropped when it finishes, so nothing decoded before a flush
//! is published after it.

use std::{
    collections::VecDeque,
    sync::{Arc, mpsc},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{Codec, CodecBuffer, CodecEvent, CodecEventSender, CodecProvider, FrameRenderedListener},
    error::{CodecError, CodecResult, ERROR_INSUFFICIENT_RESOURCE, ERROR_INVALID_STATE},
    types::{
        BufferInfo, CryptoInfo, CryptoSession, FORMAT_CHANGED, FormatDescriptor, MIME_AUDIO_RAW,
        MIME_VIDEO_RAW, Metrics, NO_BUFFER, OutputTarget, Parameters, ScalingMode, buffer_flags,
    },
};

pub const DEFAULT_INPUT_BUFFERS: usize = 4;
pub const DEFAULT_OUTPUT_BUFFERS: usize = 4;

/// One access unit handed to a [`DecodeEngine`].
#[derive(Clone, Debug)]
pub struct InputSample {
    pub data: Bytes,
    pub presentation_time_us: i64,
    pub flags: u32,
    /// Subsample layout when the sample arrived through the secure path.
    pub crypto_info: Option<CryptoInfo>,
}

#[derive(Clone, Debug)]
pub struct DecodedSample {
    pub data: Bytes,
    pub presentation_time_us: i64,
    pub flags: u32,
}

/// The decoding work behind a [`SoftwareCodec`]. Runs on the codec's decode thread.
pub trait DecodeEngine: Send + 'static {
    fn name(&self) -> &str;

    /// Prepares the engine for `format` and returns the format of decoded output.
    fn configure(&mut self, format: &FormatDescriptor) -> CodecResult<FormatDescriptor>;

    fn decode(&mut self, sample: InputSample) -> CodecResult<Vec<DecodedSample>>;

    /// Emits whatever the engine still buffers at end of stream.
    fn drain(&mut self) -> CodecResult<Vec<DecodedSample>>;

    fn flush(&mut self);

    /// A new output format detected by the last `decode`/`drain`, if any.
    fn take_format_change(&mut self) -> Option<FormatDescriptor> {
        None
    }
}

/// Copies every access unit into one output buffer unchanged.
#[derive(Default)]
pub struct PassthroughEngine;

impl DecodeEngine for PassthroughEngine {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn configure(&mut self, format: &FormatDescriptor) -> CodecResult<FormatDescriptor> {
        let mut output = format.clone();
        output.mime = if format.is_video() {
            MIME_VIDEO_RAW.to_string()
        } else {
            MIME_AUDIO_RAW.to_string()
        };
        output.max_input_size = None;
        Ok(output)
    }

    fn decode(&mut self, sample: InputSample) -> CodecResult<Vec<DecodedSample>> {
        if sample.data.is_empty() || sample.flags & buffer_flags::CODEC_CONFIG != 0 {
            return Ok(Vec::new());
        }
        Ok(vec![DecodedSample {
            data: sample.data,
            presentation_time_us: sample.presentation_time_us,
            flags: sample.flags & buffer_flags::KEY_FRAME,
        }])
    }

    fn drain(&mut self) -> CodecResult<Vec<DecodedSample>> {
        Ok(Vec::new())
    }

    fn flush(&mut self) {}
}

pub type LoopbackCodec = SoftwareCodec<PassthroughEngine>;

/// Provider creating a [`LoopbackCodec`] for any codec name.
pub fn loopback_provider() -> Arc<dyn CodecProvider> {
    Arc::new(|name: &str| -> CodecResult<Arc<dyn Codec>> {
        let codec: Arc<dyn Codec> = Arc::new(LoopbackCodec::new(name, PassthroughEngine::default()));
        Ok(codec)
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Configured,
    Running,
    // asynchronous mode only, waiting for start()
    Flushed,
    Released,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InputSlot {
    Free,
    Client,
    Codec,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputSlot {
    Free,
    Busy(BufferInfo),
}

enum Pending {
    Format(FormatDescriptor),
    Sample(DecodedSample),
}

enum ReadyOutput {
    Format,
    Buffer(i32),
}

enum Job {
    Decode {
        generation: u64,
        index: i32,
        sample: InputSample,
    },
}

#[derive(Default)]
struct Counters {
    queued: u64,
    decoded: u64,
    rendered: u64,
    dropped: u64,
    flushes: u64,
}

struct Inner {
    phase: Phase,
    generation: u64,
    sender: Option<CodecEventSender>,
    jobs: Option<mpsc::Sender<Job>>,
    input_buffers: Vec<CodecBuffer>,
    input_slots: Vec<InputSlot>,
    free_inputs: VecDeque<i32>,
    output_buffers: Vec<CodecBuffer>,
    output_slots: Vec<OutputSlot>,
    ready_outputs: VecDeque<ReadyOutput>,
    // decoded output waiting for a free output slot
    backlog: VecDeque<Pending>,
    configured_format: Option<FormatDescriptor>,
    output_format: Option<FormatDescriptor>,
    format_announced: bool,
    input_eos: bool,
    error: Option<CodecError>,
    output_target: Option<OutputTarget>,
    scaling_mode: ScalingMode,
    parameters: Parameters,
    listener: Option<FrameRenderedListener>,
    counters: Counters,
}

impl Inner {
    fn new(input_count: usize, output_count: usize) -> Self {
        let pool = |count: usize| -> Vec<CodecBuffer> {
            (0..count)
                .map(|_| Arc::new(Mutex::new(BytesMut::new())))
                .collect()
        };
        Self {
            phase: Phase::Uninitialized,
            generation: 0,
            sender: None,
            jobs: None,
            input_buffers: pool(input_count),
            input_slots: vec![InputSlot::Free; input_count],
            free_inputs: VecDeque::new(),
            output_buffers: pool(output_count),
            output_slots: vec![OutputSlot::Free; output_count],
            ready_outputs: VecDeque::new(),
            backlog: VecDeque::new(),
            configured_format: None,
            output_format: None,
            format_announced: false,
            input_eos: false,
            error: None,
            output_target: None,
            scaling_mode: ScalingMode::default(),
            parameters: Parameters::new(),
            listener: None,
            counters: Counters::default(),
        }
    }

    fn is_async(&self) -> bool {
        self.sender.is_some()
    }

    fn require(&self, allowed: &[Phase], operation: &str) -> CodecResult<()> {
        if allowed.contains(&self.phase) {
            return Ok(());
        }
        Err(CodecError::invalid_state(format!(
            "{} not allowed in phase {:?}",
            operation, self.phase
        )))
    }

    fn require_sync_mode(&self, operation: &str) -> CodecResult<()> {
        if self.is_async() {
            return Err(CodecError::invalid_state(format!(
                "{} is not available in asynchronous mode",
                operation
            )));
        }
        self.require(&[Phase::Running], operation)
    }

    fn send(&self, event: CodecEvent) {
        if let Some(sender) = &self.sender {
            sender.send(event);
        }
    }

    fn slot(index: i32, count: usize, kind: &str) -> CodecResult<usize> {
        usize::try_from(index)
            .ok()
            .filter(|slot| *slot < count)
            .ok_or_else(|| CodecError::invalid_argument(format!("invalid {} buffer index {}", kind, index)))
    }

    fn reset_buffers(&mut self) {
        self.input_slots.fill(InputSlot::Free);
        self.free_inputs.clear();
        self.output_slots.fill(OutputSlot::Free);
        self.ready_outputs.clear();
        self.backlog.clear();
        self.input_eos = false;
    }

    fn hand_input_to_client(&mut self, index: i32) {
        if let Some(buffer) = self.input_buffers.get(index as usize) {
            buffer.lock().clear();
        }
        if self.is_async() {
            self.input_slots[index as usize] = InputSlot::Client;
            self.send(CodecEvent::InputAvailable(index));
        } else {
            self.input_slots[index as usize] = InputSlot::Free;
            self.free_inputs.push_back(index);
        }
    }

    fn announce_inputs(&mut self) {
        for index in 0..self.input_slots.len() {
            if self.input_slots[index] == InputSlot::Free {
                self.hand_input_to_client(index as i32);
            }
        }
    }

    fn publish(&mut self, format_change: Option<FormatDescriptor>, samples: Vec<DecodedSample>) {
        if let Some(format) = format_change {
            self.backlog.push_back(Pending::Format(format));
            self.format_announced = true;
        } else if !self.format_announced && !samples.is_empty() {
            if let Some(format) = self.output_format.clone() {
                self.backlog.push_back(Pending::Format(format));
            }
            self.format_announced = true;
        }
        self.backlog
            .extend(samples.into_iter().map(Pending::Sample));
        self.drain_backlog();
    }

    fn drain_backlog(&mut self) {
        loop {
            let slot = match self.backlog.front() {
                None => return,
                Some(Pending::Format(_)) => None,
                Some(Pending::Sample(_)) => {
                    match self.output_slots.iter().position(|s| *s == OutputSlot::Free) {
                        Some(slot) => Some(slot),
                        None => return,
                    }
                }
            };
            match (self.backlog.pop_front(), slot) {
                (Some(Pending::Format(format)), _) => self.emit_format(format),
                (Some(Pending::Sample(sample)), Some(slot)) => self.emit_output(slot, sample),
                _ => return,
            }
        }
    }

    fn emit_format(&mut self, format: FormatDescriptor) {
        log::debug!("output format changed to {}", format);
        self.output_format = Some(format.clone());
        if self.is_async() {
            self.send(CodecEvent::FormatChanged(format));
        } else {
            self.ready_outputs.push_back(ReadyOutput::Format);
        }
    }

    fn emit_output(&mut self, slot: usize, sample: DecodedSample) {
        {
            let mut buffer = self.output_buffers[slot].lock();
            buffer.clear();
            buffer.extend_from_slice(&sample.data);
        }
        let info = BufferInfo::new(0, sample.data.len(), sample.presentation_time_us, sample.flags);
        self.output_slots[slot] = OutputSlot::Busy(info);
        self.counters.decoded += 1;
        let index = slot as i32;
        if self.is_async() {
            self.send(CodecEvent::OutputAvailable(index, info));
        } else {
            self.ready_outputs.push_back(ReadyOutput::Buffer(index));
        }
    }

    fn report_error(&mut self, error: CodecError) {
        log::error!("decode failed: {}", error);
        if self.error.is_some() {
            return;
        }
        self.error = Some(error.clone());
        self.send(CodecEvent::Error(error));
    }
}

struct Shared<E> {
    name: String,
    inner: Mutex<Inner>,
    // wakes synchronous-mode dequeues
    available: Condvar,
    // lock order: engine before inner
    engine: Mutex<E>,
    cancel: CancellationToken,
    epoch: Instant,
}

pub struct SoftwareCodec<E: DecodeEngine> {
    shared: Arc<Shared<E>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<E: DecodeEngine> SoftwareCodec<E> {
    pub fn new(name: &str, engine: E) -> Self {
        Self::with_buffer_counts(name, engine, DEFAULT_INPUT_BUFFERS, DEFAULT_OUTPUT_BUFFERS)
    }

    pub fn with_buffer_counts(
        name: &str,
        engine: E,
        input_count: usize,
        output_count: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                inner: Mutex::new(Inner::new(input_count, output_count)),
                available: Condvar::new(),
                engine: Mutex::new(engine),
                cancel: CancellationToken::new(),
                epoch: Instant::now(),
            }),
            worker: Mutex::new(None),
        }
    }

    fn spawn_worker(&self, inner: &mut Inner) -> CodecResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel::<Job>();
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("{}-decode", self.shared.name))
            .spawn(move || Self::decode_loop(shared, rx))
            .map_err(|e| {
                CodecError::fatal(
                    ERROR_INSUFFICIENT_RESOURCE,
                    format!("failed to spawn decode thread: {}", e),
                )
            })?;
        inner.jobs = Some(tx);
        *worker = Some(handle);
        Ok(())
    }

    fn decode_loop(shared: Arc<Shared<E>>, jobs: mpsc::Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            if shared.cancel.is_cancelled() {
                break;
            }
            let Job::Decode {
                generation,
                index,
                sample,
            } = job;
            let presentation_time_us = sample.presentation_time_us;
            let end_of_stream = sample.flags & buffer_flags::END_OF_STREAM != 0;

            let result = {
                let mut engine = shared.engine.lock();
                if shared.inner.lock().generation != generation {
                    continue;
                }
                Self::run_engine(&mut engine, sample, end_of_stream)
            };

            let mut inner = shared.inner.lock();
            if inner.generation != generation {
                log::trace!("{}: dropping output of flushed input {}", shared.name, index);
                continue;
            }
            inner.hand_input_to_client(index);
            match result {
                Ok((mut samples, format_change)) => {
                    if end_of_stream {
                        samples.push(DecodedSample {
                            data: Bytes::new(),
                            presentation_time_us,
                            flags: buffer_flags::END_OF_STREAM,
                        });
                    }
                    inner.publish(format_change, samples);
                }
                Err(e) => inner.report_error(e),
            }
            drop(inner);
            shared.available.notify_all();
        }
        log::debug!("{}: decode thread finished", shared.name);
    }

    fn run_engine(
        engine: &mut E,
        sample: InputSample,
        end_of_stream: bool,
    ) -> CodecResult<(Vec<DecodedSample>, Option<FormatDescriptor>)> {
        let mut samples = engine.decode(sample)?;
        if end_of_stream {
            samples.extend(engine.drain()?);
        }
        Ok((samples, engine.take_format_change()))
    }

    fn submit(
        &self,
        index: i32,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
        crypto_info: Option<CryptoInfo>,
    ) -> CodecResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.require(&[Phase::Running], "queue_input_buffer")?;
        if let Some(error) = &inner.error {
            return Err(error.clone());
        }
        let slot = Inner::slot(index, inner.input_slots.len(), "input")?;
        if inner.input_slots[slot] != InputSlot::Client {
            return Err(CodecError::invalid_argument(format!(
                "input buffer {} is not owned by the client",
                index
            )));
        }
        if inner.input_eos {
            return Err(CodecError::invalid_state("input already reached end of stream"));
        }
        let data = {
            let buffer = inner.input_buffers[slot].lock();
            let end = offset
                .checked_add(size)
                .filter(|end| *end <= buffer.len())
                .ok_or_else(|| {
                    CodecError::invalid_argument(format!(
                        "range {}+{} exceeds input buffer {} of {} bytes",
                        offset,
                        size,
                        index,
                        buffer.len()
                    ))
                })?;
            Bytes::copy_from_slice(&buffer[offset..end])
        };

        if flags & buffer_flags::END_OF_STREAM != 0 {
            inner.input_eos = true;
        }
        inner.input_slots[slot] = InputSlot::Codec;
        inner.counters.queued += 1;
        let job = Job::Decode {
            generation: inner.generation,
            index,
            sample: InputSample {
                data,
                presentation_time_us,
                flags,
                crypto_info,
            },
        };
        let sent = inner.jobs.as_ref().is_some_and(|jobs| jobs.send(job).is_ok());
        if !sent {
            return Err(CodecError::fatal(ERROR_INVALID_STATE, "decode thread is gone"));
        }
        Ok(())
    }

    fn release_output(&self, index: i32, render_time_ns: Option<i64>) -> CodecResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.require(&[Phase::Running, Phase::Flushed], "release_output_buffer")?;
        let slot = Inner::slot(index, inner.output_slots.len(), "output")?;
        let OutputSlot::Busy(info) = inner.output_slots[slot] else {
            return Err(CodecError::invalid_argument(format!(
                "output buffer {} is not owned by the client",
                index
            )));
        };
        inner.output_slots[slot] = OutputSlot::Free;

        let mut rendered = None;
        match render_time_ns {
            Some(render_time_ns) if info.size > 0 => {
                inner.counters.rendered += 1;
                rendered = inner
                    .listener
                    .clone()
                    .map(|listener| (listener, info.presentation_time_us, render_time_ns));
            }
            _ => inner.counters.dropped += 1,
        }
        inner.drain_backlog();
        drop(inner);
        self.shared.available.notify_all();

        if let Some((listener, presentation_time_us, render_time_ns)) = rendered {
            listener(presentation_time_us, render_time_ns);
        }
        Ok(())
    }
}

impl<E: DecodeEngine> Codec for SoftwareCodec<E> {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn set_callback(&self, sender: Option<CodecEventSender>) -> CodecResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.require(&[Phase::Uninitialized], "set_callback")?;
        inner.sender = sender;
        Ok(())
    }

    fn configure(
        &self,
        format: &FormatDescriptor,
        output_target: Option<OutputTarget>,
        crypto_session: Option<&CryptoSession>,
        flags: u32,
    ) -> CodecResult<()> {
        let mut engine = self.shared.engine.lock();
        let mut inner = self.shared.inner.lock();
        inner.require(&[Phase::Uninitialized], "configure")?;
        format.validate()?;
        if output_target.is_some() && !format.is_video() {
            return Err(CodecError::invalid_argument(
                "an output target only applies to video codecs",
            ));
        }

        let output_format = engine.configure(format)?;
        log::info!(
            "{}: configured {} engine for {} (flags {:#x}, {} mode{})",
            self.shared.name,
            engine.name(),
            format,
            flags,
            if inner.is_async() { "asynchronous" } else { "synchronous" },
            match crypto_session {
                Some(session) => format!(", crypto scheme {}", session.scheme),
                None => String::new(),
            }
        );
        inner.configured_format = Some(format.clone());
        inner.output_format = Some(output_format);
        inner.output_target = output_target;
        inner.phase = Phase::Configured;
        Ok(())
    }

    fn start(&self) -> CodecResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.require(&[Phase::Configured, Phase::Flushed], "start")?;
        self.spawn_worker(&mut inner)?;
        inner.phase = Phase::Running;
        inner.announce_inputs();
        drop(inner);
        self.shared.available.notify_all();
        Ok(())
    }

    fn flush(&self) -> CodecResult<()> {
        let mut engine = self.shared.engine.lock();
        let mut inner = self.shared.inner.lock();
        inner.require(&[Phase::Running, Phase::Flushed], "flush")?;
        inner.generation += 1;
        inner.reset_buffers();
        inner.counters.flushes += 1;
        if inner.is_async() {
            inner.phase = Phase::Flushed;
        } else {
            inner.announce_inputs();
        }
        drop(inner);
        engine.flush();
        self.shared.available.notify_all();
        log::debug!("{}: flushed", self.shared.name);
        Ok(())
    }

    fn release(&self) {
        let jobs = {
            let mut inner = self.shared.inner.lock();
            inner.phase = Phase::Released;
            inner.generation += 1;
            inner.reset_buffers();
            inner.sender = None;
            inner.listener = None;
            inner.jobs.take()
        };
        drop(jobs);
        self.shared.cancel.cancel();
        self.shared.available.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                log::warn!("{}: decode thread panicked", self.shared.name);
            }
            log::debug!("{}: released", self.shared.name);
        }
    }

    fn queue_input_buffer(
        &self,
        index: i32,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    ) -> CodecResult<()> {
        self.submit(index, offset, size, presentation_time_us, flags, None)
    }

    fn queue_secure_input_buffer(
        &self,
        index: i32,
        offset: usize,
        crypto_info: &CryptoInfo,
        presentation_time_us: i64,
        flags: u32,
    ) -> CodecResult<()> {
        crypto_info.validate()?;
        self.submit(
            index,
            offset,
            crypto_info.total_size(),
            presentation_time_us,
            flags,
            Some(crypto_info.clone()),
        )
    }

    fn dequeue_input_buffer(&self, timeout: Duration) -> CodecResult<i32> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            inner.require_sync_mode("dequeue_input_buffer")?;
            if let Some(error) = &inner.error {
                return Err(error.clone());
            }
            if let Some(index) = inner.free_inputs.pop_front() {
                inner.input_slots[index as usize] = InputSlot::Client;
                return Ok(index);
            }
            if self.shared.available.wait_until(&mut inner, deadline).timed_out() {
                return Ok(NO_BUFFER);
            }
        }
    }

    fn dequeue_output_buffer(&self, info: &mut BufferInfo, timeout: Duration) -> CodecResult<i32> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        loop {
            inner.require_sync_mode("dequeue_output_buffer")?;
            if let Some(error) = &inner.error {
                return Err(error.clone());
            }
            match inner.ready_outputs.pop_front() {
                Some(ReadyOutput::Format) => return Ok(FORMAT_CHANGED),
                Some(ReadyOutput::Buffer(index)) => {
                    if let OutputSlot::Busy(ready) = inner.output_slots[index as usize] {
                        info.set(&ready);
                        return Ok(index);
                    }
                }
                None => {
                    if self.shared.available.wait_until(&mut inner, deadline).timed_out() {
                        return Ok(NO_BUFFER);
                    }
                }
            }
        }
    }

    fn input_buffer(&self, index: i32) -> Option<CodecBuffer> {
        let inner = self.shared.inner.lock();
        let slot = Inner::slot(index, inner.input_slots.len(), "input").ok()?;
        (inner.input_slots[slot] == InputSlot::Client).then(|| Arc::clone(&inner.input_buffers[slot]))
    }

    fn output_buffer(&self, index: i32) -> Option<CodecBuffer> {
        let inner = self.shared.inner.lock();
        let slot = Inner::slot(index, inner.output_slots.len(), "output").ok()?;
        matches!(inner.output_slots[slot], OutputSlot::Busy(_))
            .then(|| Arc::clone(&inner.output_buffers[slot]))
    }

    fn output_format(&self) -> CodecResult<FormatDescriptor> {
        let inner = self.shared.inner.lock();
        inner
            .output_format
            .clone()
            .ok_or_else(|| CodecError::invalid_state("codec is not configured"))
    }

    fn release_output_buffer(&self, index: i32, render: bool) -> CodecResult<()> {
        let now = self.shared.epoch.elapsed().as_nanos() as i64;
        self.release_output(index, render.then_some(now))
    }

    fn release_output_buffer_at(&self, index: i32, render_time_ns: i64) -> CodecResult<()> {
        self.release_output(index, Some(render_time_ns))
    }

    fn set_output_target(&self, target: OutputTarget) -> CodecResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.require(
            &[Phase::Configured, Phase::Running, Phase::Flushed],
            "set_output_target",
        )?;
        if !inner.configured_format.as_ref().is_some_and(|f| f.is_video()) {
            return Err(CodecError::invalid_state(
                "an output target only applies to video codecs",
            ));
        }
        inner.output_target = Some(target);
        Ok(())
    }

    fn set_parameters(&self, params: &Parameters) -> CodecResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.require(
            &[Phase::Configured, Phase::Running, Phase::Flushed],
            "set_parameters",
        )?;
        inner
            .parameters
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn set_video_scaling_mode(&self, mode: ScalingMode) -> CodecResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.require(
            &[Phase::Configured, Phase::Running, Phase::Flushed],
            "set_video_scaling_mode",
        )?;
        inner.scaling_mode = mode;
        Ok(())
    }

    fn set_on_frame_rendered_listener(&self, listener: Option<FrameRenderedListener>) {
        self.shared.inner.lock().listener = listener;
    }

    fn metrics(&self) -> Metrics {
        let inner = self.shared.inner.lock();
        let mut metrics = Metrics::new();
        metrics.insert("codec.name".to_string(), Value::from(self.shared.name.clone()));
        metrics.insert(
            "codec.mode".to_string(),
            Value::from(if inner.is_async() { "async" } else { "sync" }),
        );
        if let Some(format) = &inner.configured_format {
            metrics.insert("codec.mime".to_string(), Value::from(format.mime.clone()));
            if let (Some(width), Some(height)) = (format.width, format.height) {
                metrics.insert("codec.width".to_string(), Value::from(width));
                metrics.insert("codec.height".to_string(), Value::from(height));
            }
        }
        if let Some(target) = inner.output_target {
            metrics.insert("codec.output_target".to_string(), Value::from(target.0));
        }
        metrics.insert(
            "codec.scaling_mode".to_string(),
            Value::from(inner.scaling_mode as i32),
        );
        metrics.insert("codec.flushes".to_string(), Value::from(inner.counters.flushes));
        metrics.insert("frames.queued".to_string(), Value::from(inner.counters.queued));
        metrics.insert("frames.decoded".to_string(), Value::from(inner.counters.decoded));
        metrics.insert("frames.rendered".to_string(), Value::from(inner.counters.rendered));
        metrics.insert("frames.dropped".to_string(), Value::from(inner.counters.dropped));
        if !inner.parameters.is_empty() {
            metrics.insert(
                "codec.parameters".to_string(),
                Value::Object(inner.parameters.clone()),
            );
        }
        metrics
    }
}

impl<E: DecodeEngine> Drop for SoftwareCodec<E> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[path = "software_test.rs"]
mod software_test;
