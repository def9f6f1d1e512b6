//! Recording codec used by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    codec::{Codec, CodecBuffer, CodecEvent, CodecEventSender, CodecProvider, FrameRenderedListener},
    error::{CodecError, CodecResult},
    types::{
        BufferInfo, CryptoInfo, CryptoSession, FormatDescriptor, Metrics, NO_BUFFER,
        OutputTarget, Parameters, ScalingMode,
    },
};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    SetCallback(bool),
    Configure(FormatDescriptor, Option<OutputTarget>, u32),
    Start,
    Flush,
    Release,
    QueueInput {
        index: i32,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    },
    QueueSecureInput {
        index: i32,
        offset: usize,
        crypto_info: CryptoInfo,
        presentation_time_us: i64,
        flags: u32,
    },
    ReleaseOutput(i32, bool),
    ReleaseOutputAt(i32, i64),
    SetOutputTarget(OutputTarget),
    SetParameters(Parameters),
    SetScalingMode(ScalingMode),
    SetListener(bool),
}

impl Call {
    pub fn is_submission(&self) -> bool {
        matches!(self, Call::QueueInput { .. } | Call::QueueSecureInput { .. })
    }
}

pub struct RecordingCodec {
    name: String,
    calls: Mutex<Vec<Call>>,
    sender: Mutex<Option<CodecEventSender>>,
    failures: Mutex<HashMap<&'static str, CodecError>>,
    gate_open: Mutex<bool>,
    gate: Condvar,
    waiting_at_gate: AtomicUsize,
    releases: AtomicUsize,
    listener: Mutex<Option<FrameRenderedListener>>,
}

impl RecordingCodec {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            gate_open: Mutex::new(true),
            gate: Condvar::new(),
            waiting_at_gate: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            listener: Mutex::new(None),
        })
    }

    /// Provider handing out `codec` for every name.
    pub fn provider(codec: &Arc<Self>) -> Arc<dyn CodecProvider> {
        let codec = Arc::clone(codec);
        Arc::new(move |_: &str| -> CodecResult<Arc<dyn Codec>> {
            Ok(codec.clone() as Arc<dyn Codec>)
        })
    }

    /// Makes every later call of `operation` fail with `error`.
    pub fn fail_on(&self, operation: &'static str, error: CodecError) {
        self.failures.lock().insert(operation, error);
    }

    /// Holds input submissions until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        *self.gate_open.lock() = false;
    }

    pub fn open_gate(&self) {
        *self.gate_open.lock() = true;
        self.gate.notify_all();
    }

    pub fn waiting_at_gate(&self) -> usize {
        self.waiting_at_gate.load(Ordering::SeqCst)
    }

    /// Delivers `event` through the registered callback, as the codec's own thread would.
    pub fn emit(&self, event: CodecEvent) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(event))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn submissions(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.is_submission())
            .cloned()
            .collect()
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Simulates the display reporting a rendered frame.
    pub fn render(&self, presentation_time_us: i64, render_time_ns: i64) -> bool {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => {
                listener(presentation_time_us, render_time_ns);
                true
            }
            None => false,
        }
    }

    fn record(&self, operation: &'static str, call: Call) -> CodecResult<()> {
        if let Some(error) = self.failures.lock().get(operation) {
            return Err(error.clone());
        }
        self.calls.lock().push(call);
        Ok(())
    }

    fn pass_gate(&self) {
        let mut open = self.gate_open.lock();
        if *open {
            return;
        }
        self.waiting_at_gate.fetch_add(1, Ordering::SeqCst);
        while !*open {
            self.gate.wait(&mut open);
        }
        self.waiting_at_gate.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Codec for RecordingCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_callback(&self, sender: Option<CodecEventSender>) -> CodecResult<()> {
        self.record("set_callback", Call::SetCallback(sender.is_some()))?;
        *self.sender.lock() = sender;
        Ok(())
    }

    fn configure(
        &self,
        format: &FormatDescriptor,
        output_target: Option<OutputTarget>,
        _crypto_session: Option<&CryptoSession>,
        flags: u32,
    ) -> CodecResult<()> {
        self.record(
            "configure",
            Call::Configure(format.clone(), output_target, flags),
        )
    }

    fn start(&self) -> CodecResult<()> {
        self.record("start", Call::Start)
    }

    fn flush(&self) -> CodecResult<()> {
        self.record("flush", Call::Flush)
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(Call::Release);
        *self.sender.lock() = None;
    }

    fn queue_input_buffer(
        &self,
        index: i32,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    ) -> CodecResult<()> {
        self.pass_gate();
        self.record(
            "queue_input_buffer",
            Call::QueueInput {
                index,
                offset,
                size,
                presentation_time_us,
                flags,
            },
        )
    }

    fn queue_secure_input_buffer(
        &self,
        index: i32,
        offset: usize,
        crypto_info: &CryptoInfo,
        presentation_time_us: i64,
        flags: u32,
    ) -> CodecResult<()> {
        self.pass_gate();
        self.record(
            "queue_secure_input_buffer",
            Call::QueueSecureInput {
                index,
                offset,
                crypto_info: crypto_info.clone(),
                presentation_time_us,
                flags,
            },
        )
    }

    fn dequeue_input_buffer(&self, _timeout: Duration) -> CodecResult<i32> {
        Ok(NO_BUFFER)
    }

    fn dequeue_output_buffer(
        &self,
        _info: &mut BufferInfo,
        _timeout: Duration,
    ) -> CodecResult<i32> {
        Ok(NO_BUFFER)
    }

    fn input_buffer(&self, _index: i32) -> Option<CodecBuffer> {
        None
    }

    fn output_buffer(&self, _index: i32) -> Option<CodecBuffer> {
        None
    }

    fn output_format(&self) -> CodecResult<FormatDescriptor> {
        Err(CodecError::invalid_state("recording codec has no output format"))
    }

    fn release_output_buffer(&self, index: i32, render: bool) -> CodecResult<()> {
        self.record("release_output_buffer", Call::ReleaseOutput(index, render))
    }

    fn release_output_buffer_at(&self, index: i32, render_time_ns: i64) -> CodecResult<()> {
        self.record(
            "release_output_buffer_at",
            Call::ReleaseOutputAt(index, render_time_ns),
        )
    }

    fn set_output_target(&self, target: OutputTarget) -> CodecResult<()> {
        self.record("set_output_target", Call::SetOutputTarget(target))
    }

    fn set_parameters(&self, params: &Parameters) -> CodecResult<()> {
        self.record("set_parameters", Call::SetParameters(params.clone()))
    }

    fn set_video_scaling_mode(&self, mode: ScalingMode) -> CodecResult<()> {
        self.record("set_video_scaling_mode", Call::SetScalingMode(mode))
    }

    fn set_on_frame_rendered_listener(&self, listener: Option<FrameRenderedListener>) {
        self.calls.lock().push(Call::SetListener(listener.is_some()));
        *self.listener.lock() = listener;
    }

    fn metrics(&self) -> Metrics {
        let mut metrics = Metrics::new();
        metrics.insert("codec.name".to_string(), self.name.clone().into());
        metrics
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn poll_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
