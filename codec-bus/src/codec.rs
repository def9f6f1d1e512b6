//! The codec session contract consumed by the adapters.
//!
//! A [`Codec`] is thread safe and may deliver its notifications from any
//! thread of its own. In asynchronous mode it reports buffer availability
//! through the [`CodecEventSender`] registered with `set_callback`; without a
//! registered sender it operates in synchronous mode and is polled with
//! `dequeue_input_buffer` / `dequeue_output_buffer`.

use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::{
    error::{CodecError, CodecResult},
    types::{
        BufferInfo, CryptoInfo, CryptoSession, FormatDescriptor, Metrics, OutputTarget,
        Parameters, ScalingMode,
    },
};

/// Memory backing one input or output buffer slot.
pub type CodecBuffer = Arc<Mutex<BytesMut>>;

/// Called with `(presentation_time_us, render_time_ns)` for every rendered frame.
pub type FrameRenderedListener = Arc<dyn Fn(i64, i64) + Send + Sync>;

/// Asynchronous notification emitted by a codec.
#[derive(Clone, Debug, PartialEq)]
pub enum CodecEvent {
    InputAvailable(i32),
    OutputAvailable(i32, BufferInfo),
    FormatChanged(FormatDescriptor),
    Error(CodecError),
}

pub(crate) enum Notification {
    Event(CodecEvent),
    FlushCompleted,
    Shutdown,
}

/// Ordered channel a codec publishes its notifications into.
#[derive(Clone)]
pub struct CodecEventSender {
    tx: std::sync::mpsc::Sender<Notification>,
}

impl CodecEventSender {
    pub(crate) fn new(tx: std::sync::mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    /// Returns `false` once the receiving side has shut down.
    pub fn send(&self, event: CodecEvent) -> bool {
        self.tx.send(Notification::Event(event)).is_ok()
    }

    pub(crate) fn post(&self, notification: Notification) -> bool {
        self.tx.send(notification).is_ok()
    }
}

impl std::fmt::Debug for CodecEventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecEventSender").finish_non_exhaustive()
    }
}

pub trait Codec: Send + Sync {
    fn name(&self) -> &str;

    /// Switches the codec to asynchronous mode. Must be called before `configure`.
    fn set_callback(&self, sender: Option<CodecEventSender>) -> CodecResult<()>;

    fn configure(
        &self,
        format: &FormatDescriptor,
        output_target: Option<OutputTarget>,
        crypto_session: Option<&CryptoSession>,
        flags: u32,
    ) -> CodecResult<()>;

    fn start(&self) -> CodecResult<()>;

    /// Drops all queued work and returns every buffer to the codec. When this
    /// returns no notification describing pre-flush work is sent anymore.
    fn flush(&self) -> CodecResult<()>;

    fn release(&self);

    fn queue_input_buffer(
        &self,
        index: i32,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    ) -> CodecResult<()>;

    fn queue_secure_input_buffer(
        &self,
        index: i32,
        offset: usize,
        crypto_info: &CryptoInfo,
        presentation_time_us: i64,
        flags: u32,
    ) -> CodecResult<()>;

    /// Synchronous mode only.
    fn dequeue_input_buffer(&self, timeout: Duration) -> CodecResult<i32>;

    /// Synchronous mode only.
    fn dequeue_output_buffer(&self, info: &mut BufferInfo, timeout: Duration)
    -> CodecResult<i32>;

    fn input_buffer(&self, index: i32) -> Option<CodecBuffer>;

    fn output_buffer(&self, index: i32) -> Option<CodecBuffer>;

    fn output_format(&self) -> CodecResult<FormatDescriptor>;

    fn release_output_buffer(&self, index: i32, render: bool) -> CodecResult<()>;

    fn release_output_buffer_at(&self, index: i32, render_time_ns: i64) -> CodecResult<()>;

    fn set_output_target(&self, target: OutputTarget) -> CodecResult<()>;

    fn set_parameters(&self, params: &Parameters) -> CodecResult<()>;

    fn set_video_scaling_mode(&self, mode: ScalingMode) -> CodecResult<()>;

    fn set_on_frame_rendered_listener(&self, listener: Option<FrameRenderedListener>);

    fn metrics(&self) -> Metrics;
}

/// Creates codec sessions by name.
pub trait CodecProvider: Send + Sync {
    fn create_codec(&self, name: &str) -> CodecResult<Arc<dyn Codec>>;
}

impl<F> CodecProvider for F
where
    F: Fn(&str) -> CodecResult<Arc<dyn Codec>> + Send + Sync,
{
    fn create_codec(&self, name: &str) -> CodecResult<Arc<dyn Codec>> {
        self(name)
    }
}
