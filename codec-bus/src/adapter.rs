use tokio::runtime::Handle;

use crate::{
    codec::{CodecBuffer, FrameRenderedListener},
    error::AdapterResult,
    types::{
        BufferInfo, Configuration, CryptoInfo, FormatDescriptor, Metrics, OutputTarget,
        Parameters, ScalingMode,
    },
};

/// Index based buffer exchange on top of a codec session.
///
/// Dequeue operations never block: they return [`NO_BUFFER`](crate::types::NO_BUFFER)
/// when nothing is ready.
pub trait CodecAdapter: Send + Sync {
    /// Whether the codec must be torn down before it can take a new format.
    fn needs_reconfiguration(&self) -> bool;

    fn queue_input_buffer(
        &self,
        index: i32,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    ) -> AdapterResult<()>;

    fn queue_secure_input_buffer(
        &self,
        index: i32,
        offset: usize,
        crypto_info: &CryptoInfo,
        presentation_time_us: i64,
        flags: u32,
    ) -> AdapterResult<()>;

    fn dequeue_input_buffer_index(&self) -> AdapterResult<i32>;

    fn dequeue_output_buffer_index(&self, info: &mut BufferInfo) -> AdapterResult<i32>;

    fn output_format(&self) -> AdapterResult<FormatDescriptor>;

    fn input_buffer(&self, index: i32) -> Option<CodecBuffer>;

    fn output_buffer(&self, index: i32) -> Option<CodecBuffer>;

    fn release_output_buffer(&self, index: i32, render: bool) -> AdapterResult<()>;

    fn release_output_buffer_at(&self, index: i32, render_time_ns: i64) -> AdapterResult<()>;

    fn flush(&self) -> AdapterResult<()>;

    /// Idempotent. Releases the codec exactly once.
    fn release(&self);

    fn set_output_target(&self, target: OutputTarget) -> AdapterResult<()>;

    fn set_parameters(&self, params: &Parameters) -> AdapterResult<()>;

    fn set_video_scaling_mode(&self, mode: ScalingMode) -> AdapterResult<()>;

    /// `listener` runs on `handle`, never on a codec thread.
    fn set_on_frame_rendered_listener(
        &self,
        listener: FrameRenderedListener,
        handle: Handle,
    ) -> AdapterResult<()>;

    fn metrics(&self) -> AdapterResult<Metrics>;
}

pub trait CodecAdapterFactory: Send + Sync {
    fn create_adapter(&self, configuration: Configuration) -> AdapterResult<Box<dyn CodecAdapter>>;
}

/// Wraps `listener` so every invocation is dispatched onto `handle`.
pub(crate) fn dispatch_on(listener: FrameRenderedListener, handle: Handle) -> FrameRenderedListener {
    std::sync::Arc::new(move |presentation_time_us, render_time_ns| {
        let listener = listener.clone();
        handle.spawn(async move { listener(presentation_time_us, render_time_ns) });
    })
}
