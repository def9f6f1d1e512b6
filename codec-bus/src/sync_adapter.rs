//! Adapter over a codec driven in synchronous (polled) mode.
//!
//! Every call is forwarded on the caller thread; there are no workers and no
//! ordering beyond what the caller provides.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::runtime::Handle;

use crate::{
    adapter::{CodecAdapter, CodecAdapterFactory, dispatch_on},
    codec::{Codec, CodecBuffer, CodecProvider, FrameRenderedListener},
    error::{AdapterError, AdapterResult},
    types::{
        BufferInfo, Configuration, CryptoInfo, FormatDescriptor, Metrics, OutputTarget,
        Parameters, ScalingMode,
    },
};

pub struct SyncCodecAdapter {
    codec: Arc<dyn Codec>,
    released: AtomicBool,
}

impl SyncCodecAdapter {
    /// `codec` must already be configured and started without a callback.
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            released: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self, operation: &str) -> AdapterResult<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(AdapterError::usage(format!(
                "{} called after release",
                operation
            )));
        }
        Ok(())
    }
}

impl CodecAdapter for SyncCodecAdapter {
    fn needs_reconfiguration(&self) -> bool {
        false
    }

    fn queue_input_buffer(
        &self,
        index: i32,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    ) -> AdapterResult<()> {
        self.ensure_running("queue_input_buffer")?;
        self.codec
            .queue_input_buffer(index, offset, size, presentation_time_us, flags)
            .map_err(AdapterError::CodecRuntime)
    }

    fn queue_secure_input_buffer(
        &self,
        index: i32,
        offset: usize,
        crypto_info: &CryptoInfo,
        presentation_time_us: i64,
        flags: u32,
    ) -> AdapterResult<()> {
        self.ensure_running("queue_secure_input_buffer")?;
        self.codec
            .queue_secure_input_buffer(index, offset, crypto_info, presentation_time_us, flags)
            .map_err(AdapterError::CodecRuntime)
    }

    fn dequeue_input_buffer_index(&self) -> AdapterResult<i32> {
        self.ensure_running("dequeue_input_buffer_index")?;
        self.codec
            .dequeue_input_buffer(Duration::ZERO)
            .map_err(AdapterError::CodecRuntime)
    }

    fn dequeue_output_buffer_index(&self, info: &mut BufferInfo) -> AdapterResult<i32> {
        self.ensure_running("dequeue_output_buffer_index")?;
        self.codec
            .dequeue_output_buffer(info, Duration::ZERO)
            .map_err(AdapterError::CodecRuntime)
    }

    fn output_format(&self) -> AdapterResult<FormatDescriptor> {
        self.codec.output_format().map_err(AdapterError::CodecRuntime)
    }

    fn input_buffer(&self, index: i32) -> Option<CodecBuffer> {
        self.ensure_running("input_buffer").ok()?;
        self.codec.input_buffer(index)
    }

    fn output_buffer(&self, index: i32) -> Option<CodecBuffer> {
        self.ensure_running("output_buffer").ok()?;
        self.codec.output_buffer(index)
    }

    fn release_output_buffer(&self, index: i32, render: bool) -> AdapterResult<()> {
        self.ensure_running("release_output_buffer")?;
        self.codec
            .release_output_buffer(index, render)
            .map_err(AdapterError::CodecRuntime)
    }

    fn release_output_buffer_at(&self, index: i32, render_time_ns: i64) -> AdapterResult<()> {
        self.ensure_running("release_output_buffer_at")?;
        self.codec
            .release_output_buffer_at(index, render_time_ns)
            .map_err(AdapterError::CodecRuntime)
    }

    fn flush(&self) -> AdapterResult<()> {
        self.ensure_running("flush")?;
        // a synchronous codec keeps running after flush, no restart needed
        self.codec.flush().map_err(AdapterError::CodecRuntime)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.codec.release();
        log::info!("codec {} released", self.codec.name());
    }

    fn set_output_target(&self, target: OutputTarget) -> AdapterResult<()> {
        self.ensure_running("set_output_target")?;
        self.codec
            .set_output_target(target)
            .map_err(AdapterError::CodecRuntime)
    }

    fn set_parameters(&self, params: &Parameters) -> AdapterResult<()> {
        self.ensure_running("set_parameters")?;
        self.codec
            .set_parameters(params)
            .map_err(AdapterError::CodecRuntime)
    }

    fn set_video_scaling_mode(&self, mode: ScalingMode) -> AdapterResult<()> {
        self.ensure_running("set_video_scaling_mode")?;
        self.codec
            .set_video_scaling_mode(mode)
            .map_err(AdapterError::CodecRuntime)
    }

    fn set_on_frame_rendered_listener(
        &self,
        listener: FrameRenderedListener,
        handle: Handle,
    ) -> AdapterResult<()> {
        self.ensure_running("set_on_frame_rendered_listener")?;
        self.codec
            .set_on_frame_rendered_listener(Some(dispatch_on(listener, handle)));
        Ok(())
    }

    fn metrics(&self) -> AdapterResult<Metrics> {
        self.ensure_running("metrics")?;
        Ok(self.codec.metrics())
    }
}

impl Drop for SyncCodecAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct SyncCodecAdapterFactory {
    provider: Arc<dyn CodecProvider>,
}

impl SyncCodecAdapterFactory {
    pub fn new(provider: Arc<dyn CodecProvider>) -> Self {
        Self { provider }
    }

    pub fn create(&self, configuration: &Configuration) -> AdapterResult<SyncCodecAdapter> {
        configuration
            .validate()
            .map_err(AdapterError::Configuration)?;
        let codec = self
            .provider
            .create_codec(&configuration.codec_name)
            .map_err(AdapterError::Configuration)?;

        let started = codec
            .configure(
                &configuration.format,
                configuration.output_target,
                configuration.crypto_session.as_ref(),
                configuration.flags,
            )
            .and_then(|_| codec.start());
        if let Err(e) = started {
            log::error!("starting codec {} failed: {}", codec.name(), e);
            codec.release();
            return Err(AdapterError::Configuration(e));
        }
        log::info!(
            "codec {} started in synchronous mode for {}",
            codec.name(),
            configuration.format
        );
        Ok(SyncCodecAdapter::new(codec))
    }
}

impl CodecAdapterFactory for SyncCodecAdapterFactory {
    fn create_adapter(&self, configuration: Configuration) -> AdapterResult<Box<dyn CodecAdapter>> {
        Ok(Box::new(self.create(&configuration)?))
    }
}

#[cfg(test)]
#[path = "sync_adapter_test.rs"]
mod sync_adapter_test;
