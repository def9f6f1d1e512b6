//! Adapter that runs the codec in asynchronous mode.
//!
//! Notifications are collected by an [`EventMultiplexer`] and input buffers
//! are issued by a [`BufferEnqueuer`], each on its own thread. The caller
//! thread only ever polls.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::{
    adapter::{CodecAdapter, CodecAdapterFactory, dispatch_on},
    codec::{Codec, CodecBuffer, CodecProvider, FrameRenderedListener},
    enqueuer::{BufferEnqueuer, QueuedSubmission},
    error::{AdapterError, AdapterResult},
    multiplexer::EventMultiplexer,
    types::{
        BufferInfo, Configuration, CryptoInfo, FormatDescriptor, Metrics, OutputTarget,
        Parameters, ScalingMode, TrackType,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Created,
    Initialized,
    ShutDown,
}

pub struct AsyncCodecAdapter {
    codec: Arc<dyn Codec>,
    callback: EventMultiplexer,
    enqueuer: BufferEnqueuer,
    synchronize_codec_interactions_with_queueing: bool,
    state: Mutex<AdapterState>,
    codec_released: AtomicBool,
    configured_format: Mutex<Option<FormatDescriptor>>,
    flushes: AtomicU64,
}

/// Releases the codec when dropped, so an early return or a panic during
/// teardown still frees the session.
struct CodecReleaseGuard<'a>(&'a AsyncCodecAdapter);

impl Drop for CodecReleaseGuard<'_> {
    fn drop(&mut self) {
        self.0.release_codec_once();
    }
}

impl AsyncCodecAdapter {
    pub fn new(
        codec: Arc<dyn Codec>,
        track_type: TrackType,
        synchronize_codec_interactions_with_queueing: bool,
    ) -> Self {
        let track = track_type.label();
        Self {
            callback: EventMultiplexer::new(&format!("codec-callback:{}", track)),
            enqueuer: BufferEnqueuer::new(
                &format!("codec-queueing:{}", track),
                Arc::downgrade(&codec),
            ),
            codec,
            synchronize_codec_interactions_with_queueing,
            state: Mutex::new(AdapterState::Created),
            codec_released: AtomicBool::new(false),
            configured_format: Mutex::new(None),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    /// Configures and starts the codec. On failure everything created so far
    /// is torn down, the codec is released and the adapter is shut down.
    pub fn initialize(&self, configuration: &Configuration) -> AdapterResult<()> {
        let mut state = self.state.lock();
        if *state != AdapterState::Created {
            return Err(AdapterError::usage(format!(
                "initialize called in state {:?}",
                *state
            )));
        }

        log::info!(
            "initializing codec {} for {}",
            self.codec.name(),
            configuration.format
        );
        match self.initialize_internal(configuration) {
            Ok(()) => {
                *self.configured_format.lock() = Some(configuration.format.clone());
                *state = AdapterState::Initialized;
                Ok(())
            }
            Err(e) => {
                log::error!("initialize codec {} failed: {}", self.codec.name(), e);
                let _release = CodecReleaseGuard(self);
                if let Err(e) = self.enqueuer.shutdown() {
                    log::warn!("enqueuer shutdown after failed initialize: {}", e);
                }
                self.callback.shutdown();
                *state = AdapterState::ShutDown;
                Err(e)
            }
        }
    }

    fn initialize_internal(&self, configuration: &Configuration) -> AdapterResult<()> {
        configuration
            .validate()
            .map_err(AdapterError::Configuration)?;
        let sender = self.callback.start()?;
        self.codec
            .set_callback(Some(sender))
            .map_err(AdapterError::Configuration)?;
        self.codec
            .configure(
                &configuration.format,
                configuration.output_target,
                configuration.crypto_session.as_ref(),
                configuration.flags,
            )
            .map_err(AdapterError::Configuration)?;
        self.enqueuer.start()?;
        self.codec.start().map_err(AdapterError::Configuration)?;
        Ok(())
    }

    fn initialized(&self, operation: &str) -> AdapterResult<MutexGuard<'_, AdapterState>> {
        let state = self.state.lock();
        if *state != AdapterState::Initialized {
            return Err(AdapterError::usage(format!(
                "{} requires an initialized adapter, state is {:?}",
                operation, *state
            )));
        }
        Ok(state)
    }

    fn not_released(&self, operation: &str) -> AdapterResult<()> {
        let state = *self.state.lock();
        if state == AdapterState::ShutDown {
            return Err(AdapterError::usage(format!(
                "{} called after release",
                operation
            )));
        }
        Ok(())
    }

    fn release_codec_once(&self) {
        if self.codec_released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.codec.release();
        log::info!("codec {} released", self.codec.name());
    }

    /// Waits for pending submissions so the codec never sees a configuration
    /// change interleaved with buffers queued before it.
    fn maybe_block_on_queueing(&self) -> AdapterResult<()> {
        if !self.synchronize_codec_interactions_with_queueing {
            return Ok(());
        }
        self.enqueuer.wait_until_drained().inspect_err(|e| {
            // the caller cannot resume a half-applied configuration change
            log::error!("codec {}: {}", self.codec.name(), e);
        })
    }
}

impl CodecAdapter for AsyncCodecAdapter {
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
        let _state = self.initialized("queue_input_buffer")?;
        self.callback.maybe_raise_error()?;
        self.enqueuer.enqueue(QueuedSubmission::Plain {
            index,
            offset,
            size,
            presentation_time_us,
            flags,
        })
    }

    fn queue_secure_input_buffer(
        &self,
        index: i32,
        offset: usize,
        crypto_info: &CryptoInfo,
        presentation_time_us: i64,
        flags: u32,
    ) -> AdapterResult<()> {
        let _state = self.initialized("queue_secure_input_buffer")?;
        self.callback.maybe_raise_error()?;
        self.enqueuer.enqueue(QueuedSubmission::Secure {
            index,
            offset,
            crypto_info: crypto_info.clone(),
            presentation_time_us,
            flags,
        })
    }

    fn dequeue_input_buffer_index(&self) -> AdapterResult<i32> {
        let _state = self.initialized("dequeue_input_buffer_index")?;
        self.enqueuer.maybe_raise_pending_exception()?;
        self.callback.dequeue_input_buffer_index()
    }

    fn dequeue_output_buffer_index(&self, info: &mut BufferInfo) -> AdapterResult<i32> {
        let _state = self.initialized("dequeue_output_buffer_index")?;
        self.enqueuer.maybe_raise_pending_exception()?;
        self.callback.dequeue_output_buffer_index(info)
    }

    fn output_format(&self) -> AdapterResult<FormatDescriptor> {
        if let Some(format) = self.callback.output_format() {
            return Ok(format);
        }
        self.configured_format
            .lock()
            .clone()
            .ok_or_else(|| AdapterError::usage("output format requested before initialize"))
    }

    fn input_buffer(&self, index: i32) -> Option<CodecBuffer> {
        let _state = self.initialized("input_buffer").ok()?;
        self.codec.input_buffer(index)
    }

    fn output_buffer(&self, index: i32) -> Option<CodecBuffer> {
        let _state = self.initialized("output_buffer").ok()?;
        self.codec.output_buffer(index)
    }

    fn release_output_buffer(&self, index: i32, render: bool) -> AdapterResult<()> {
        let _state = self.initialized("release_output_buffer")?;
        self.codec
            .release_output_buffer(index, render)
            .map_err(AdapterError::CodecRuntime)
    }

    fn release_output_buffer_at(&self, index: i32, render_time_ns: i64) -> AdapterResult<()> {
        let _state = self.initialized("release_output_buffer_at")?;
        self.codec
            .release_output_buffer_at(index, render_time_ns)
            .map_err(AdapterError::CodecRuntime)
    }

    fn flush(&self) -> AdapterResult<()> {
        let _state = self.initialized("flush")?;
        log::debug!("flushing codec {}", self.codec.name());
        // 1. stop issuing input buffers and drop the ones not issued yet
        self.enqueuer.flush()?;
        // 2. the codec stops producing buffers for pre-flush work
        self.codec.flush().map_err(AdapterError::CodecRuntime)?;
        // 3. drop queued events and whatever is still in flight behind them
        self.callback.flush();
        // 4. resume; new notifications land behind the flush barrier
        self.codec.start().map_err(AdapterError::CodecRuntime)?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        let _release = CodecReleaseGuard(self);
        if *state == AdapterState::Initialized {
            if let Err(e) = self.enqueuer.shutdown() {
                log::warn!("enqueuer shutdown during release: {}", e);
            }
            self.callback.shutdown();
        }
        *state = AdapterState::ShutDown;
    }

    fn set_output_target(&self, target: OutputTarget) -> AdapterResult<()> {
        self.not_released("set_output_target")?;
        self.maybe_block_on_queueing()?;
        self.codec
            .set_output_target(target)
            .map_err(AdapterError::CodecRuntime)
    }

    fn set_parameters(&self, params: &Parameters) -> AdapterResult<()> {
        self.not_released("set_parameters")?;
        self.maybe_block_on_queueing()?;
        self.codec
            .set_parameters(params)
            .map_err(AdapterError::CodecRuntime)
    }

    fn set_video_scaling_mode(&self, mode: ScalingMode) -> AdapterResult<()> {
        self.not_released("set_video_scaling_mode")?;
        self.maybe_block_on_queueing()?;
        self.codec
            .set_video_scaling_mode(mode)
            .map_err(AdapterError::CodecRuntime)
    }

    fn set_on_frame_rendered_listener(
        &self,
        listener: FrameRenderedListener,
        handle: Handle,
    ) -> AdapterResult<()> {
        self.not_released("set_on_frame_rendered_listener")?;
        self.maybe_block_on_queueing()?;
        self.codec
            .set_on_frame_rendered_listener(Some(dispatch_on(listener, handle)));
        Ok(())
    }

    fn metrics(&self) -> AdapterResult<Metrics> {
        self.not_released("metrics")?;
        self.maybe_block_on_queueing()?;
        let mut metrics = self.codec.metrics();
        let (queued, issued) = self.enqueuer.counters();
        metrics.insert(
            "adapter.state".to_string(),
            Value::from(format!("{:?}", self.state())),
        );
        metrics.insert("adapter.submissions_queued".to_string(), Value::from(queued));
        metrics.insert("adapter.submissions_issued".to_string(), Value::from(issued));
        metrics.insert(
            "adapter.submissions_pending".to_string(),
            Value::from(self.enqueuer.pending()),
        );
        metrics.insert(
            "adapter.flushes".to_string(),
            Value::from(self.flushes.load(Ordering::Relaxed)),
        );
        Ok(metrics)
    }
}

impl Drop for AsyncCodecAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

/// Creates codecs by name and wraps them in an initialized [`AsyncCodecAdapter`].
pub struct AsyncCodecAdapterFactory {
    provider: Arc<dyn CodecProvider>,
    track_type: TrackType,
    synchronize_codec_interactions_with_queueing: bool,
}

impl AsyncCodecAdapterFactory {
    pub fn new(provider: Arc<dyn CodecProvider>, track_type: TrackType) -> Self {
        Self {
            provider,
            track_type,
            synchronize_codec_interactions_with_queueing: false,
        }
    }

    /// When enabled, configuration changes wait until every queued input
    /// buffer was handed to the codec.
    pub fn with_synchronized_queueing(mut self, enabled: bool) -> Self {
        self.synchronize_codec_interactions_with_queueing = enabled;
        self
    }

    pub fn create(&self, configuration: &Configuration) -> AdapterResult<AsyncCodecAdapter> {
        let codec = self
            .provider
            .create_codec(&configuration.codec_name)
            .map_err(AdapterError::Configuration)?;
        let adapter = AsyncCodecAdapter::new(
            codec,
            self.track_type,
            self.synchronize_codec_interactions_with_queueing,
        );
        // a failed initialize already released the codec
        adapter.initialize(configuration)?;
        Ok(adapter)
    }
}

impl CodecAdapterFactory for AsyncCodecAdapterFactory {
    fn create_adapter(&self, configuration: Configuration) -> AdapterResult<Box<dyn CodecAdapter>> {
        Ok(Box::new(self.create(&configuration)?))
    }
}

#[cfg(test)]
#[path = "async_adapter_test.rs"]
mod async_adapter_test;
