use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use codec_bus::{
    AsyncCodecAdapterFactory, BufferInfo, CodecAdapter, CodecAdapterFactory, CodecProvider,
    FORMAT_CHANGED, Metrics, NO_BUFFER, SyncCodecAdapterFactory, buffer_flags,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{AdapterMode, Backend, RelayConfig},
    source::AccessUnitSource,
};

const IDLE_SLEEP: Duration = Duration::from_millis(1);

fn provider_for(backend: Backend) -> anyhow::Result<Arc<dyn CodecProvider>> {
    match backend {
        Backend::Loopback => Ok(codec_bus::loopback_provider()),
        #[cfg(feature = "ffmpeg")]
        Backend::Ffmpeg => Ok(codec_bus::ffmpeg::ffmpeg_provider()),
        #[cfg(not(feature = "ffmpeg"))]
        Backend::Ffmpeg => anyhow::bail!("built without the ffmpeg feature"),
    }
}

fn create_adapter(config: &RelayConfig) -> anyhow::Result<Box<dyn CodecAdapter>> {
    let provider = provider_for(config.backend)?;
    let factory: Box<dyn CodecAdapterFactory> = match config.mode {
        AdapterMode::Async => Box::new(
            AsyncCodecAdapterFactory::new(provider, config.track_type())
                .with_synchronized_queueing(config.synchronize_queueing),
        ),
        AdapterMode::Sync => Box::new(SyncCodecAdapterFactory::new(provider)),
    };
    Ok(factory.create_adapter(config.configuration())?)
}

/// Decodes every access unit of the configured source and returns the
/// adapter metrics. Blocks the calling thread; rendered frame notifications
/// run on `handle`.
pub fn run(
    config: &RelayConfig,
    cancel: CancellationToken,
    handle: Handle,
) -> anyhow::Result<Metrics> {
    let mut source = AccessUnitSource::open(config)?;
    let adapter = create_adapter(config)?;
    log::info!(
        "{} started in {:?} mode on {:?}",
        config.codec_name,
        config.mode,
        config.backend
    );

    let rendered = Arc::new(AtomicU64::new(0));
    adapter.set_on_frame_rendered_listener(
        Arc::new({
            let rendered = rendered.clone();
            move |presentation_time_us: i64, render_time_ns: i64| {
                rendered.fetch_add(1, Ordering::Relaxed);
                log::trace!("rendered {} at {}ns", presentation_time_us, render_time_ns);
            }
        }),
        handle,
    )?;

    let result = pump(adapter.as_ref(), config, &mut source, &cancel);
    let metrics = result.and_then(|outputs| {
        let mut metrics = adapter.metrics()?;
        metrics.insert("session.outputs".to_string(), outputs.into());
        metrics.insert(
            "session.rendered_notifications".to_string(),
            rendered.load(Ordering::Relaxed).into(),
        );
        Ok(metrics)
    });
    adapter.release();
    metrics
}

/// Runs the poll loop until the end of stream comes out of the codec.
/// Returns the number of output buffers seen.
fn pump(
    adapter: &dyn CodecAdapter,
    config: &RelayConfig,
    source: &mut AccessUnitSource,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    let mut queued = 0u32;
    let mut input_done = false;
    let mut flushed = false;
    let mut outputs = 0u64;
    let mut info = BufferInfo::default();

    loop {
        if cancel.is_cancelled() {
            log::warn!("session cancelled after {} outputs", outputs);
            return Ok(outputs);
        }
        let mut progressed = false;

        if !input_done {
            let index = adapter.dequeue_input_buffer_index()?;
            if index != NO_BUFFER {
                progressed = true;
                let buffer = adapter
                    .input_buffer(index)
                    .ok_or_else(|| anyhow::anyhow!("input buffer {} unavailable", index))?;
                match source.next_access_unit() {
                    Some(unit) => {
                        let size = unit.data.len();
                        {
                            let mut data = buffer.lock();
                            data.clear();
                            data.extend_from_slice(&unit.data);
                        }
                        adapter.queue_input_buffer(
                            index,
                            0,
                            size,
                            unit.presentation_time_us,
                            unit.flags,
                        )?;
                        queued += 1;
                    }
                    None => {
                        buffer.lock().clear();
                        adapter.queue_input_buffer(index, 0, 0, 0, buffer_flags::END_OF_STREAM)?;
                        input_done = true;
                        log::debug!("end of stream queued after {} access units", queued);
                    }
                }
            }
        }

        if !flushed && config.flush_after == Some(queued) && !input_done {
            log::info!("flushing after {} access units", queued);
            adapter.flush()?;
            flushed = true;
            continue;
        }

        let index = adapter.dequeue_output_buffer_index(&mut info)?;
        if index == FORMAT_CHANGED {
            progressed = true;
            log::info!("output format changed: {}", adapter.output_format()?);
        } else if index != NO_BUFFER {
            progressed = true;
            outputs += 1;
            let end_of_stream = info.is_end_of_stream();
            adapter.release_output_buffer(index, config.render && info.size > 0)?;
            if end_of_stream {
                log::info!("end of stream after {} outputs", outputs);
                return Ok(outputs);
            }
        }

        if !progressed {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
