use std::time::Duration;

use crate::{
    codec::CodecEvent,
    error::{AdapterError, CodecError, ERROR_RECLAIMED},
    mock::poll_until,
    multiplexer::EventMultiplexer,
    types::{BufferInfo, FORMAT_CHANGED, FormatDescriptor, MIME_VIDEO_RAW, NO_BUFFER},
};

const TIMEOUT: Duration = Duration::from_secs(2);

fn next_event(mux: &EventMultiplexer) -> Option<CodecEvent> {
    let mut event = None;
    poll_until(TIMEOUT, || {
        event = mux.dequeue_next();
        event.is_some()
    });
    event
}

fn next_input(mux: &EventMultiplexer) -> anyhow::Result<i32> {
    let mut index = NO_BUFFER;
    let mut result = Ok(());
    poll_until(TIMEOUT, || match mux.dequeue_input_buffer_index() {
        Ok(i) => {
            index = i;
            i != NO_BUFFER
        }
        Err(e) => {
            result = Err(e);
            true
        }
    });
    result?;
    Ok(index)
}

fn next_output(mux: &EventMultiplexer, info: &mut BufferInfo) -> anyhow::Result<i32> {
    let mut index = NO_BUFFER;
    let mut result = Ok(());
    poll_until(TIMEOUT, || match mux.dequeue_output_buffer_index(info) {
        Ok(i) => {
            index = i;
            i != NO_BUFFER
        }
        Err(e) => {
            result = Err(e);
            true
        }
    });
    result?;
    Ok(index)
}

fn raw_format() -> FormatDescriptor {
    FormatDescriptor::video(MIME_VIDEO_RAW, 1280, 720)
}

#[test]
fn test_events_keep_delivery_order() -> anyhow::Result<()> {
    let mux = EventMultiplexer::new("codec-callback:test");
    let sender = mux.start()?;
    let info = BufferInfo::new(0, 64, 1000, 0);

    sender.send(CodecEvent::InputAvailable(0));
    sender.send(CodecEvent::OutputAvailable(1, info));
    sender.send(CodecEvent::InputAvailable(2));
    sender.send(CodecEvent::FormatChanged(raw_format()));
    sender.send(CodecEvent::OutputAvailable(3, info));

    assert_eq!(next_event(&mux), Some(CodecEvent::InputAvailable(0)));
    assert_eq!(next_event(&mux), Some(CodecEvent::OutputAvailable(1, info)));
    assert_eq!(next_event(&mux), Some(CodecEvent::InputAvailable(2)));
    assert_eq!(next_event(&mux), Some(CodecEvent::FormatChanged(raw_format())));
    assert_eq!(next_event(&mux), Some(CodecEvent::OutputAvailable(3, info)));
    assert_eq!(mux.dequeue_next(), None);
    Ok(())
}

#[test]
fn test_input_indices_are_fifo() -> anyhow::Result<()> {
    let mux = EventMultiplexer::new("codec-callback:test");
    let sender = mux.start()?;
    for index in [5, 6, 7] {
        sender.send(CodecEvent::InputAvailable(index));
    }

    assert_eq!(next_input(&mux)?, 5);
    assert_eq!(next_input(&mux)?, 6);
    assert_eq!(next_input(&mux)?, 7);
    assert_eq!(mux.dequeue_input_buffer_index()?, NO_BUFFER);
    Ok(())
}

#[test]
fn test_format_change_before_output() -> anyhow::Result<()> {
    let mux = EventMultiplexer::new("codec-callback:test");
    let sender = mux.start()?;
    assert_eq!(mux.output_format(), None);

    sender.send(CodecEvent::FormatChanged(raw_format()));
    sender.send(CodecEvent::OutputAvailable(0, BufferInfo::new(0, 188, 40_000, 1)));

    let mut info = BufferInfo::default();
    assert_eq!(next_output(&mux, &mut info)?, FORMAT_CHANGED);
    assert_eq!(info, BufferInfo::default());
    assert_eq!(mux.output_format(), Some(raw_format()));

    assert_eq!(next_output(&mux, &mut info)?, 0);
    assert_eq!(info, BufferInfo::new(0, 188, 40_000, 1));
    Ok(())
}

#[test]
fn test_flush_discards_everything_before_the_barrier() -> anyhow::Result<()> {
    let mux = EventMultiplexer::new("codec-callback:test");
    let sender = mux.start()?;

    sender.send(CodecEvent::InputAvailable(1));
    sender.send(CodecEvent::OutputAvailable(2, BufferInfo::new(0, 10, 0, 0)));
    mux.flush();
    sender.send(CodecEvent::InputAvailable(9));

    let mut seen = Vec::new();
    let found = poll_until(TIMEOUT, || match mux.dequeue_input_buffer_index() {
        Ok(NO_BUFFER) => false,
        Ok(index) => {
            seen.push(index);
            index == 9
        }
        Err(_) => true,
    });
    assert!(found);
    assert_eq!(seen, vec![9]);

    let mut info = BufferInfo::default();
    assert_eq!(mux.dequeue_output_buffer_index(&mut info)?, NO_BUFFER);
    Ok(())
}

#[test]
fn test_flush_reannounces_undelivered_format() -> anyhow::Result<()> {
    let mux = EventMultiplexer::new("codec-callback:test");
    let sender = mux.start()?;

    sender.send(CodecEvent::FormatChanged(raw_format()));
    sender.send(CodecEvent::OutputAvailable(0, BufferInfo::new(0, 10, 0, 0)));
    mux.flush();
    sender.send(CodecEvent::OutputAvailable(3, BufferInfo::new(0, 20, 33_000, 0)));

    let mut info = BufferInfo::default();
    assert_eq!(next_output(&mux, &mut info)?, FORMAT_CHANGED);
    assert_eq!(mux.output_format(), Some(raw_format()));
    assert_eq!(next_output(&mux, &mut info)?, 3);
    assert_eq!(info.presentation_time_us, 33_000);
    Ok(())
}

#[test]
fn test_consecutive_flushes() -> anyhow::Result<()> {
    let mux = EventMultiplexer::new("codec-callback:test");
    let sender = mux.start()?;

    sender.send(CodecEvent::InputAvailable(1));
    mux.flush();
    sender.send(CodecEvent::InputAvailable(2));
    mux.flush();
    sender.send(CodecEvent::InputAvailable(3));

    assert_eq!(next_input(&mux)?, 3);
    assert_eq!(mux.dequeue_input_buffer_index()?, NO_BUFFER);
    Ok(())
}

#[test]
fn test_error_is_sticky() -> anyhow::Result<()> {
    let mux = EventMultiplexer::new("codec-callback:test");
    let sender = mux.start()?;
    let error = CodecError::fatal(ERROR_RECLAIMED, "codec reclaimed");

    sender.send(CodecEvent::Error(error.clone()));
    sender.send(CodecEvent::InputAvailable(1));

    assert!(poll_until(TIMEOUT, || mux.maybe_raise_error().is_err()));
    let expected = AdapterError::CodecRuntime(error.clone());
    for _ in 0..3 {
        assert_eq!(mux.dequeue_input_buffer_index(), Err(expected.clone()));
        assert_eq!(
            mux.dequeue_output_buffer_index(&mut BufferInfo::default()),
            Err(expected.clone())
        );
        assert_eq!(mux.dequeue_next(), Some(CodecEvent::Error(error.clone())));
    }

    // a flush does not clear it either
    mux.flush();
    assert_eq!(mux.maybe_raise_error(), Err(expected));
    Ok(())
}

#[test]
fn test_shutdown_is_idempotent() -> anyhow::Result<()> {
    let mux = EventMultiplexer::new("codec-callback:test");
    let sender = mux.start()?;
    sender.send(CodecEvent::InputAvailable(4));

    mux.shutdown();
    mux.shutdown();

    assert_eq!(mux.dequeue_input_buffer_index()?, NO_BUFFER);
    assert!(!sender.send(CodecEvent::InputAvailable(5)));
    assert!(matches!(mux.start(), Err(AdapterError::Usage(_))));
    Ok(())
}
