use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    codec::Codec,
    enqueuer::{BufferEnqueuer, QueuedSubmission},
    error::{AdapterError, CodecError, ERROR_DECODE},
    mock::{Call, RecordingCodec, poll_until},
};

const TIMEOUT: Duration = Duration::from_secs(2);

fn enqueuer_for(codec: &Arc<RecordingCodec>) -> BufferEnqueuer {
    let codec: Arc<dyn Codec> = codec.clone();
    BufferEnqueuer::new("codec-queueing:test", Arc::downgrade(&codec))
}

fn plain(index: i32, presentation_time_us: i64) -> QueuedSubmission {
    QueuedSubmission::Plain {
        index,
        offset: 0,
        size: 100,
        presentation_time_us,
        flags: 0,
    }
}

fn issued_timestamps(codec: &RecordingCodec) -> Vec<i64> {
    codec
        .submissions()
        .into_iter()
        .filter_map(|call| match call {
            Call::QueueInput {
                presentation_time_us,
                ..
            } => Some(presentation_time_us),
            _ => None,
        })
        .collect()
}

#[test]
fn test_submissions_are_issued_in_order() -> anyhow::Result<()> {
    let codec = RecordingCodec::new("test");
    let enqueuer = enqueuer_for(&codec);
    enqueuer.start()?;

    for i in 0..100 {
        enqueuer.enqueue(plain(i % 4, i64::from(i) * 1000))?;
    }
    enqueuer.wait_until_drained()?;

    let expected: Vec<i64> = (0..100).map(|i| i * 1000).collect();
    assert_eq!(issued_timestamps(&codec), expected);
    assert_eq!(enqueuer.counters(), (100, 100));
    assert_eq!(enqueuer.pending(), 0);
    Ok(())
}

#[test]
fn test_concurrent_callers_keep_invocation_order() -> anyhow::Result<()> {
    let codec = RecordingCodec::new("test");
    let enqueuer = enqueuer_for(&codec);
    enqueuer.start()?;
    // serializes the callers so the invocation order is known
    let invoked = Mutex::new(Vec::new());

    std::thread::scope(|s| {
        for thread in 0..4i64 {
            let enqueuer = &enqueuer;
            let invoked = &invoked;
            s.spawn(move || {
                for i in 0..50 {
                    let pts = thread * 1_000_000 + i;
                    let mut invoked = invoked.lock();
                    if enqueuer.enqueue(plain(0, pts)).is_ok() {
                        invoked.push(pts);
                    }
                }
            });
        }
    });
    enqueuer.wait_until_drained()?;

    let invoked = invoked.into_inner();
    assert_eq!(invoked.len(), 200);
    assert_eq!(issued_timestamps(&codec), invoked);
    Ok(())
}

#[test]
fn test_wait_until_drained_blocks_on_backlog() -> anyhow::Result<()> {
    let codec = RecordingCodec::new("test");
    let enqueuer = enqueuer_for(&codec);
    enqueuer.start()?;
    codec.close_gate();
    for i in 0..3 {
        enqueuer.enqueue(plain(i, i64::from(i)))?;
    }

    let (done_tx, done_rx) = mpsc::channel();
    std::thread::scope(|s| -> anyhow::Result<()> {
        s.spawn(|| {
            let _ = done_tx.send(enqueuer.wait_until_drained());
        });
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(codec.submissions().is_empty());

        codec.open_gate();
        done_rx.recv_timeout(TIMEOUT)??;
        Ok(())
    })?;
    assert_eq!(codec.submissions().len(), 3);
    Ok(())
}

#[test]
fn test_flush_discards_unissued_submissions() -> anyhow::Result<()> {
    let codec = RecordingCodec::new("test");
    let enqueuer = enqueuer_for(&codec);
    enqueuer.start()?;
    codec.close_gate();
    for i in 0..5 {
        enqueuer.enqueue(plain(i, i64::from(i)))?;
    }
    assert!(poll_until(TIMEOUT, || codec.waiting_at_gate() == 1));

    std::thread::scope(|s| -> anyhow::Result<()> {
        let flush = s.spawn(|| enqueuer.flush());
        // flush has dropped the backlog and now waits for the one in flight
        assert!(poll_until(TIMEOUT, || enqueuer.pending() == 0));
        codec.open_gate();
        flush
            .join()
            .map_err(|_| anyhow::anyhow!("flush thread panicked"))??;
        Ok(())
    })?;

    assert_eq!(issued_timestamps(&codec), vec![0]);

    enqueuer.enqueue(plain(1, 99))?;
    enqueuer.wait_until_drained()?;
    assert_eq!(issued_timestamps(&codec), vec![0, 99]);
    assert_eq!(enqueuer.counters(), (6, 2));
    Ok(())
}

#[test]
fn test_flush_wakes_drain_waiters() -> anyhow::Result<()> {
    let codec = RecordingCodec::new("test");
    let enqueuer = enqueuer_for(&codec);
    // accepts submissions, but nothing pops them
    enqueuer.shared.queue.lock().worker_alive = true;
    enqueuer.enqueue(plain(0, 0))?;

    let (done_tx, done_rx) = mpsc::channel();
    std::thread::scope(|s| -> anyhow::Result<()> {
        s.spawn(|| {
            let _ = done_tx.send(enqueuer.wait_until_drained());
        });
        assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

        enqueuer.flush()?;
        done_rx.recv_timeout(TIMEOUT)??;
        Ok(())
    })?;
    assert!(codec.submissions().is_empty());
    assert_eq!(enqueuer.pending(), 0);
    Ok(())
}

#[test]
fn test_secure_submission_is_forwarded() -> anyhow::Result<()> {
    let codec = RecordingCodec::new("test");
    let enqueuer = enqueuer_for(&codec);
    enqueuer.start()?;
    let crypto_info = crate::types::CryptoInfo::new(
        vec![16],
        vec![64],
        bytes::Bytes::from_static(b"0123456789abcdef"),
        bytes::Bytes::from_static(b"fedcba9876543210"),
        crate::types::EncryptionMode::AesCbc,
    )
    .with_pattern(1, 9);

    enqueuer.enqueue(QueuedSubmission::Secure {
        index: 2,
        offset: 8,
        crypto_info: crypto_info.clone(),
        presentation_time_us: 5000,
        flags: 1,
    })?;
    enqueuer.wait_until_drained()?;

    assert_eq!(
        codec.submissions(),
        vec![Call::QueueSecureInput {
            index: 2,
            offset: 8,
            crypto_info,
            presentation_time_us: 5000,
            flags: 1,
        }]
    );
    Ok(())
}

#[test]
fn test_first_failure_is_sticky() -> anyhow::Result<()> {
    let codec = RecordingCodec::new("test");
    let error = CodecError::fatal(ERROR_DECODE, "bitstream rejected");
    codec.fail_on("queue_input_buffer", error.clone());
    let enqueuer = enqueuer_for(&codec);
    enqueuer.start()?;

    enqueuer.enqueue(plain(0, 0))?;
    assert!(poll_until(TIMEOUT, || enqueuer
        .maybe_raise_pending_exception()
        .is_err()));

    let expected = AdapterError::CodecRuntime(error);
    assert_eq!(enqueuer.maybe_raise_pending_exception(), Err(expected.clone()));
    assert_eq!(enqueuer.enqueue(plain(1, 1)), Err(expected));
    assert_eq!(enqueuer.counters(), (1, 0));
    Ok(())
}

#[test]
fn test_released_codec_is_reported() -> anyhow::Result<()> {
    let codec = RecordingCodec::new("test");
    let enqueuer = enqueuer_for(&codec);
    enqueuer.start()?;
    drop(codec);

    enqueuer.enqueue(plain(0, 0))?;
    assert!(poll_until(TIMEOUT, || enqueuer
        .maybe_raise_pending_exception()
        .is_err()));
    Ok(())
}

#[test]
fn test_shutdown_is_idempotent() -> anyhow::Result<()> {
    let codec = RecordingCodec::new("test");
    let enqueuer = enqueuer_for(&codec);
    enqueuer.start()?;
    enqueuer.enqueue(plain(0, 0))?;

    enqueuer.shutdown()?;
    enqueuer.shutdown()?;

    assert!(matches!(
        enqueuer.enqueue(plain(1, 1)),
        Err(AdapterError::Usage(_))
    ));
    assert!(matches!(enqueuer.start(), Err(AdapterError::Usage(_))));
    Ok(())
}
