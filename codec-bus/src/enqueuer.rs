//! Serializes input buffer submissions onto a dedicated thread.
//!
//! Callers push [`QueuedSubmission`]s from any thread; the worker issues them
//! to the codec one at a time in push order. Every submission gets a sequence
//! number, and `retired` counts those that were either issued or discarded,
//! which is what `wait_until_drained` and `flush` wait on.

use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::Codec,
    error::{AdapterError, AdapterResult, CodecError},
    types::CryptoInfo,
};

#[derive(Clone, Debug, PartialEq)]
pub enum QueuedSubmission {
    Plain {
        index: i32,
        offset: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    },
    Secure {
        index: i32,
        offset: usize,
        crypto_info: CryptoInfo,
        presentation_time_us: i64,
        flags: u32,
    },
}

impl QueuedSubmission {
    fn issue(&self, codec: &dyn Codec) -> Result<(), CodecError> {
        match self {
            QueuedSubmission::Plain {
                index,
                offset,
                size,
                presentation_time_us,
                flags,
            } => codec.queue_input_buffer(*index, *offset, *size, *presentation_time_us, *flags),
            QueuedSubmission::Secure {
                index,
                offset,
                crypto_info,
                presentation_time_us,
                flags,
            } => codec.queue_secure_input_buffer(
                *index,
                *offset,
                crypto_info,
                *presentation_time_us,
                *flags,
            ),
        }
    }
}

#[derive(Default)]
struct QueueState {
    submissions: VecDeque<QueuedSubmission>,
    enqueued: u64,
    retired: u64,
    issued: u64,
    worker_alive: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    work_ready: Condvar,
    progress: Condvar,
    pending_error: Mutex<Option<CodecError>>,
    cancel: CancellationToken,
}

/// Marks the worker as gone when its thread exits, including by panic.
struct WorkerExitGuard(Arc<Shared>);

impl Drop for WorkerExitGuard {
    fn drop(&mut self) {
        self.0.queue.lock().worker_alive = false;
        self.0.progress.notify_all();
    }
}

pub struct BufferEnqueuer {
    label: String,
    codec: Weak<dyn Codec>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferEnqueuer {
    /// `codec` is a non-owning reference; the adapter owns the session.
    pub fn new(label: &str, codec: Weak<dyn Codec>) -> Self {
        Self {
            label: label.to_string(),
            codec,
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState::default()),
                work_ready: Condvar::new(),
                progress: Condvar::new(),
                pending_error: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) -> AdapterResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        if self.shared.cancel.is_cancelled() {
            return Err(AdapterError::usage(format!(
                "buffer enqueuer {} cannot restart after shutdown",
                self.label
            )));
        }

        self.shared.queue.lock().worker_alive = true;
        let shared = Arc::clone(&self.shared);
        let codec = self.codec.clone();
        let handle = std::thread::Builder::new()
            .name(self.label.clone())
            .spawn(move || Self::queueing_loop(shared, codec))
            .map_err(|e| {
                self.shared.queue.lock().worker_alive = false;
                AdapterError::Configuration(CodecError::fatal(
                    crate::error::ERROR_INSUFFICIENT_RESOURCE,
                    format!("failed to spawn queueing thread: {}", e),
                ))
            })?;
        *worker = Some(handle);
        log::debug!("buffer enqueuer {} started", self.label);
        Ok(())
    }

    fn queueing_loop(shared: Arc<Shared>, codec: Weak<dyn Codec>) {
        let _guard = WorkerExitGuard(Arc::clone(&shared));
        loop {
            let submission = {
                let mut queue = shared.queue.lock();
                loop {
                    if shared.cancel.is_cancelled() {
                        return;
                    }
                    if let Some(submission) = queue.submissions.pop_front() {
                        break submission;
                    }
                    shared.work_ready.wait(&mut queue);
                }
            };

            let issued = Self::issue(&shared, &codec, &submission);

            let mut queue = shared.queue.lock();
            queue.retired += 1;
            if issued {
                queue.issued += 1;
            }
            drop(queue);
            shared.progress.notify_all();
        }
    }

    fn issue(shared: &Shared, codec: &Weak<dyn Codec>, submission: &QueuedSubmission) -> bool {
        if shared.pending_error.lock().is_some() {
            log::trace!("dropping submission after earlier failure: {:?}", submission);
            return false;
        }
        let result = match codec.upgrade() {
            Some(codec) => submission.issue(codec.as_ref()),
            None => Err(CodecError::invalid_state("codec already released")),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                log::error!("queueing input buffer failed: {}", e);
                shared.pending_error.lock().get_or_insert(e);
                false
            }
        }
    }

    /// Appends a submission without blocking. Fails with the captured error
    /// if an earlier submission failed.
    pub fn enqueue(&self, submission: QueuedSubmission) -> AdapterResult<()> {
        self.maybe_raise_pending_exception()?;
        let mut queue = self.shared.queue.lock();
        if !queue.worker_alive {
            return Err(AdapterError::usage(format!(
                "buffer enqueuer {} is not running",
                self.label
            )));
        }
        queue.submissions.push_back(submission);
        queue.enqueued += 1;
        drop(queue);
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// Blocks until every submission queued before this call was handed to the codec.
    pub fn wait_until_drained(&self) -> AdapterResult<()> {
        let mut queue = self.shared.queue.lock();
        let target = queue.enqueued;
        self.wait_for_retired(&mut queue, target, "waiting for queued input buffers")
    }

    fn wait_for_retired(
        &self,
        queue: &mut parking_lot::MutexGuard<'_, QueueState>,
        target: u64,
        what: &str,
    ) -> AdapterResult<()> {
        while queue.retired < target {
            if !queue.worker_alive {
                return Err(AdapterError::Interrupted(format!(
                    "{} on {}",
                    what, self.label
                )));
            }
            self.shared.progress.wait(queue);
        }
        Ok(())
    }

    /// Discards submissions not yet handed to the codec and waits for the one
    /// in flight, if any.
    pub fn flush(&self) -> AdapterResult<()> {
        let mut queue = self.shared.queue.lock();
        let discarded = queue.submissions.len() as u64;
        queue.submissions.clear();
        queue.retired += discarded;
        if discarded > 0 {
            log::debug!("buffer enqueuer {} discarded {} submissions", self.label, discarded);
            self.shared.progress.notify_all();
        }
        let target = queue.enqueued;
        if !queue.worker_alive {
            return Ok(());
        }
        self.wait_for_retired(&mut queue, target, "flushing queued input buffers")
    }

    /// Flushes, stops the worker and joins it. Idempotent.
    pub fn shutdown(&self) -> AdapterResult<()> {
        let flushed = self.flush();
        {
            // the worker checks cancellation under this lock before it waits
            let _queue = self.shared.queue.lock();
            self.shared.cancel.cancel();
        }
        self.shared.work_ready.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                log::warn!("buffer enqueuer {} worker panicked", self.label);
            }
            log::debug!("buffer enqueuer {} shut down", self.label);
        }
        flushed
    }

    pub fn maybe_raise_pending_exception(&self) -> AdapterResult<()> {
        match self.shared.pending_error.lock().as_ref() {
            Some(error) => Err(AdapterError::CodecRuntime(error.clone())),
            None => Ok(()),
        }
    }

    /// Submissions waiting to be issued.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().submissions.len()
    }

    /// `(enqueued, issued)` since creation.
    pub fn counters(&self) -> (u64, u64) {
        let queue = self.shared.queue.lock();
        (queue.enqueued, queue.issued)
    }
}

impl Drop for BufferEnqueuer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("buffer enqueuer {} shutdown: {}", self.label, e);
        }
    }
}

#[cfg(test)]
#[path = "enqueuer_test.rs"]
mod enqueuer_test;
