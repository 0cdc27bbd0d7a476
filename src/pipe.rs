//! Cross-thread sample pipe.
//!
//! Sensors produce samples on worker threads; the session sockets are
//! written from the single-threaded control context. The pipe decouples the
//! two: a producer copies the caller's bytes into an owned record and pushes
//! it through a bounded channel, the control loop dequeues exactly one
//! record per wake-up and hands it to the socket handler. Ownership of the
//! buffer rides the record; within one session, records arrive in the order
//! they were written.

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::session::SessionId;

/// One in-flight sample: the target session and an owned copy of the
/// producer's bytes.
#[derive(Debug)]
pub struct SampleRecord {
    pub session_id: SessionId,
    pub payload: Vec<u8>,
}

/// Producer handle. Cheap to clone; one clone per producer thread.
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: mpsc::Sender<SampleRecord>,
}

/// Consumer handle, held by the control loop.
#[derive(Debug)]
pub struct SampleReceiver {
    rx: mpsc::Receiver<SampleRecord>,
}

/// Creates a pipe holding at most `capacity` in-flight records.
pub fn channel(capacity: usize) -> (SampleSink, SampleReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (SampleSink { tx }, SampleReceiver { rx })
}

impl SampleSink {
    /// Copies `payload` and enqueues it for `session_id`.
    ///
    /// Blocks when the pipe is full (backpressure on the producer), so this
    /// must be called from a worker thread, never from the control context.
    /// Returns false when the copy cannot be allocated or the consumer is
    /// gone; nothing is enqueued in either case.
    pub fn write(&self, session_id: SessionId, payload: &[u8]) -> bool {
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(payload.len()).is_err() {
            error!(
                session = session_id,
                len = payload.len(),
                "sample buffer allocation failed"
            );
            return false;
        }
        buffer.extend_from_slice(payload);

        match self.tx.blocking_send(SampleRecord {
            session_id,
            payload: buffer,
        }) {
            Ok(()) => true,
            Err(_) => {
                warn!(session = session_id, "sample pipe closed, record dropped");
                false
            }
        }
    }
}

impl SampleReceiver {
    /// Dequeues one record; `None` once every sink is gone.
    pub async fn recv(&mut self) -> Option<SampleRecord> {
        self.rx.recv().await
    }

    /// Synchronous dequeue for producer-thread tests.
    pub fn blocking_recv(&mut self) -> Option<SampleRecord> {
        self.rx.blocking_recv()
    }

    /// Non-blocking dequeue; `None` when no record is currently queued.
    pub fn try_recv(&mut self) -> Option<SampleRecord> {
        self.rx.try_recv().ok()
    }
}
