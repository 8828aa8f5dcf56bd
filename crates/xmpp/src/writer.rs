//! Outbound write serializer.
//!
//! A single task owns the write half of the transport; at most one write is
//! in flight at any time. Submissions made while a write is in flight queue
//! in FIFO order, each with an optional completion callback. A failed write
//! drains the queue, failing every queued completion, and reports the error
//! upstream.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::XmppError;
use crate::sniffer::Sniffer;
use crate::transport::BoxStream;

/// Invoked once with `true` when the payload reached the transport, `false`
/// when the write failed or was drained.
pub type WriteCompletion = Box<dyn FnOnce(bool) + Send>;

struct Packet {
    bytes: Vec<u8>,
    completion: Option<WriteCompletion>,
}

/// Handle for submitting outbound payloads.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Packet>,
    sniffer: Option<Arc<dyn Sniffer>>,
}

impl WriteQueue {
    /// Enqueue a payload. The sniffer observes it before it is queued.
    pub fn submit(
        &self,
        payload: String,
        completion: Option<WriteCompletion>,
    ) -> Result<(), XmppError> {
        if let Some(sniffer) = &self.sniffer {
            sniffer.outbound(&payload);
        }
        self.tx
            .send(Packet {
                bytes: payload.into_bytes(),
                completion,
            })
            .map_err(|mut e| {
                if let Some(completion) = e.0.completion.take() {
                    completion(false);
                }
                XmppError::NotConnected
            })
    }
}

/// Spawn the writer task over the transport's write half.
///
/// `on_failure` fires once, on the first write error, after the queue has
/// been drained.
pub(crate) fn spawn_writer(
    mut write_half: WriteHalf<BoxStream>,
    sniffer: Option<Arc<dyn Sniffer>>,
    on_failure: Box<dyn FnOnce(XmppError) + Send>,
) -> WriteQueue {
    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            let result = async {
                write_half.write_all(&packet.bytes).await?;
                write_half.flush().await?;
                Ok::<(), std::io::Error>(())
            }
            .await;

            match result {
                Ok(()) => {
                    if let Some(completion) = packet.completion {
                        completion(true);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "write failed, draining outbound queue");
                    if let Some(completion) = packet.completion {
                        completion(false);
                    }
                    rx.close();
                    while let Ok(mut stale) = rx.try_recv() {
                        if let Some(completion) = stale.completion.take() {
                            completion(false);
                        }
                    }
                    on_failure(XmppError::Io(e));
                    return;
                }
            }
        }

        debug!("outbound queue closed, shutting down write half");
        let _ = write_half.shutdown().await;
    });

    WriteQueue { tx, sniffer }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::transport::BoxStream;

    #[tokio::test]
    async fn packets_reach_the_wire_in_submission_order() {
        let (near, far) = tokio::io::duplex(4096);
        let near: BoxStream = Box::new(near);
        let (_read, write_half) = tokio::io::split(near);

        let queue = spawn_writer(write_half, None, Box::new(|_| {}));
        queue.submit("first ".to_string(), None).unwrap();
        queue.submit("second ".to_string(), None).unwrap();
        queue.submit("third".to_string(), None).unwrap();

        let mut far = far;
        let mut buf = vec![0u8; 64];
        let mut collected = String::new();
        while collected.len() < "first second third".len() {
            let n = far.read(&mut buf).await.unwrap();
            collected.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        assert_eq!(collected, "first second third");
    }

    #[tokio::test]
    async fn completion_fires_after_write() {
        let (near, _far) = tokio::io::duplex(4096);
        let near: BoxStream = Box::new(near);
        let (_read, write_half) = tokio::io::split(near);

        static COMPLETIONS: AtomicU32 = AtomicU32::new(0);
        COMPLETIONS.store(0, Ordering::SeqCst);

        let queue = spawn_writer(write_half, None, Box::new(|_| {}));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        queue
            .submit(
                "<presence/>".to_string(),
                Some(Box::new(move |ok| {
                    COMPLETIONS.fetch_add(1, Ordering::SeqCst);
                    let _ = done_tx.send(ok);
                })),
            )
            .unwrap();

        assert!(done_rx.await.unwrap());
        assert_eq!(COMPLETIONS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_failure_drains_queue_and_reports() {
        let (near, far) = tokio::io::duplex(16);
        let near: BoxStream = Box::new(near);
        let (_read, write_half) = tokio::io::split(near);
        drop(far); // every write now fails

        let failures: &'static Mutex<Vec<String>> = Box::leak(Box::new(Mutex::new(Vec::new())));
        let queue = spawn_writer(
            write_half,
            None,
            Box::new(move |e| failures.lock().unwrap().push(e.to_string())),
        );

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        queue
            .submit(
                "<presence/>".to_string(),
                Some(Box::new(move |ok| {
                    let _ = done_tx.send(ok);
                })),
            )
            .unwrap();

        assert!(!done_rx.await.unwrap());
        assert_eq!(failures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sniffer_observes_payload_before_enqueue() {
        struct Recorder(Mutex<Vec<String>>);
        impl Sniffer for Recorder {
            fn outbound(&self, payload: &str) {
                self.0.lock().unwrap().push(payload.to_string());
            }
            fn inbound(&self, _payload: &str) {}
        }

        let (near, _far) = tokio::io::duplex(4096);
        let near: BoxStream = Box::new(near);
        let (_read, write_half) = tokio::io::split(near);

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let queue = spawn_writer(write_half, Some(recorder.clone()), Box::new(|_| {}));
        queue.submit("<iq id='1'/>".to_string(), None).unwrap();

        assert_eq!(recorder.0.lock().unwrap().as_slice(), ["<iq id='1'/>"]);
    }
}
