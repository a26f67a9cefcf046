//! The fan-out event stream primitive shared by every adapter.
//!
//! The producer side lives on an adapter task; the consumer holds a
//! [`ChatStream`]. Structural events (text/tool-call brackets, finish) are
//! sent blocking so they are never lost; raw provider passthroughs are
//! best-effort and may be dropped when the consumer lags.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chat::StreamEvent;
use crate::error::LLMError;

/// Minimum channel capacity between producer and consumer.
pub const STREAM_BUFFER: usize = 64;

/// Receive side of a streaming chat call.
pub struct ChatStream {
    rx: mpsc::Receiver<Result<StreamEvent, LLMError>>,
    cancel: CancellationToken,
}

impl ChatStream {
    /// Create a linked sender/stream pair. The token cancels the
    /// producer's underlying request when the stream is closed.
    pub fn channel(cancel: CancellationToken) -> (StreamSender, ChatStream) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        (
            StreamSender { tx, cancel: cancel.clone() },
            ChatStream { rx, cancel },
        )
    }

    /// Await the next event. `None` once the producer is done and the
    /// buffer is drained.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, LLMError>> {
        self.rx.recv().await
    }

    /// Cancel the underlying request and drain whatever the producer
    /// already buffered.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for ChatStream {
    type Item = Result<StreamEvent, LLMError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Producer handle owned by an adapter task.
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<Result<StreamEvent, LLMError>>,
    cancel: CancellationToken,
}

impl StreamSender {
    /// Send a structural event, waiting for buffer space. Returns false
    /// once the consumer is gone; producers should stop then.
    pub async fn send(&self, event: StreamEvent) -> bool {
        self.tx.send(Ok(event)).await.is_ok()
    }

    /// Send the terminal error. Same blocking semantics as [`send`].
    ///
    /// [`send`]: StreamSender::send
    pub async fn send_err(&self, err: LLMError) -> bool {
        self.tx.send(Err(err)).await.is_ok()
    }

    /// Best-effort raw provider frame: dropped when the buffer is full or
    /// the consumer is gone.
    pub fn send_passthrough(&self, raw: Value) -> bool {
        self.tx.try_send(Ok(StreamEvent::ProviderEvent { raw })).is_ok()
    }

    /// True once the consumer closed the stream or the caller cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// The cancellation token tied to this stream's request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn events_flow_in_order() {
        let (tx, mut stream) = ChatStream::channel(CancellationToken::new());
        tokio::spawn(async move {
            tx.send(StreamEvent::StreamStart).await;
            tx.send(StreamEvent::TextStart { id: "t0".into() }).await;
            tx.send(StreamEvent::TextDelta { id: "t0".into(), delta: "hi".into() }).await;
            tx.send(StreamEvent::TextEnd { id: "t0".into() }).await;
        });

        let mut kinds = Vec::new();
        while let Some(item) = stream.next().await {
            kinds.push(item.unwrap());
        }
        assert_eq!(kinds.len(), 4);
        assert_eq!(kinds[0], StreamEvent::StreamStart);
        assert_eq!(kinds[3], StreamEvent::TextEnd { id: "t0".into() });
    }

    #[tokio::test]
    async fn close_cancels_producer() {
        let cancel = CancellationToken::new();
        let (tx, mut stream) = ChatStream::channel(cancel.clone());
        let producer = tokio::spawn(async move {
            loop {
                if tx.is_cancelled() {
                    return "stopped";
                }
                if !tx.send(StreamEvent::TextDelta { id: "t0".into(), delta: "x".into() }).await {
                    return "receiver gone";
                }
            }
        });

        let _ = stream.next_event().await;
        stream.close();
        let outcome = producer.await.unwrap();
        assert!(outcome == "stopped" || outcome == "receiver gone");
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn passthrough_drops_when_full() {
        let (tx, mut stream) = ChatStream::channel(CancellationToken::new());
        let mut accepted = 0usize;
        for i in 0..(STREAM_BUFFER * 2) {
            if tx.send_passthrough(serde_json::json!({ "i": i })) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, STREAM_BUFFER);

        // Structural sends still succeed once the consumer drains.
        let consumer = tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(item) = stream.next().await {
                item.unwrap();
                count += 1;
            }
            count
        });
        assert!(tx.send(StreamEvent::StreamStart).await);
        drop(tx);
        assert_eq!(consumer.await.unwrap(), STREAM_BUFFER + 1);
    }

    #[tokio::test]
    async fn sends_after_close_do_not_panic() {
        let (tx, mut stream) = ChatStream::channel(CancellationToken::new());
        stream.close();
        drop(stream);
        assert!(!tx.send(StreamEvent::StreamStart).await);
        assert!(!tx.send_passthrough(serde_json::json!({})));
    }
}
