use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Fan-out point for one process's merged stdout/stderr.
///
/// Every subscriber owns its own queue, so a slow consumer never stalls the
/// pumps or other consumers and still receives every chunk published after it
/// subscribed. Once the hub is closed every open subscription drains what it
/// already has and ends.
#[derive(Clone, Debug)]
pub struct OutputHub {
    sinks: Arc<Mutex<Option<Vec<mpsc::UnboundedSender<Bytes>>>>>,
}

impl OutputHub {
    pub(crate) fn new() -> Self {
        Self {
            sinks: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    pub fn subscribe(&self) -> OutputStream {
        let mut guard = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let inner = guard.as_mut().map(|sinks| {
            let (tx, rx) = mpsc::unbounded_channel();
            sinks.push(tx);
            UnboundedReceiverStream::new(rx)
        });
        OutputStream {
            inner,
            deadline: None,
        }
    }

    pub(crate) fn publish(&self, chunk: Bytes) {
        let mut guard = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sinks) = guard.as_mut() {
            // Dropped consumers fall out here; output nobody watches is dropped.
            sinks.retain(|tx| tx.send(chunk.clone()).is_ok());
        }
    }

    /// Publish a panel-authored line, e.g. a SIGKILL notice.
    pub(crate) fn notice(&self, message: &str) {
        self.publish(Bytes::from(format!("[factorio-panel] {message}\n")));
    }

    pub(crate) fn close(&self) {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.sinks.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// One attached consumer of a process's output.
///
/// Dropping it detaches only this consumer. The process and other streams
/// keep going.
pub struct OutputStream {
    inner: Option<UnboundedReceiverStream<Bytes>>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("attached", &self.inner.is_some())
            .field("deadline", &self.deadline.is_some())
            .finish_non_exhaustive()
    }
}

impl OutputStream {
    /// Ends the stream after `after`, even if the process is still talking.
    pub fn with_deadline(mut self, after: Duration) -> Self {
        self.deadline = Some(Box::pin(tokio::time::sleep(after)));
        self
    }

    fn finish(&mut self) {
        self.inner = None;
        self.deadline = None;
    }
}

impl Stream for OutputStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(deadline) = this.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            tracing::debug!("output forwarding deadline reached");
            this.finish();
            return Poll::Ready(None);
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
pub(crate) async fn collect_string(stream: OutputStream) -> String {
    let chunks: Vec<Bytes> = stream.collect().await;
    let mut out = Vec::new();
    for c in chunks {
        out.extend_from_slice(&c);
    }
    String::from_utf8_lossy(&out).into_owned()
}
