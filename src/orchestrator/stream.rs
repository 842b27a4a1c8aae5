use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::protocol::{ErrorReport, GenerationResult};
use crate::{Result, SandboxLlmError};

/// Incremental text of one stream request.
///
/// Yields text deltas in order. Dropping it before the end interrupts the
/// generation; the slot is released once the sandbox acknowledges the end.
pub struct TextStream {
    request_id: Uuid,
    chunks: mpsc::UnboundedReceiver<Result<String>>,
    result: oneshot::Receiver<std::result::Result<GenerationResult, ErrorReport>>,
}

impl TextStream {
    pub(crate) fn new(
        request_id: Uuid,
        chunks: mpsc::UnboundedReceiver<Result<String>>,
        result: oneshot::Receiver<std::result::Result<GenerationResult, ErrorReport>>,
    ) -> Self {
        Self {
            request_id,
            chunks,
            result,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Drain the remaining deltas and return the final result
    pub async fn into_result(mut self) -> Result<GenerationResult> {
        while self.chunks.recv().await.is_some() {}
        match self.result.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(report)) => Err(SandboxLlmError::Sandbox(report)),
            Err(_) => Err(SandboxLlmError::SandboxGone),
        }
    }
}

impl Stream for TextStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().chunks.poll_recv(cx)
    }
}
