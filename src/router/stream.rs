//! One streaming type for both execution modes.

use super::status::Ticket;
use crate::bridge::ResponseStream;
use crate::error::AssistantError;
use crate::session::TextDeltaStream;
use futures_util::StreamExt;
use serde_json::Value;

pub(crate) enum Source {
    Local(TextDeltaStream),
    Remote(ResponseStream),
    Closed,
}

impl Source {
    async fn next(&mut self) -> Option<Result<String, AssistantError>> {
        match self {
            Source::Local(deltas) => deltas.next().await,
            Source::Remote(chunks) => match chunks.next().await? {
                Ok(Value::String(delta)) => Some(Ok(delta)),
                Ok(other) => Some(Err(AssistantError::protocol(format!(
                    "expected a text chunk, got {}",
                    other
                )))),
                Err(e) => Some(Err(e)),
            },
            Source::Closed => None,
        }
    }

    async fn abort(&mut self) {
        if let Source::Remote(chunks) = self {
            chunks.abort().await;
        }
    }
}

enum Step {
    Delta(String),
    Done,
    Failed(AssistantError),
    Aborted,
}

/// Text deltas of a streaming feature call, pulled in emission order.
///
/// Ends with `None` after the last delta. A failure is yielded once, after
/// every delta produced before it, and the stream then ends. Aborting (via
/// [`TextStream::abort`] or `Router::abort`) ends it immediately without
/// yielding anything further; [`TextStream::collect_text`] then reports
/// [`AssistantError::Cancelled`] instead of the partial text.
pub struct TextStream {
    source: Source,
    ticket: Option<Ticket>,
    aborted: bool,
}

impl TextStream {
    pub(crate) fn new(source: Source, ticket: Ticket) -> Self {
        Self {
            source,
            ticket: Some(ticket),
            aborted: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.ticket.is_none()
    }

    pub async fn next(&mut self) -> Option<Result<String, AssistantError>> {
        let token = self.ticket.as_ref()?.token().clone();

        let step = tokio::select! {
            biased;
            _ = token.cancelled() => Step::Aborted,
            item = self.source.next() => match item {
                Some(Ok(delta)) => Step::Delta(delta),
                Some(Err(e)) => Step::Failed(e),
                None => Step::Done,
            },
        };

        match step {
            Step::Delta(delta) => Some(Ok(delta)),
            Step::Done => {
                self.settle(Ok(()));
                None
            }
            Step::Failed(e) => {
                self.settle(Err(e.clone()));
                Some(Err(e))
            }
            Step::Aborted => {
                self.aborted = true;
                self.source.abort().await;
                self.settle(Err(AssistantError::Cancelled));
                None
            }
        }
    }

    /// Stop now; in bridged mode the far side is told to stop producing.
    pub async fn abort(&mut self) {
        if self.ticket.is_none() {
            return;
        }
        self.aborted = true;
        self.source.abort().await;
        self.settle(Err(AssistantError::Cancelled));
    }

    /// Drain the stream into the full response.
    pub async fn collect_text(mut self) -> Result<String, AssistantError> {
        let mut full = String::new();
        while let Some(delta) = self.next().await {
            full.push_str(&delta?);
        }
        if self.aborted {
            return Err(AssistantError::Cancelled);
        }
        Ok(full)
    }

    fn settle(&mut self, result: Result<(), AssistantError>) {
        // Dropping the local provider stream releases its HTTP response.
        self.source = Source::Closed;
        if let Some(ticket) = self.ticket.take() {
            ticket.finish(&result);
        }
    }
}
