//! Streaming event bridge between the async graph and its consumer.
//!
//! The orchestrator runs on a spawned task and pushes [`AnswerPacket`]s
//! through a bounded channel. The consumer side, [`AnswerStream`], can be
//! drained either as a `futures` [`Stream`] or synchronously via
//! [`AnswerStream::blocking_next`]. Dropping the stream cancels the
//! producing task; a run whose consumer walked away does no further
//! provider calls.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

/// Channel depth between the graph task and the consumer.
///
/// Deep enough that token-piece bursts don't stall generation, small
/// enough that a slow consumer exerts backpressure instead of buffering
/// a whole answer.
const CHANNEL_CAPACITY: usize = 256;

/// One streamed event from a query run.
///
/// The wire shape is a tagged JSON object (`"type"` discriminator) so
/// downstream consumers in other languages can dispatch on it directly.
/// Unrecognized types deserialize as [`AnswerPacket::Unknown`] rather
/// than failing the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerPacket {
    /// A fragment of generated answer text.
    AnswerPiece {
        /// The text fragment.
        answer_piece: String,
        /// Decomposition level the fragment belongs to (0 initial,
        /// 1 refined).
        level: u32,
        /// Question index within the level; 0 for the main answer.
        level_question_num: u32,
    },
    /// A fragment of a search query issued for a sub-question.
    SubQueryPiece {
        /// The query text fragment.
        sub_query: String,
        /// Decomposition level of the owning sub-question.
        level: u32,
        /// Question index within the level.
        level_question_num: u32,
        /// Index of the query within the sub-question, for multi-query
        /// expansion.
        query_id: u32,
    },
    /// A fragment of a generated sub-question.
    SubQuestionPiece {
        /// The sub-question text fragment.
        sub_question: String,
        /// Decomposition level.
        level: u32,
        /// Question index within the level.
        level_question_num: u32,
    },
    /// A tool result, carrying retrieved documents or node artifacts.
    ToolResponse {
        /// Tool identifier (e.g. `"search_response_summary"`).
        id: String,
        /// Tool payload.
        response: serde_json::Value,
        /// Decomposition level the response belongs to.
        level: u32,
        /// Question index within the level.
        level_question_num: u32,
    },
    /// Marks the end of a level's streamed output.
    StreamStop {
        /// The level that finished streaming.
        level: u32,
    },
    /// A fatal run error; always the final packet when present.
    Error {
        /// Human-readable error description.
        message: String,
    },
    /// Forward-compatibility catch-all for unrecognized packet types.
    #[serde(other)]
    Unknown,
}

/// Producer handle the graph nodes emit through.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<AnswerPacket>,
    token: CancellationToken,
}

impl EventEmitter {
    /// Sends one packet to the consumer.
    ///
    /// # Errors
    ///
    /// [`AgentError::Cancelled`] when the consumer dropped the stream or
    /// the run was cancelled; callers unwind promptly instead of doing
    /// further work nobody will see.
    pub async fn emit(&self, packet: AnswerPacket) -> Result<(), AgentError> {
        tokio::select! {
            () = self.token.cancelled() => Err(AgentError::Cancelled),
            sent = self.tx.send(packet) => sent.map_err(|_| AgentError::Cancelled),
        }
    }

    /// Whether the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The run's cancellation token, for nodes that spawn their own work.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Consumer side of a query run.
///
/// Packets arrive in emission order. The stream ends when the graph task
/// finishes and its emitter is dropped; the final packet is always a
/// [`AnswerPacket::StreamStop`] or [`AnswerPacket::Error`].
pub struct AnswerStream {
    rx: mpsc::Receiver<AnswerPacket>,
    task: JoinHandle<()>,
    token: CancellationToken,
}

impl AnswerStream {
    /// Creates a connected emitter/stream pair and registers the graph
    /// task driving the emitter.
    pub(crate) fn channel<F>(spawn: F) -> Self
    where
        F: FnOnce(EventEmitter) -> JoinHandle<()>,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let token = CancellationToken::new();
        let emitter = EventEmitter {
            tx,
            token: token.clone(),
        };
        let task = spawn(emitter);
        Self { rx, task, token }
    }

    /// Receives the next packet, or `None` when the run has finished.
    pub async fn next_packet(&mut self) -> Option<AnswerPacket> {
        self.rx.recv().await
    }

    /// Blocking receive for synchronous consumers.
    ///
    /// Must not be called from within an async runtime; use
    /// [`AnswerStream::next_packet`] there instead.
    pub fn blocking_next(&mut self) -> Option<AnswerPacket> {
        self.rx.blocking_recv()
    }

    /// Requests cancellation without dropping the stream.
    ///
    /// Already-buffered packets remain receivable; the graph task stops
    /// emitting new ones.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Stream for AnswerStream {
    type Item = AnswerPacket;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}
