//! Streaming Iterator (C8): the event stream a caller drains as generation
//! progresses, instead of waiting for the whole response.
//!
//! Built on `tokio::sync::mpsc` + `tokio_stream::wrappers::UnboundedReceiverStream`,
//! the same shape as the teacher's `InferenceEngine::generate`, which spawns
//! a task and hands back a receiver side. Here the task drives one
//! speculative-decoding request instead of simulating token generation.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::CoreError;

/// One unit of progress a generation request reports.
#[derive(Debug, Clone)]
pub enum Event {
    /// A token was accepted (or resampled/bonus-sampled) into the output.
    Token {
        /// Decoded text for this token alone, via the external tokenizer
        /// (spec.md §4.8) — may be empty for sub-word continuations.
        text: String,
        token_id: u32,
        /// Strictly increasing across every `Token` event in a request,
        /// starting at 0, with no gaps or duplicates (spec.md §8
        /// "Ordering"). Distinct from `StepSummary::step_index`, which
        /// several tokens from one step all share.
        index: usize,
        /// The step's acceptance rate at the moment this token was emitted.
        acceptance_rate_at_emit: f64,
        /// Time from request start to this token's emission.
        elapsed_since_start: Duration,
    },
    /// End-of-step bookkeeping: how many of this step's draft tokens were
    /// accepted and what speculation depth produced them.
    StepSummary {
        step_index: usize,
        speculation_depth: usize,
        num_accepted: usize,
        acceptance_rate: f64,
    },
    /// Terminal event. Always the last item the stream yields.
    Final(FinalSummary),
}

/// Why generation stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalReason {
    /// A configured stop token was sampled from the target distribution
    /// (the stop token itself is not included in the output).
    StopToken,
    /// `max_new_tokens` was reached.
    LengthCap,
    /// Generation failed; cache lanes were released before this event.
    Failed(CoreError),
}

#[derive(Debug, Clone)]
pub struct FinalSummary {
    pub reason: FinalReason,
    /// Total tokens appended to the output (excludes a terminating stop
    /// token, which is never appended).
    pub num_generated: usize,
    /// Wall-clock duration of the whole request, from entry to this event.
    pub wall_time_seconds: f64,
    /// Time from request start to the moment the first output token was
    /// actually produced (arrival-time definition; see `DESIGN.md` for why
    /// this departs from the source prototype's step-start timestamp).
    /// `0.0` when no token was ever produced (e.g. an immediate stop token).
    pub time_to_first_token_seconds: f64,
    pub mean_acceptance_rate: f64,
    /// Speculation depth `K` used at each step, in order.
    pub depth_history: Vec<usize>,
}

/// Wraps the raw `mpsc` receiver as a `Stream<Item = Event>`.
pub struct GenerationStream {
    inner: UnboundedReceiverStream<Event>,
}

impl GenerationStream {
    pub(crate) fn new(rx: tokio::sync::mpsc::UnboundedReceiver<Event>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
        }
    }
}

impl Stream for GenerationStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
