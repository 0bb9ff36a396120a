//! Hand-off of finished sessions to the evaluation collaborator.
//!
//! `submit` and the end-session flow never wait on the evaluator: they put a
//! [`CompletionNotice`] on the [`CompletionQueue`] and return. A background
//! [`CompletionWorker`] delivers each notice with bounded retries.

pub mod completion_queue;
pub mod evaluation_sink;

pub use completion_queue::{CompletionQueue, CompletionWorker, RetryPolicy};
pub use evaluation_sink::{
    CompletionNotice, CompletionReason, EvaluationSink, HttpEvaluationSink, LogEvaluationSink,
};
