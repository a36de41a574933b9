//! The external task-execution seam.
//!
//! The pool never interprets a payload; it hands payload and execution
//! context to an implementation of this trait and classifies the
//! outcome. In production this drives a browser against a document
//! page; in tests it is a stub.

use async_trait::async_trait;
use serde_json::Value;

use crate::profile::ExecutionContext;
use crate::queue::TaskPayload;

/// Error type surfaced by executors. Anything `Display`-able will do;
/// the queue records it as the attempt's failure message.
pub type ExecError = Box<dyn std::error::Error + Send + Sync>;

/// One unit of work.
///
/// A returned value is stored verbatim on the task for the submitter to
/// collect; a returned error is a task failure subject to the retry
/// policy. A panic is treated as a worker crash, not a task failure.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        payload: TaskPayload,
        context: ExecutionContext,
    ) -> Result<Value, ExecError>;
}
