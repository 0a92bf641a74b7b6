//! Consumer-side execution with bounded retry.
//!
//! `run_with_retry` re-invokes a handler on failure until it succeeds, fails
//! with an ignored `FailureKind` or runs out of attempts. `RequestExecutor`
//! wraps a `RequestHandler` so that every inbound request gets exactly one
//! response frame; `ConsumerExecutor` wraps a `QueueConsumer` and answers the
//! delivery with an acknowledgment or a negative acknowledgment.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::broker::codec;
use crate::broker::message::{Message, ResultCode};
use crate::transport::Connection;
use crate::utils::error::{ErrorSink, TracingErrorSink, TransportError};

/// Attempts used when `RetryOptions::count` is zero.
pub const DEFAULT_RETRY_COUNT: u32 = 100;

/// Classification of handler failures, used by the retry ignore list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Worth retrying: timeouts, unavailable dependencies.
    Transient,
    /// The input is wrong; retrying cannot help.
    Validation,
    NotFound,
    Unauthorized,
    Internal,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} failure: {message}")]
pub struct HandlerError {
    pub kind: FailureKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("retry exhausted after {attempts} attempts, last error: {last}")]
    RetryExhausted { attempts: u32, last: HandlerError },
}

impl ExecutionError {
    /// The handler error that ended the execution.
    pub fn handler_error(&self) -> &HandlerError {
        match self {
            ExecutionError::Handler(e) => e,
            ExecutionError::RetryExhausted { last, .. } => last,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Maximum attempts, 0 means `DEFAULT_RETRY_COUNT`.
    pub count: u32,
    pub delay: Duration,
    /// Failures that are raised at once instead of retried.
    pub ignore: HashSet<FailureKind>,
}

impl RetryOptions {
    pub fn new(count: u32, delay: Duration) -> Self {
        Self {
            count,
            delay,
            ignore: HashSet::new(),
        }
    }

    pub fn ignoring(mut self, kind: FailureKind) -> Self {
        self.ignore.insert(kind);
        self
    }

    pub fn attempts(&self) -> u32 {
        if self.count == 0 {
            DEFAULT_RETRY_COUNT
        } else {
            self.count
        }
    }
}

/// Runs `attempt` once without `retry`, otherwise up to `retry.attempts()`
/// times with `retry.delay` between attempts.
pub async fn run_with_retry<T, F, Fut>(
    retry: Option<&RetryOptions>,
    mut attempt: F,
) -> Result<T, ExecutionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, HandlerError>>,
{
    let Some(retry) = retry else {
        return attempt().await.map_err(ExecutionError::Handler);
    };

    let attempts = retry.attempts();
    let mut last = None;
    for n in 1..=attempts {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if retry.ignore.contains(&e.kind) => {
                debug!(attempt = n, kind = ?e.kind, "failure kind is not retried");
                return Err(ExecutionError::Handler(e));
            }
            Err(e) => {
                debug!(attempt = n, attempts, error = %e, "attempt failed");
                last = Some(e);
                if n < attempts && !retry.delay.is_zero() {
                    tokio::time::sleep(retry.delay).await;
                }
            }
        }
    }

    let last = last.unwrap_or_else(|| HandlerError::new(FailureKind::Internal, "no attempt was made"));
    Err(ExecutionError::RetryExhausted { attempts, last })
}

/// What a failed request is answered with.
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub code: ResultCode,
    pub reason: Option<String>,
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produces the response body. `None` answers with `NoContent`.
    async fn handle(&self, request: &Message) -> Result<Option<Bytes>, HandlerError>;

    /// Builds the error response once retries are over.
    async fn on_error(&self, error: &ExecutionError, _request: &Message) -> ErrorResponse {
        ErrorResponse {
            code: ResultCode::InternalServerError,
            reason: Some(error.handler_error().message.clone()),
        }
    }

    /// Runs after the response was sent. Failures here cannot change the
    /// response and are reported to the error sink.
    async fn after_reply(&self, _request: &Message) -> Result<(), HandlerError> {
        Ok(())
    }
}

pub struct RequestExecutor<H> {
    handler: H,
    retry: Option<RetryOptions>,
    errors: Arc<dyn ErrorSink>,
}

impl<H: RequestHandler> RequestExecutor<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            retry: None,
            errors: Arc::new(TracingErrorSink),
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Handles one request and sends exactly one response on `connection`.
    pub async fn execute(
        &self,
        connection: &dyn Connection,
        request: &Message,
    ) -> Result<(), ExecutionError> {
        let outcome = run_with_retry(self.retry.as_ref(), || self.handler.handle(request)).await;

        let (response, failure) = match outcome {
            Ok(body) => {
                let code = if body.is_some() {
                    ResultCode::Ok
                } else {
                    ResultCode::NoContent
                };
                let mut response = request.create_response(code);
                if let Some(body) = body {
                    response.payload = body;
                }
                (response, None)
            }
            Err(e) => {
                let error = self.handler.on_error(&e, request).await;
                let code = if error.code.is_success() {
                    ResultCode::Failed
                } else {
                    error.code
                };
                let mut response = request.create_response(code);
                if let Some(reason) = error.reason {
                    response.set_string_content(reason);
                }
                (response, Some(e))
            }
        };

        if let Err(e) = send_frame(connection, &response) {
            self.errors
                .report("REPLY", &format!("request={}", request.id), &e);
        }
        if let Err(e) = self.handler.after_reply(request).await {
            self.errors
                .report("AFTER_REPLY", &format!("request={}", request.id), &e);
        }

        match failure {
            Some(e) => {
                warn!(request = %request.id, error = %e, "request failed");
                self.errors
                    .report("REQUEST", &format!("request={}", request.id), &e);
                Err(e)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait QueueConsumer: Send + Sync {
    async fn consume(&self, message: &Message) -> Result<(), HandlerError>;
}

pub struct ConsumerExecutor<C> {
    consumer: C,
    retry: Option<RetryOptions>,
    errors: Arc<dyn ErrorSink>,
}

impl<C: QueueConsumer> ConsumerExecutor<C> {
    pub fn new(consumer: C) -> Self {
        Self {
            consumer,
            retry: None,
            errors: Arc::new(TracingErrorSink),
        }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    /// Consumes one delivery. When the delivery asks for it, success is
    /// acknowledged and failure negatively acknowledged with the reason.
    pub async fn execute(
        &self,
        connection: &dyn Connection,
        message: &Message,
    ) -> Result<(), ExecutionError> {
        let outcome = run_with_retry(self.retry.as_ref(), || self.consumer.consume(message)).await;

        if message.flags.acknowledge_required {
            let ack = match &outcome {
                Ok(()) => message.create_acknowledge(),
                Err(e) => message.create_negative_acknowledge(&e.handler_error().message),
            };
            if let Err(e) = send_frame(connection, &ack) {
                self.errors
                    .report("ACKNOWLEDGE", &format!("message={}", message.id), &e);
            }
        }

        if let Err(e) = &outcome {
            warn!(message_id = %message.id, queue = %message.target, error = %e, "consumer failed");
            self.errors
                .report("CONSUME", &format!("message={}", message.id), e);
        }
        outcome
    }
}

fn send_frame(connection: &dyn Connection, message: &Message) -> Result<(), TransportError> {
    connection.send(codec::encode(message)?)
}
