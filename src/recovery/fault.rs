//! Panic payload normalization and fault classification.

use std::any::Any;

use thiserror::Error;

use super::stack::StackFrame;

/// Marker error raised when the remote peer disconnects mid-request.
///
/// Raised via [`abort_request`](crate::context::abort_request), or directly
/// by response-writing code that notices the connection is gone. Not a
/// software fault: the recovery boundary logs it at warning level and never
/// reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("client aborted request")]
pub struct ClientAbort;

/// How a recovered panic is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The peer went away mid-request; logged, never reported, no response.
    ClientAbort,
    /// A genuine defect; logged, reported, answered with a 500.
    InternalFault,
}

/// Error normalized from an arbitrary panic payload.
///
/// When the payload was itself an error it is preserved as the `source`,
/// so the original cause chain stays inspectable.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PanicError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PanicError {
    fn from_message(message: String) -> Self {
        Self { message, source: None }
    }

    fn from_cause(cause: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            message: cause.to_string(),
            source: Some(cause),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Ephemeral record of one recovered panic: normalized error, captured
/// stack, and classification. Lives only for the interception.
pub struct RecoveredFault {
    error: PanicError,
    stack: Vec<StackFrame>,
    kind: FaultKind,
}

impl RecoveredFault {
    pub(crate) fn new(payload: Box<dyn Any + Send>, stack: Vec<StackFrame>) -> Self {
        let error = normalize(payload);
        let kind = classify(&error);
        Self { error, stack, kind }
    }

    pub fn error(&self) -> &PanicError {
        &self.error
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// Captured frames, innermost first.
    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }

    /// Stack rendered as one block, one frame per line pair.
    pub fn stack_trace(&self) -> String {
        self.stack
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Stack rendered one string per frame, for structured log fields.
    pub fn stack_lines(&self) -> Vec<String> {
        self.stack.iter().map(ToString::to_string).collect()
    }
}

const OPAQUE_PAYLOAD: &str = "opaque panic payload";

/// Coerce a panic payload into error form. Error payloads keep their cause
/// chain; everything else is reduced to its textual representation.
fn normalize(payload: Box<dyn Any + Send>) -> PanicError {
    let payload = match payload.downcast::<ClientAbort>() {
        Ok(abort) => return PanicError::from_cause(Box::new(*abort)),
        Err(other) => other,
    };
    let payload = match payload.downcast::<Box<dyn std::error::Error + Send + Sync>>() {
        Ok(cause) => return PanicError::from_cause(*cause),
        Err(other) => other,
    };
    PanicError::from_message(payload_message(payload.as_ref()))
}

/// Textual form of a non-error payload. `&str` and `String` cover `panic!`;
/// the primitives cover `panic_any` with displayable values.
fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    macro_rules! display_of {
        ($($ty:ty),* $(,)?) => {
            $(
                if let Some(value) = payload.downcast_ref::<$ty>() {
                    return value.to_string();
                }
            )*
        };
    }
    display_of!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char);
    OPAQUE_PAYLOAD.to_string()
}

/// Walk the cause chain looking for the client-abort marker. Direct
/// comparison is useless here: normalization always wraps the raw payload.
fn classify(error: &PanicError) -> FaultKind {
    let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(current) = cause {
        if current.downcast_ref::<ClientAbort>().is_some() {
            return FaultKind::ClientAbort;
        }
        cause = current.source();
    }
    FaultKind::InternalFault
}
