//! Error types for the tessera engine
//!
//! Compile-time failures ([`TypeError`], [`LoweringError`]) abort the affected
//! compilation unit with a source location. Run-time failures
//! ([`RuntimeError`]) unwind to the dispatcher's caller unchanged. All of them
//! funnel into the crate-level [`Error`].

use crate::ast::Span;
use crate::numeric::ArithError;
use crate::tensor::TensorError;
pub use crate::types::{TypeError, TypeErrorKind};
use std::fmt;
use thiserror::Error;

/// Top-level engine error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Type checking rejected the unit
    #[error("Type error: {0}")]
    Type(#[from] TypeError),

    /// Lowering (AST to IR, IR verification or native lowering) failed
    #[error("Lowering error: {0}")]
    Lowering(#[from] LoweringError),

    /// Execution failed
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// A serialized IR module could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A host-supplied value violates its own invariants
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Pipeline stage that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStage {
    /// Checking or lowering; the unit never ran
    CompileTime,
    /// Raised while executing a function
    Runtime,
    /// Raised while reading serialized IR
    Decode,
}

impl Error {
    /// Classify the stage this error belongs to
    pub fn classify(&self) -> ErrorStage {
        match self {
            Error::Type(_) | Error::Lowering(_) => ErrorStage::CompileTime,
            Error::Runtime(_) | Error::InvalidValue(_) => ErrorStage::Runtime,
            Error::Decode(_) => ErrorStage::Decode,
        }
    }

    /// Runtime error kind, if this is a runtime error
    pub fn runtime_kind(&self) -> Option<RuntimeErrorKind> {
        match self {
            Error::Runtime(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// Result type for tessera operations
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Lowering errors
// ============================================================================

/// Category of a lowering failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoweringErrorKind {
    /// A non-unit function can reach its end without returning
    MissingReturn,
    /// The typed tree contains a construct the IR cannot express
    Unsupported,
    /// The IR verifier rejected a function
    Verification,
    /// The native target lacks a capability the function needs
    UnresolvedNativeFeature,
    /// Native code exceeds an encoding limit (jump distance, frame size)
    EncodingLimit,
}

impl fmt::Display for LoweringErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoweringErrorKind::MissingReturn => "missing return",
            LoweringErrorKind::Unsupported => "unsupported construct",
            LoweringErrorKind::Verification => "verification failed",
            LoweringErrorKind::UnresolvedNativeFeature => "unresolved native feature",
            LoweringErrorKind::EncodingLimit => "encoding limit",
        };
        write!(f, "{}", name)
    }
}

/// Compile-time failure after type checking
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} in `{function}`{}: {message}", display_location(.location))]
pub struct LoweringError {
    /// Failure category
    pub kind: LoweringErrorKind,
    /// Function being lowered
    pub function: String,
    /// Details
    pub message: String,
    /// Source location when known
    pub location: Option<Span>,
}

impl LoweringError {
    /// Create a lowering error without a location
    pub fn new(kind: LoweringErrorKind, function: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            function: function.into(),
            message: message.into(),
            location: None,
        }
    }

    /// Attach a source location
    pub fn at(mut self, span: Span) -> Self {
        self.location = Some(span);
        self
    }
}

fn display_location(location: &Option<Span>) -> String {
    match location {
        Some(span) => format!(" at {}", span),
        None => String::new(),
    }
}

// ============================================================================
// Runtime errors
// ============================================================================

/// Category of a runtime failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeErrorKind {
    /// Checked arithmetic left the representable range
    Overflow,
    /// Integer division or remainder by zero
    DivisionByZero,
    /// Dynamic tensor shapes disagree
    ShapeMismatch,
    /// Tensor element index outside its axis
    IndexOutOfBounds,
    /// Native lowering needs a capability the target lacks
    UnresolvedNativeFeature,
    /// Call depth limit reached
    StackOverflow,
    /// Live native heap data exceeds the heap region
    OutOfMemory,
    /// The host aborted the frame chain
    Aborted,
    /// Arguments do not match the function signature
    ArgumentMismatch,
    /// No function with the requested id or name
    UnknownFunction,
    /// Engine invariant violated (verified IR should never hit this)
    Internal,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeErrorKind::Overflow => "Overflow",
            RuntimeErrorKind::DivisionByZero => "DivisionByZero",
            RuntimeErrorKind::ShapeMismatch => "ShapeMismatch",
            RuntimeErrorKind::IndexOutOfBounds => "IndexOutOfBounds",
            RuntimeErrorKind::UnresolvedNativeFeature => "UnresolvedNativeFeature",
            RuntimeErrorKind::StackOverflow => "StackOverflow",
            RuntimeErrorKind::OutOfMemory => "OutOfMemory",
            RuntimeErrorKind::Aborted => "Aborted",
            RuntimeErrorKind::ArgumentMismatch => "ArgumentMismatch",
            RuntimeErrorKind::UnknownFunction => "UnknownFunction",
            RuntimeErrorKind::Internal => "Internal",
        };
        write!(f, "{}", name)
    }
}

/// Execution failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    /// Failure category
    pub kind: RuntimeErrorKind,
    /// Details
    pub message: String,
}

impl RuntimeError {
    /// Create a runtime error
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Engine invariant violation
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Internal, message)
    }
}

impl From<ArithError> for RuntimeError {
    fn from(err: ArithError) -> Self {
        match err {
            ArithError::Overflow => RuntimeError::new(RuntimeErrorKind::Overflow, "arithmetic overflow"),
            ArithError::DivisionByZero => RuntimeError::new(RuntimeErrorKind::DivisionByZero, "division by zero"),
            ArithError::Unsupported => RuntimeError::internal("operator not defined for operand kind"),
        }
    }
}

impl From<TensorError> for RuntimeError {
    fn from(err: TensorError) -> Self {
        match err {
            TensorError::ShapeMismatch { expected, found } => RuntimeError::new(
                RuntimeErrorKind::ShapeMismatch,
                format!("expected shape {:?}, found {:?}", expected, found),
            ),
            TensorError::IndexOutOfBounds { index, extent } => RuntimeError::new(
                RuntimeErrorKind::IndexOutOfBounds,
                format!("index {} outside axis of extent {}", index, extent),
            ),
            TensorError::Arith(e) => e.into(),
        }
    }
}

// ============================================================================
// Decode errors
// ============================================================================

/// Failure reading a serialized IR module
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended in the middle of a record
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEof(usize),

    /// Input does not start with the module magic
    #[error("bad magic bytes")]
    BadMagic,

    /// Format version this build cannot read
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    /// Unknown tag byte for a record kind
    #[error("invalid {what} tag 0x{tag:02x}")]
    InvalidTag {
        /// Record kind being decoded
        what: &'static str,
        /// Offending tag
        tag: u8,
    },

    /// Name bytes are not UTF-8
    #[error("invalid UTF-8 in name")]
    InvalidUtf8,

    /// Decoded module violates a structural invariant
    #[error("malformed module: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stages() {
        let rt: Error = RuntimeError::new(RuntimeErrorKind::Overflow, "x").into();
        assert_eq!(rt.classify(), ErrorStage::Runtime);
        assert_eq!(rt.runtime_kind(), Some(RuntimeErrorKind::Overflow));

        let lw: Error = LoweringError::new(LoweringErrorKind::MissingReturn, "f", "no return").into();
        assert_eq!(lw.classify(), ErrorStage::CompileTime);
        assert_eq!(lw.runtime_kind(), None);

        let dc: Error = DecodeError::BadMagic.into();
        assert_eq!(dc.classify(), ErrorStage::Decode);
    }

    #[test]
    fn test_arith_error_mapping() {
        let e: RuntimeError = ArithError::DivisionByZero.into();
        assert_eq!(e.kind, RuntimeErrorKind::DivisionByZero);
        let e: RuntimeError = TensorError::ShapeMismatch {
            expected: vec![3],
            found: vec![4],
        }
        .into();
        assert_eq!(e.kind, RuntimeErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_lowering_error_display() {
        let e = LoweringError::new(LoweringErrorKind::MissingReturn, "f", "falls off the end")
            .at(Span::new(3, 5));
        assert_eq!(e.to_string(), "missing return in `f` at 3:5: falls off the end");
    }
}
