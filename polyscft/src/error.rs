use core::fmt;

/// The abstract failure classes a run can end with.
///
/// These classify errors for the user-visible one-line report and the
/// process exit code; the full context travels in the `anyhow` chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or mistyped attribute in the input tree.
    InvalidAttribute,
    /// Name resolution failure while wiring the object graph.
    UnknownObject,
    /// Chain topology inconsistent: a scan made no progress.
    UnreachableBlock,
    /// A rank's assigned local extent is zero for the slab axis.
    InvalidDecomposition,
    /// Field algebra across differing grids.
    ShapeMismatch,
    /// Interaction arity violated.
    TooManyFields,
    /// A collective reduction failed.
    CollectiveFailure,
    /// File IO failure.
    IoError,
}

impl ErrorClass {
    /// Process exit code for a run ending in this class.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::InvalidAttribute | ErrorClass::UnknownObject => 1,
            ErrorClass::IoError => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::InvalidAttribute => "InvalidAttribute",
            ErrorClass::UnknownObject => "UnknownObject",
            ErrorClass::UnreachableBlock => "UnreachableBlock",
            ErrorClass::InvalidDecomposition => "InvalidDecomposition",
            ErrorClass::ShapeMismatch => "ShapeMismatch",
            ErrorClass::TooManyFields => "TooManyFields",
            ErrorClass::CollectiveFailure => "CollectiveFailure",
            ErrorClass::IoError => "IOError",
        };
        write!(f, "{name}")
    }
}

/// An error carrying its class and the fully qualified name of the
/// object that raised it.
#[derive(Debug)]
pub struct ClassedError {
    pub class: ErrorClass,
    pub object: String,
    pub message: String,
}

impl fmt::Display for ClassedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: <{}>: {}", self.class, self.object, self.message)
    }
}

impl std::error::Error for ClassedError {}

/// Builds a classed `anyhow::Error` for the object at `object`.
pub fn class_error(
    class: ErrorClass,
    object: impl Into<String>,
    message: impl fmt::Display,
) -> anyhow::Error {
    anyhow::Error::new(ClassedError {
        class,
        object: object.into(),
        message: message.to_string(),
    })
}

/// Recovers the class of an error chain, if any link carries one.
pub fn classify(err: &anyhow::Error) -> Option<ErrorClass> {
    err.chain()
        .find_map(|e| e.downcast_ref::<ClassedError>())
        .map(|c| c.class)
}
