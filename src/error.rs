use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::tree::NodeType;

/// Result type alias using [`ConfError`].
pub type Result<T> = std::result::Result<T, ConfError>;

/// A position inside one input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// 1-based line number
    pub line: usize,
    /// Column of the last consumed byte (0 before the first byte of a line)
    pub column: usize,
}

impl Position {
    pub fn start() -> Self {
        Position { line: 1, column: 0 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// What the lexer or parser tripped over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxErrorKind {
    UnterminatedString,
    UnterminatedQuote,
    UnexpectedChar,
    UnexpectedEof,
}

impl fmt::Display for SyntaxErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SyntaxErrorKind::UnterminatedString => "Unterminated string",
            SyntaxErrorKind::UnterminatedQuote => "Unterminated quote",
            SyntaxErrorKind::UnexpectedChar => "Unexpected char",
            SyntaxErrorKind::UnexpectedEof => "Unexpected end of file",
        };
        f.write_str(text)
    }
}

/// Every failure the engine can report.
#[derive(Error, Debug)]
pub enum ConfError {
    // ============ Text ============
    /// Malformed input, tagged with the stream it came from.
    #[error("{file}:{position}: {kind}")]
    Syntax {
        file: String,
        position: Position,
        kind: SyntaxErrorKind,
    },

    // ============ Tree ============
    /// A node was re-assigned or read as the wrong type.
    #[error("{id} is not of type {expected} (found {found})")]
    TypeMismatch {
        id: String,
        expected: NodeType,
        found: NodeType,
    },

    /// A string payload was read as text but holds other bytes.
    #[error("{id} does not hold UTF-8 text")]
    NotUtf8 { id: String },

    /// A path segment does not exist.
    #[error("{key} not found")]
    NotFound { key: String },

    /// An identifier collides with a sibling.
    #[error("{id} already exists")]
    Duplicate { id: String },

    /// A string alias eventually points back at a key already visited.
    #[error("alias chain through {key} loops back on itself")]
    CyclicAlias { key: String },

    // ============ Definitions and arguments ============
    /// A definition (parameter block, func or type definition) is malformed.
    #[error("{message}")]
    InvalidDefinition { message: String },

    /// An argument names a parameter the definition does not declare.
    #[error("Unknown parameter {param}")]
    UnknownParameter { param: String },

    /// An argument value does not fit its parameter.
    #[error("Parameter {param} {message}")]
    InvalidArgument { param: String, message: String },

    // ============ Handlers ============
    /// No library of that name is known to the symbol table.
    #[error("Cannot open shared library {lib}")]
    LibraryNotFound { lib: String },

    /// The library is known but does not export the symbol.
    #[error("symbol {symbol} is not defined inside {lib}")]
    SymbolNotFound { symbol: String, lib: String },

    /// A handler function failed.
    #[error("function {func} returned error: {source}")]
    Function {
        func: String,
        #[source]
        source: Box<ConfError>,
    },

    /// Free-form failure raised by a handler function.
    #[error("{0}")]
    External(String),

    // ============ Files ============
    /// A configuration path entry did not expand to exactly one word.
    #[error("cannot expand {word}: {reason}")]
    PathExpansion { word: String, reason: String },

    /// Error reading a configuration file
    #[error("cannot access file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const EINVAL: i32 = 22;
const ENOENT: i32 = 2;
const ENXIO: i32 = 6;
const EEXIST: i32 = 17;
const ELOOP: i32 = 40;
const EIO: i32 = 5;

impl ConfError {
    /// Create a syntax error
    pub fn syntax(file: impl Into<String>, position: Position, kind: SyntaxErrorKind) -> Self {
        Self::Syntax {
            file: file.into(),
            position,
            kind,
        }
    }

    /// Create a not-found error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create an invalid definition error
    pub fn invalid_definition(message: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            param: param.into(),
            message: message.into(),
        }
    }

    /// Negative errno code for this error, for callers speaking errno.
    pub fn errno(&self) -> i32 {
        match self {
            ConfError::NotFound { .. }
            | ConfError::UnknownParameter { .. }
            | ConfError::LibraryNotFound { .. } => -ENOENT,
            ConfError::SymbolNotFound { .. } => -ENXIO,
            ConfError::Duplicate { .. } => -EEXIST,
            ConfError::CyclicAlias { .. } => -ELOOP,
            ConfError::Function { source, .. } => source.errno(),
            ConfError::Io { source, .. } => source.raw_os_error().map_or(-EIO, |code| -code),
            ConfError::Syntax { .. }
            | ConfError::TypeMismatch { .. }
            | ConfError::NotUtf8 { .. }
            | ConfError::InvalidDefinition { .. }
            | ConfError::InvalidArgument { .. }
            | ConfError::External(_)
            | ConfError::PathExpansion { .. } => -EINVAL,
        }
    }

    /// True for the lookup failures callers commonly fall back on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfError::NotFound { .. })
    }
}
