//! Compile error taxonomy.
//!
//! Every failure mode of the pipeline maps to one variant here. All of them
//! abort the compile; the CLI prints a single diagnostic line on stderr and
//! exits non-zero. Line numbers are 1-indexed where available.

/// Error type shared by every stage of the compiler.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// Unrecognized character in the source text.
    Lexer {
        line: usize,
        col: usize,
        message: String,
    },
    /// A dedent that does not land on any open indentation level.
    IndentMismatch {
        line: usize,
        expected: usize,
        found: usize,
    },
    /// Unexpected token or EOF while parsing, and semantic errors that are
    /// detected with a source position at hand.
    Syntax {
        line: Option<usize>,
        message: String,
    },
    /// A transition names a rule that does not exist.
    UnknownLabel {
        line: Option<usize>,
        label: String,
    },
    /// A transition jumps between unrelated window blocks.
    InvalidTransition { from: usize, to: usize },
    /// An action the code generator refuses to lower (`restart-from-start`).
    UnsupportedAction(String),
    /// Yield destination/source problems: bad sigil, bare-string sources,
    /// tuple arity disagreement.
    BadYield(String),
    /// A declared result variable does not match the protobuf schema.
    ProtoSchema { field: String, reason: String },
    /// `start_timestamp` of a window with no duration.
    MissingWindowDuration { rule: String },
    /// Malformed AST JSON on stdin.
    Json(String),
    /// Formatting failure while emitting generated text.
    Format(std::fmt::Error),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Lexer { line, col, message } => {
                write!(f, "lexer error at line {} position {}: {}", line, col, message)
            }
            CompileError::IndentMismatch {
                line,
                expected,
                found,
            } => write!(
                f,
                "indent level doesn't match earlier at line {}: expected width {}, got {}",
                line, expected, found
            ),
            CompileError::Syntax { line, message } => match line {
                Some(line) => write!(f, "syntax error at line {}: {}", line, message),
                None => write!(f, "syntax error: {}", message),
            },
            CompileError::UnknownLabel { line, label } => match line {
                Some(line) => write!(f, "label not found at line {}: {}", line, label),
                None => write!(f, "label not found: {}", label),
            },
            CompileError::InvalidTransition { from, to } => write!(
                f,
                "invalid transition: jumping between unrelated window blocks {}->{}",
                from, to
            ),
            CompileError::UnsupportedAction(action) => {
                write!(f, "'{}' not supported", action)
            }
            CompileError::BadYield(message) => write!(f, "bad yield: {}", message),
            CompileError::ProtoSchema { field, reason } => {
                write!(f, "proto schema error for field '{}': {}", field, reason)
            }
            CompileError::MissingWindowDuration { rule } => write!(
                f,
                "cannot yield window start timestamp when window is infinite (rule '{}')",
                rule
            ),
            CompileError::Json(message) => write!(f, "invalid AST JSON: {}", message),
            CompileError::Format(e) => write!(f, "generation error: {}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<std::fmt::Error> for CompileError {
    fn from(e: std::fmt::Error) -> Self {
        CompileError::Format(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_single_line() {
        let errors = [
            CompileError::Lexer {
                line: 3,
                col: 7,
                message: "invalid token '!'".to_string(),
            },
            CompileError::IndentMismatch {
                line: 4,
                expected: 2,
                found: 3,
            },
            CompileError::Syntax {
                line: Some(1),
                message: "unexpected 'after'".to_string(),
            },
            CompileError::UnknownLabel {
                line: None,
                label: "Nowhere".to_string(),
            },
            CompileError::InvalidTransition { from: 3, to: 5 },
            CompileError::UnsupportedAction("restart-from-start".to_string()),
            CompileError::MissingWindowDuration {
                rule: "W".to_string(),
            },
        ];
        for e in errors {
            assert!(!e.to_string().contains('\n'));
        }
    }

    #[test]
    fn test_proto_schema_names_field() {
        let e = CompileError::ProtoSchema {
            field: "counter_c".to_string(),
            reason: "missing".to_string(),
        };
        assert!(e.to_string().contains("counter_c"));
    }
}
