use std::io;
use thiserror::Error;

pub type ShellResult<T> = Result<T, ShellError>;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("{0}: syntax error")]
    Syntax(String),

    #[error("{0}: missing required argument(s)")]
    ArgRequired(String),

    #[error("{what}: no matching {missing}")]
    NoMatching { what: String, missing: String },

    #[error("{0}: argument invalid")]
    ArgInvalid(String),

    #[error("{0}: value out of range")]
    ArgRange(String),

    #[error("{0}: command not found")]
    CommandNotFound(String),

    #[error("{cmd}: no such {kind}: {name}")]
    NoSuch {
        cmd: String,
        kind: &'static str,
        name: String,
    },

    #[error("{0}: too many arguments")]
    TooManyArgs(String),

    #[error("{0}: nesting too deep")]
    DeepNesting(String),

    #[error("{0}: not valid in this context")]
    Context(String),

    #[error("{cmd}: {op} failed: {source}")]
    CommandFailed {
        cmd: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0}: Internal error")]
    Internal(String),

    #[error("{0}: Interrupted by signal")]
    Interrupted(String),
}

/// Broad classes of failure, used to decide how much state to abandon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input: the statement is abandoned.
    Syntax,
    /// The system refused something (a file or a thread).
    Resource,
    /// Parser state became inconsistent and was reset.
    Internal,
}

impl ShellError {
    pub fn no_matching(what: impl Into<String>, missing: impl Into<String>) -> Self {
        ShellError::NoMatching {
            what: what.into(),
            missing: missing.into(),
        }
    }

    pub fn failed(cmd: impl Into<String>, op: &'static str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::Interrupted {
            return ShellError::Interrupted(cmd.into());
        }
        ShellError::CommandFailed {
            cmd: cmd.into(),
            op,
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ShellError::CommandFailed { .. } | ShellError::Interrupted(_) => ErrorClass::Resource,
            ShellError::Internal(_) => ErrorClass::Internal,
            _ => ErrorClass::Syntax,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_render_one_line() {
        let cases = [
            (ShellError::Syntax("fi".into()), "fi: syntax error"),
            (ShellError::no_matching("`", "`"), "`: no matching `"),
            (ShellError::DeepNesting("if".into()), "if: nesting too deep"),
            (
                ShellError::Context("then".into()),
                "then: not valid in this context",
            ),
            (ShellError::CommandNotFound("frob".into()), "frob: command not found"),
            (ShellError::ArgRange("sleep".into()), "sleep: value out of range"),
            (ShellError::Internal("done".into()), "done: Internal error"),
        ];
        for (err, expected) in cases {
            assert_eq!(err.to_string(), expected);
        }
    }

    #[test]
    fn test_failed_maps_interrupts_and_classes() {
        let err = ShellError::failed("cat", "open", io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.class(), ErrorClass::Resource);
        assert!(err.to_string().starts_with("cat: open failed: "));

        let err = ShellError::failed("cat", "read", io::Error::from(io::ErrorKind::Interrupted));
        assert_eq!(err.to_string(), "cat: Interrupted by signal");

        assert_eq!(ShellError::Context("do".into()).class(), ErrorClass::Syntax);
        assert_eq!(ShellError::Internal("fi".into()).class(), ErrorClass::Internal);
    }
}
