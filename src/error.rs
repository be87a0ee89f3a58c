use std::fmt;

#[derive(Debug)]
pub enum PlatenError {
    /// Malformed or unsupported input: bad magic, unknown header size,
    /// unsupported bit depth / color type / filter / compression.
    Format {
        format: &'static str,
        detail: String,
    },
    /// The input declared more data than it carries.
    Truncated {
        format: &'static str,
        needed: usize,
        available: usize,
    },
    /// An interpreter contract was violated: closing a path that was never
    /// opened, selecting an unregistered handle.
    State(String),
    InvalidConfiguration(String),
    Io(std::io::Error),
}

impl PlatenError {
    pub(crate) fn format(format: &'static str, detail: impl Into<String>) -> Self {
        PlatenError::Format {
            format,
            detail: detail.into(),
        }
    }

    pub(crate) fn truncated(format: &'static str, needed: usize, available: usize) -> Self {
        PlatenError::Truncated {
            format,
            needed,
            available,
        }
    }

    pub(crate) fn state(detail: impl Into<String>) -> Self {
        PlatenError::State(detail.into())
    }
}

impl fmt::Display for PlatenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatenError::Format { format, detail } => {
                write!(f, "{} format error: {}", format, detail)
            }
            PlatenError::Truncated {
                format,
                needed,
                available,
            } => write!(
                f,
                "{} input truncated: needed {} bytes, {} available",
                format, needed, available
            ),
            PlatenError::State(detail) => write!(f, "interpreter state error: {}", detail),
            PlatenError::InvalidConfiguration(detail) => {
                write!(f, "invalid configuration: {}", detail)
            }
            PlatenError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for PlatenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlatenError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PlatenError {
    fn from(value: std::io::Error) -> Self {
        PlatenError::Io(value)
    }
}
