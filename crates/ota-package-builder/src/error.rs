use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad inputs or environment, detected before any archive is opened.
    Config,
    /// An external tool ran and reported failure.
    Tool,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
    exit_code: Option<i32>,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Io,
            msg: msg.into(),
            exit_code: None,
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Config,
            msg: msg.into(),
            exit_code: None,
        }
    }

    pub fn tool<M: Into<String>>(msg: M, exit_code: Option<i32>) -> Self {
        Self {
            kind: ErrorKind::Tool,
            msg: msg.into(),
            exit_code,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Process exit status for this error. Tool failures propagate the
    /// tool's own status when it fits in a shell exit code.
    pub fn exit_code(&self) -> i32 {
        match self.exit_code {
            Some(code) if (1..=255).contains(&code) => code,
            _ => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Self::msg(format!("walkdir error: {err}"))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Self::msg(format!("zip error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(format!("json encode error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_exit_code_is_propagated_when_representable() {
        assert_eq!(Error::tool("ddelta_generate failed", Some(3)).exit_code(), 3);
        assert_eq!(Error::tool("killed", None).exit_code(), 1);
        assert_eq!(Error::tool("odd", Some(-1)).exit_code(), 1);
        assert_eq!(Error::config("empty dir").exit_code(), 1);
    }
}
