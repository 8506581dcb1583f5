use std::fmt;

pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// An OCI descriptor's `mediaType` did not match what the caller required.
#[derive(Debug, Clone)]
pub struct MediaTypeError {
    pub expected: String,
    pub found: String,
}

impl fmt::Display for MediaTypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unexpected media type: expected {}, found {}",
            self.expected, self.found
        )
    }
}

impl std::error::Error for MediaTypeError {}

/// A digest used an algorithm this runtime does not accept.
#[derive(Debug, Clone)]
pub struct AlgorithmError {
    pub found: String,
}

impl fmt::Display for AlgorithmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported digest algorithm: {}", self.found)
    }
}

impl std::error::Error for AlgorithmError {}

pub(crate) fn ignore_kind(
    result: std::io::Result<()>,
    kind: std::io::ErrorKind,
) -> std::io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            if err.kind() == kind {
                Ok(())
            } else {
                Err(err)
            }
        }
    }
}
