use kproxy_common::ApiFormat;

#[derive(Debug, Clone)]
pub enum TransformError {
    /// No transformer exists for this format pair.
    UnsupportedPair { src: ApiFormat, dst: ApiFormat },
    /// The body did not parse as the source format.
    Decode(String),
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::UnsupportedPair { src, dst } => {
                write!(f, "no transform from {src:?} to {dst:?}")
            }
            TransformError::Decode(message) => write!(f, "transform decode failed: {message}"),
        }
    }
}

impl std::error::Error for TransformError {}

impl TransformError {
    pub fn decode(err: impl std::fmt::Display) -> Self {
        TransformError::Decode(err.to_string())
    }
}
