use std::fmt;

/// How a failure should be routed back to the queue.
///
/// Permanent failures are discarded, everything else is requeued. Transient
/// and unexpected failures are routed identically but reported under
/// different labels so that an unclassified error stands out on dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Permanent,
    Transient,
    Unexpected,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Permanent => "permanent",
            FailureClass::Transient => "transient",
            FailureClass::Unexpected => "unexpected",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Permanent)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
