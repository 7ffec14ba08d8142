// Error types: installation failures, the error-metadata view taken of failed
// calls, and the concrete service error produced by the wrapped SDK surfaces.

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("`{0}` is already wrapped")]
    AlreadyWrapped(&'static str),
    #[error("`{0}` is not wrapped")]
    NotWrapped(&'static str),
    #[error("exports handed to `{module}` are not of the expected type")]
    UnexpectedExports { module: &'static str },
}

// Read-only view of the correlation data a failed call may carry.
pub trait ErrorMetadata {
    fn request_id(&self) -> Option<&str> {
        None
    }
    fn extended_request_id(&self) -> Option<&str> {
        None
    }
    fn http_status_code(&self) -> Option<u16> {
        None
    }
}

/// Error returned by an AWS service call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ServiceError {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
    pub extended_request_id: Option<String>,
    pub http_status_code: Option<u16>,
}

impl ServiceError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: None,
            extended_request_id: None,
            http_status_code: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_extended_request_id(mut self, extended_request_id: impl Into<String>) -> Self {
        self.extended_request_id = Some(extended_request_id.into());
        self
    }

    pub fn with_http_status_code(mut self, status: u16) -> Self {
        self.http_status_code = Some(status);
        self
    }
}

impl ErrorMetadata for ServiceError {
    fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
    fn extended_request_id(&self) -> Option<&str> {
        self.extended_request_id.as_deref()
    }
    fn http_status_code(&self) -> Option<u16> {
        self.http_status_code
    }
}
