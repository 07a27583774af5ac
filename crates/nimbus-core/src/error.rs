use std::fmt;

use thiserror::Error;

pub type NimbusResult<T> = Result<T, NimbusError>;

/// Every failure a remote call or transfer can surface.
///
/// Cloneable so a cached failure can be handed to several callers at once.
#[derive(Debug, Clone, Error)]
pub enum NimbusError {
    /// Transport I/O failure; retryable by the request executor.
    #[error("network error: {0}")]
    Network(String),

    /// TLS handshake or certificate failure; never retried.
    #[error("insecure transport: {0}")]
    InsecureTransport(String),

    #[error("API error {status} ({kind}): {message}")]
    Api {
        kind: ApiErrorKind,
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("file I/O error: {0}")]
    FileIo(String),

    /// The owning task was interrupted. A terminal outcome, not a failure.
    #[error("transfer canceled")]
    Canceled,

    /// Caller broke the engine contract (e.g. write after complete).
    #[error("invalid state: {0}")]
    State(String),

    #[error("config error: {0}")]
    Config(String),
}

impl NimbusError {
    pub fn api(kind: ApiErrorKind, status: u16, message: impl Into<String>) -> Self {
        NimbusError::Api {
            kind,
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, NimbusError::Canceled)
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            NimbusError::Api {
                kind: ApiErrorKind::Unauthorized,
                ..
            }
        )
    }

    pub fn api_kind(&self) -> Option<ApiErrorKind> {
        match self {
            NimbusError::Api { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NimbusError {
    fn from(e: std::io::Error) -> Self {
        NimbusError::FileIo(e.to_string())
    }
}

/// Failures of key handling and stream ciphers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The passphrase cannot open the private key.
    #[error("invalid password")]
    InvalidPassword,

    /// Structurally invalid key material, or ciphertext failing authentication.
    #[error("bad file: {0}")]
    BadFile(String),

    /// Invalid argument, mismatched key pair or misuse of a cipher.
    #[error("internal crypto error: {0}")]
    Internal(String),

    /// Failure inside the underlying cipher implementation.
    #[error("system crypto error: {0}")]
    System(String),

    #[error("unknown crypto error: {0}")]
    Unknown(String),
}

/// Semantic classification of a non-2xx service response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    PreconditionFailed,
    RangeNotSatisfiable,
    QuotaExceeded,
    MaliciousFileDetected,
    TooManyRequests,
    ServerError,
    Other,
}

impl ApiErrorKind {
    /// Map an HTTP status plus optional vendor error code to a kind.
    ///
    /// Vendor codes take precedence for the few cases where the status alone
    /// is ambiguous (quota and malware both arrive as 4xx with a code).
    pub fn classify(status: u16, vendor_code: Option<i64>) -> Self {
        match vendor_code {
            Some(-40200) | Some(-90200) => return ApiErrorKind::QuotaExceeded,
            Some(-40761) | Some(-90201) => return ApiErrorKind::MaliciousFileDetected,
            _ => {}
        }
        match status {
            400 => ApiErrorKind::BadRequest,
            401 => ApiErrorKind::Unauthorized,
            403 => ApiErrorKind::Forbidden,
            404 => ApiErrorKind::NotFound,
            409 => ApiErrorKind::Conflict,
            412 => ApiErrorKind::PreconditionFailed,
            416 => ApiErrorKind::RangeNotSatisfiable,
            507 => ApiErrorKind::QuotaExceeded,
            429 => ApiErrorKind::TooManyRequests,
            500..=599 => ApiErrorKind::ServerError,
            _ => ApiErrorKind::Other,
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApiErrorKind::BadRequest => "bad request",
            ApiErrorKind::Unauthorized => "unauthorized",
            ApiErrorKind::Forbidden => "permission denied",
            ApiErrorKind::NotFound => "not found",
            ApiErrorKind::Conflict => "conflict",
            ApiErrorKind::PreconditionFailed => "precondition failed",
            ApiErrorKind::RangeNotSatisfiable => "range not satisfiable",
            ApiErrorKind::QuotaExceeded => "quota exceeded",
            ApiErrorKind::MaliciousFileDetected => "malicious file detected",
            ApiErrorKind::TooManyRequests => "too many requests",
            ApiErrorKind::ServerError => "server error",
            ApiErrorKind::Other => "unexpected response",
        };
        f.write_str(s)
    }
}
