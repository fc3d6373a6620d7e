//! The closed error taxonomy routed through [`crate::errhandler`].
//!
//! Every failure mode a pipeline stage can produce is represented here so the
//! central handler can match on it exhaustively instead of unwinding through
//! an ad-hoc exception hierarchy.

use std::path::PathBuf;

use thiserror::Error;

/// Severity a [`CertParsingError`](StapleError::CertParsing) should be logged
/// at. A pure CA bundle (no end-entity found, but intermediates present) is
/// informational; anything else that prevents parsing is critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseSeverity {
    Info,
    Critical,
}

/// The closed failure taxonomy every pipeline stage reports through, routed
/// via [`crate::errhandler::handle`] into a retry cadence or a permanent
/// give-up.
#[derive(Debug, Error)]
pub enum StapleError {
    #[error("can't access certificate file {path}: {source}")]
    CertFileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("staple adder received an unexpected response: {0}")]
    StapleAdderBadResponse(String),

    #[error("socket error for {path}: {reason}")]
    SocketFatal { path: PathBuf, reason: String },

    #[error("renewal requirement missing for {path}: {reason}")]
    RenewalRequirementMissing { path: PathBuf, reason: String },

    #[error("certificate validation failed for {path}: {reason}")]
    CertValidation { path: PathBuf, reason: String },

    #[error("certificate parsing failed for {path}: {reason}")]
    CertParsing {
        path: PathBuf,
        reason: String,
        severity: ParseSeverity,
    },

    #[error("OCSP response rejected for {path}: {reason}")]
    OcspBadResponse { path: PathBuf, reason: String },

    /// The responder reported the certificate as revoked. Unlike every other
    /// `OcspBadResponse` cause, this one is permanent: there's nothing to
    /// retry towards, so it skips the retry cadence entirely.
    #[error("certificate at {path} has been revoked")]
    CertRevoked { path: PathBuf },

    #[error("network error fetching OCSP for {path} from {url}: {source}")]
    Network {
        path: PathBuf,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("uncaught error processing {path}: {source}")]
    Uncaught {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl StapleError {
    /// The certificate file this error concerns, when one is known.
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            StapleError::CertFileAccess { path, .. }
            | StapleError::RenewalRequirementMissing { path, .. }
            | StapleError::CertValidation { path, .. }
            | StapleError::CertParsing { path, .. }
            | StapleError::OcspBadResponse { path, .. }
            | StapleError::CertRevoked { path }
            | StapleError::Network { path, .. }
            | StapleError::Uncaught { path, .. } => Some(path),
            StapleError::StapleAdderBadResponse(_) | StapleError::SocketFatal { .. } => None,
        }
    }

    /// A stable discriminant used for "is this the same error as last time"
    /// comparisons in [`crate::task::TaskContext::record_exception`].
    pub fn kind_key(&self) -> String {
        match self {
            StapleError::CertFileAccess { .. } => "cert_file_access".into(),
            StapleError::StapleAdderBadResponse(_) => "staple_adder_bad_response".into(),
            StapleError::SocketFatal { .. } => "socket_fatal".into(),
            StapleError::RenewalRequirementMissing { .. } => "renewal_requirement_missing".into(),
            StapleError::CertValidation { .. } => "cert_validation".into(),
            StapleError::CertParsing { .. } => "cert_parsing".into(),
            StapleError::OcspBadResponse { reason, .. } => {
                format!("ocsp_bad_response:{reason}")
            }
            StapleError::CertRevoked { .. } => "cert_revoked".into(),
            // Deliberately not keyed on `url`: `spec.md` §8 requires that
            // consecutive network failures visit each configured responder
            // URL in turn *before* the cadence tier escalates, which only
            // works if switching URLs doesn't look like "a different error"
            // to the consecutive-exception counter.
            StapleError::Network { .. } => "network".into(),
            StapleError::Uncaught { .. } => "uncaught".into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StapleError>;
