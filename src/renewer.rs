//! Fetches a fresh OCSP staple for a certificate from its responder URL(s),
//! validates it, and writes it to the `<cert>.ocsp` file on disk.
//!
//! URL round-robin on failure is handled by [`crate::errhandler`], not here:
//! this function always uses whichever URL `record.url_index` currently
//! points at and returns a plain [`StapleError`] on failure.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cert;
use crate::error::StapleError;
use crate::model::RecordMap;
use crate::ocsp;

const OCSP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OCSP_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Renewer {
    http: reqwest::Client,
}

impl Renewer {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(OCSP_CONNECT_TIMEOUT)
            .read_timeout(OCSP_READ_TIMEOUT)
            .build()?;
        Ok(Renewer { http })
    }

    pub async fn renew(&self, filename: &Path, records: &RecordMap) -> Result<(), StapleError> {
        let (end_entity_der, issuer_der, url) = {
            let rec = records.get(filename).ok_or_else(|| StapleError::RenewalRequirementMissing {
                path: filename.to_path_buf(),
                reason: "certificate is no longer tracked".into(),
            })?;
            let end_entity = rec.end_entity.as_ref().ok_or_else(|| {
                StapleError::RenewalRequirementMissing {
                    path: filename.to_path_buf(),
                    reason: "certificate is missing, can't validate without it".into(),
                }
            })?;
            let issuer = rec.intermediates.last().ok_or_else(|| {
                StapleError::RenewalRequirementMissing {
                    path: filename.to_path_buf(),
                    reason: "certificate chain is missing, can't validate without it".into(),
                }
            })?;
            let url = rec
                .next_ocsp_url()
                .ok_or_else(|| StapleError::RenewalRequirementMissing {
                    path: filename.to_path_buf(),
                    reason: "no OCSP responder URL found on certificate".into(),
                })?
                .to_string();
            (end_entity.der.clone(), issuer.der.clone(), url)
        };

        debug!(file = %filename.display(), %url, "trying to get OCSP staple");
        let request_der = ocsp::build_request(&end_entity_der, &issuer_der)
            .map_err(|e| StapleError::RenewalRequirementMissing {
                path: filename.to_path_buf(),
                reason: e.to_string(),
            })?;

        // Some responders 400 without an explicit Host header even though
        // it's implied by the request line; set it ourselves rather than
        // trusting every intermediary to add one.
        let host = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/ocsp-request")
            .header("Accept", "application/ocsp-response")
            .header("Host", host)
            .body(request_der)
            .send()
            .await
            .map_err(|e| StapleError::Network {
                path: filename.to_path_buf(),
                url: url.clone(),
                source: e,
            })?;

        let body = response.bytes().await.map_err(|e| StapleError::Network {
            path: filename.to_path_buf(),
            url: url.clone(),
            source: e,
        })?;

        let staple = ocsp::classify_fresh_response(&body, filename)?;
        info!(
            file = %filename.display(),
            %url,
            valid_until = ?staple.valid_until,
            "received good OCSP response"
        );

        debug!(file = %filename.display(), "validating staple against chain");
        {
            let rec = records.get(filename).ok_or_else(|| StapleError::RenewalRequirementMissing {
                path: filename.to_path_buf(),
                reason: "certificate is no longer tracked".into(),
            })?;
            if let Some(end_entity) = &rec.end_entity {
                cert::validate_chain(filename, end_entity, &rec.intermediates)?;
            }
        }

        let staple_path = {
            let rec = records.get(filename).unwrap();
            rec.staple_path()
        };
        std::fs::write(&staple_path, &staple.raw).map_err(|e| StapleError::CertFileAccess {
            path: staple_path.clone(),
            source: e,
        })?;
        info!(file = %staple_path.display(), "successfully validated, wrote staple to disk");

        if let Some(mut rec) = records.get_mut(filename) {
            rec.ocsp_staple = Some(staple);
        }

        Ok(())
    }
}

/// Advance the certificate's OCSP URL round-robin index, wrapping at the
/// number of configured URLs. Used by `errhandler` on network errors.
pub fn advance_url_index(records: &RecordMap, filename: &Path) {
    if let Some(mut rec) = records.get_mut(filename) {
        if !rec.ocsp_urls.is_empty() {
            rec.url_index = (rec.url_index + 1) % rec.ocsp_urls.len();
        }
    }
}

pub type SharedRenewer = Arc<Renewer>;
