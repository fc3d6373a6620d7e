//! OCSP request construction and response parsing.
//!
//! This is the "black box" crypto layer: callers hand us DER bytes for the
//! end-entity and issuer certificates and get back either a request to POST
//! to a responder, or a parsed [`OcspStaple`] from the response bytes. Wire
//! format details (ASN.1 DER encoding of the request/response) are handled
//! entirely by the `x509-ocsp` and `der` crates; we only adapt shapes.

use chrono::{DateTime, Utc};
use der::asn1::OctetString;
use der::oid::ObjectIdentifier;
use der::{Decode, Encode};
use sha1::{Digest, Sha1};
use x509_ocsp::{
    AlgorithmIdentifierOwned, CertId, CertStatus, OcspRequest, OcspResponse,
    Request as SingleRequest, TbsRequest, Version,
};

use crate::error::StapleError;

/// OID for SHA-1, the hash algorithm used for `CertId.hashAlgorithm`.
const SHA1_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");

fn sha1_algorithm_identifier() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: SHA1_OID,
        parameters: Some(der::asn1::Null.into()),
    }
}

/// Result of inspecting a parsed OCSP response for a single certificate:
/// status plus the validity window, and the raw DER bytes for persistence
/// to the `.ocsp` file.
#[derive(Debug, Clone)]
pub struct OcspStaple {
    pub status: OcspStatus,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspStatus {
    Good,
    Revoked,
    Unknown,
}

/// Build the DER bytes of an OCSP request for `end_entity_der`, issued by
/// `issuer_der`. No nonce extension is attached: the daemon never validates
/// nonces on the response, and omitting it lets more responders return
/// long-lived cached answers suitable for stapling.
pub fn build_request(end_entity_der: &[u8], issuer_der: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cert_id = build_cert_id(end_entity_der, issuer_der)?;
    let request = SingleRequest {
        req_cert: cert_id,
        single_request_extensions: None,
    };
    let tbs = TbsRequest {
        version: Version::V1,
        requestor_name: None,
        request_list: vec![request],
        request_extensions: None,
    };
    let ocsp_request = OcspRequest {
        tbs_request: tbs,
        optional_signature: None,
    };
    Ok(ocsp_request.to_der()?)
}

fn build_cert_id(end_entity_der: &[u8], issuer_der: &[u8]) -> anyhow::Result<CertId> {
    use x509_parser::prelude::{FromDer, X509Certificate};

    let (_, end_entity) = X509Certificate::from_der(end_entity_der)
        .map_err(|e| anyhow::anyhow!("can't parse end-entity DER: {e}"))?;
    let (_, issuer) = X509Certificate::from_der(issuer_der)
        .map_err(|e| anyhow::anyhow!("can't parse issuer DER: {e}"))?;

    let issuer_name_der = issuer.subject().as_raw().to_vec();
    let issuer_key_der = issuer.public_key().raw.to_vec();

    let mut name_hasher = Sha1::new();
    name_hasher.update(&issuer_name_der);
    let issuer_name_hash = name_hasher.finalize().to_vec();

    let mut key_hasher = Sha1::new();
    key_hasher.update(&issuer_key_der);
    let issuer_key_hash = key_hasher.finalize().to_vec();

    let serial_number = end_entity.raw_serial().to_vec();

    Ok(CertId {
        hash_algorithm: sha1_algorithm_identifier(),
        issuer_name_hash: OctetString::new(issuer_name_hash)?,
        issuer_key_hash: OctetString::new(issuer_key_hash)?,
        serial_number: der::asn1::Uint::new(&serial_number)?,
    })
}

/// Parse raw OCSP response DER bytes into an [`OcspStaple`].
///
/// Returns `Ok(None)` for an explicitly empty response (a zero-length byte
/// slice), which the caller treats as [`StapleError::OcspBadResponse`].
pub fn parse_response(raw: &[u8]) -> anyhow::Result<Option<OcspStaple>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let response = OcspResponse::from_der(raw)
        .map_err(|e| anyhow::anyhow!("can't parse OCSP response: {e}"))?;
    let basic = response
        .response_bytes
        .ok_or_else(|| anyhow::anyhow!("OCSP response has no response bytes"))?
        .to_basic_response()
        .map_err(|e| anyhow::anyhow!("can't decode basic OCSP response: {e}"))?;

    let single = basic
        .tbs_response_data
        .responses
        .first()
        .ok_or_else(|| anyhow::anyhow!("OCSP response contains no SingleResponse entries"))?;

    let status = match single.cert_status {
        CertStatus::Good(_) => OcspStatus::Good,
        CertStatus::Revoked(_) => OcspStatus::Revoked,
        CertStatus::Unknown(_) => OcspStatus::Unknown,
    };

    let valid_from = generalized_time_to_chrono(&single.this_update)?;
    let valid_until = single
        .next_update
        .as_ref()
        .map(generalized_time_to_chrono)
        .transpose()?;

    Ok(Some(OcspStaple {
        status,
        valid_from,
        valid_until,
        raw: raw.to_vec(),
    }))
}

fn generalized_time_to_chrono(t: &der::asn1::GeneralizedTime) -> anyhow::Result<DateTime<Utc>> {
    let system_time: std::time::SystemTime = t.to_date_time().into();
    Ok(DateTime::<Utc>::from(system_time))
}

/// Classify a freshly fetched response the way `_check_ocsp_response` does:
/// good is accepted, unknown is rejected with the same retry cadence as any
/// other bad response, and revoked is rejected permanently — there's no
/// cadence to retry towards once the responder has said "revoked".
pub fn classify_fresh_response(
    raw: &[u8],
    filename: &std::path::Path,
) -> Result<OcspStaple, StapleError> {
    let parsed = parse_response(raw).map_err(|e| StapleError::OcspBadResponse {
        path: filename.to_path_buf(),
        reason: e.to_string(),
    })?;
    let staple = parsed.ok_or_else(|| StapleError::OcspBadResponse {
        path: filename.to_path_buf(),
        reason: "empty response".into(),
    })?;
    match staple.status {
        OcspStatus::Good => Ok(staple),
        OcspStatus::Revoked => Err(StapleError::CertRevoked {
            path: filename.to_path_buf(),
        }),
        OcspStatus::Unknown => Err(StapleError::OcspBadResponse {
            path: filename.to_path_buf(),
            reason: "responder returned unknown status".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_is_none() {
        assert!(parse_response(&[]).unwrap().is_none());
    }

    #[test]
    fn empty_response_classifies_as_bad_response() {
        let path = std::path::Path::new("/tmp/doesnotmatter.pem");
        let err = classify_fresh_response(&[], path).unwrap_err();
        assert!(matches!(err, StapleError::OcspBadResponse { .. }));
    }

}
