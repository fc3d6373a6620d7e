//! Exercises `cert::read_full_chain`/`validate_chain` against a real
//! PEM chain (an RSA leaf issued by an intermediate CA issued by a root
//! CA, generated with `openssl req -x509`/`openssl x509 -req`), covering
//! the "pure CA bundle" boundary case and the AIA OCSP-URL extraction
//! chain parsing depends on.

use std::path::Path;

use stapled::cert;
use stapled::error::{ParseSeverity, StapleError};

const LEAF_WITH_CHAIN: &[u8] = include_bytes!("fixtures/leaf_with_chain.pem");
const CA_ONLY_BUNDLE: &[u8] = include_bytes!("fixtures/ca_only_bundle.pem");

#[test]
fn reads_end_entity_intermediates_and_ocsp_url_from_a_real_chain() {
    let path = Path::new("/tmp/leaf_with_chain.pem");
    let result = cert::read_full_chain(path, LEAF_WITH_CHAIN).unwrap();

    assert!(result.end_entity.is_some());
    assert_eq!(result.intermediates.len(), 1);
    assert_eq!(result.ocsp_urls, vec!["http://ocsp.example.test/".to_string()]);
}

#[test]
fn validates_a_real_two_tier_chain() {
    let path = Path::new("/tmp/leaf_with_chain.pem");
    let result = cert::read_full_chain(path, LEAF_WITH_CHAIN).unwrap();
    let end_entity = result.end_entity.unwrap();

    let ordered = cert::validate_chain(path, &end_entity, &result.intermediates).unwrap();
    // intermediate, then the end entity, with the end entity last so
    // `chain[chain.len() - 2]` is always the immediate issuer.
    assert_eq!(ordered.len(), 2);
    assert!(ordered[0].is_ca);
    assert_eq!(ordered.last().unwrap().der, end_entity.der);
}

#[test]
fn a_pure_ca_bundle_is_rejected_as_having_no_end_entity() {
    let path = Path::new("/tmp/ca_only_bundle.pem");
    let err = cert::read_full_chain(path, CA_ONLY_BUNDLE).unwrap_err();
    match err {
        StapleError::CertParsing { severity, .. } => {
            assert_eq!(severity, ParseSeverity::Info, "a pure CA bundle is informational, not critical");
        }
        other => panic!("expected CertParsing, got {other:?}"),
    }
}
