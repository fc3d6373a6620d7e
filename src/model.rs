//! `CertRecord`: everything the pipeline knows about one certificate file,
//! and the process-wide table of all tracked records keyed by path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;

use crate::ocsp::OcspStaple;

/// A parsed certificate, kept in DER form because that's what the chain
/// validation and OCSP request building need.
#[derive(Debug, Clone)]
pub struct ParsedCert {
    pub der: Vec<u8>,
    pub is_ca: bool,
}

/// Everything tracked for a single certificate file on disk.
#[derive(Debug, Clone)]
pub struct CertRecord {
    /// Path to the certificate (possibly a bundle) file.
    pub filename: PathBuf,
    /// The `haproxy.cfg` source this certificate was discovered under, used
    /// to look up admin sockets for the StapleAdder stage.
    pub cert_path: PathBuf,
    pub modtime: SystemTime,
    pub raw: Vec<u8>,
    pub end_entity: Option<ParsedCert>,
    pub intermediates: Vec<ParsedCert>,
    pub ocsp_urls: Vec<String>,
    pub url_index: usize,
    pub ocsp_staple: Option<OcspStaple>,
}

impl CertRecord {
    pub fn new(filename: PathBuf, cert_path: PathBuf, raw: Vec<u8>, modtime: SystemTime) -> Self {
        CertRecord {
            filename,
            cert_path,
            modtime,
            raw,
            end_entity: None,
            intermediates: Vec::new(),
            ocsp_urls: Vec::new(),
            url_index: 0,
            ocsp_staple: None,
        }
    }

    /// Path the staple for this certificate is persisted to:
    /// `<filename>.ocsp`.
    pub fn staple_path(&self) -> PathBuf {
        let mut s = self.filename.clone().into_os_string();
        s.push(".ocsp");
        PathBuf::from(s)
    }

    pub fn next_ocsp_url(&self) -> Option<&str> {
        self.ocsp_urls.get(self.url_index % self.ocsp_urls.len().max(1)).map(String::as_str)
    }
}

/// The shared `path -> record` table all components read and update. Backed
/// by `DashMap` since Finder, Parser, Renewer and StapleAdder all touch
/// different entries concurrently and a single `Mutex<HashMap<..>>` would
/// serialize unrelated certificates against each other.
pub type RecordMap = Arc<DashMap<PathBuf, CertRecord>>;

pub fn new_record_map() -> RecordMap {
    Arc::new(DashMap::new())
}

/// True if `path` is currently tracked.
pub fn is_tracked(records: &RecordMap, path: &Path) -> bool {
    records.contains_key(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staple_path_appends_extension() {
        let rec = CertRecord::new(
            PathBuf::from("/etc/certs/example.com.pem"),
            PathBuf::from("/etc/haproxy/haproxy.cfg"),
            vec![],
            SystemTime::now(),
        );
        assert_eq!(
            rec.staple_path(),
            PathBuf::from("/etc/certs/example.com.pem.ocsp")
        );
    }

    #[test]
    fn next_ocsp_url_wraps() {
        let mut rec = CertRecord::new(
            PathBuf::from("/a.pem"),
            PathBuf::from("/haproxy.cfg"),
            vec![],
            SystemTime::now(),
        );
        rec.ocsp_urls = vec!["http://a".into(), "http://b".into()];
        rec.url_index = 2;
        assert_eq!(rec.next_ocsp_url(), Some("http://a"));
    }
}
