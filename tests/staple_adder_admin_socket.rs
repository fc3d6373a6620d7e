//! Exercises `StapleAdder` against a fake HAProxy admin socket: a real
//! `UnixListener` that speaks the same `prompt` / `set timeout cli` /
//! `set ssl ocsp-response` / `> `-prompt protocol HAProxy's runtime API
//! uses, so the test drives the actual wire format rather than a mock trait.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use stapled::model::{new_record_map, CertRecord};
use stapled::ocsp::{OcspStaple, OcspStatus};
use stapled::staple_adder::StapleAdder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

/// A minimal fake HAProxy admin socket: accepts one connection, replies to
/// `expected_lines` commands in turn (the `> ` prompt for handshake lines,
/// the real success string for `set ssl ocsp-response`), then returns.
async fn run_fake_admin_socket(listener: UnixListener, expected_lines: usize) {
    let (mut stream, _) = listener.accept().await.unwrap();
    for _ in 0..expected_lines {
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before all expected commands arrived");
        let line = String::from_utf8_lossy(&buf[..n]);
        let line = line.trim();
        if line.starts_with("set ssl ocsp-response") {
            stream.write_all(b"OCSP Response updated!\n> ").await.unwrap();
        } else {
            stream.write_all(b"> ").await.unwrap();
        }
    }
}

fn staple_record(cert_path: PathBuf, filename: PathBuf) -> CertRecord {
    let mut rec = CertRecord::new(filename, cert_path, vec![], SystemTime::now());
    rec.ocsp_staple = Some(OcspStaple {
        status: OcspStatus::Good,
        valid_from: chrono::Utc::now(),
        valid_until: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
        raw: b"fake-der-staple-bytes".to_vec(),
    });
    rec
}

#[tokio::test]
async fn sends_staple_and_reads_success_response() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("admin.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    // handshake (`prompt`, `set timeout cli ...`) + one staple push.
    let server = tokio::spawn(run_fake_admin_socket(listener, 3));

    let cert_path = PathBuf::from("/etc/haproxy/haproxy.cfg");
    let filename = dir.path().join("site.pem");

    let mut mapping = HashMap::new();
    mapping.insert(cert_path.clone(), vec![socket_path.clone()]);

    let adder = StapleAdder::new(mapping, 86_400).await;
    let records = new_record_map();
    records.insert(filename.clone(), staple_record(cert_path, filename.clone()));

    adder.add_staple(&filename, &records).await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn bad_response_is_reported_as_staple_adder_error() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("admin.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for _ in 0..2 {
            // handshake
            let mut buf = vec![0u8; 1024];
            stream.read(&mut buf).await.unwrap();
            stream.write_all(b"> ").await.unwrap();
        }
        let mut buf = vec![0u8; 1024];
        stream.read(&mut buf).await.unwrap();
        // A response that isn't the documented success string.
        stream.write_all(b"unknown command\n> ").await.unwrap();
    });

    let cert_path = PathBuf::from("/etc/haproxy/haproxy.cfg");
    let filename = dir.path().join("site.pem");
    let mut mapping = HashMap::new();
    mapping.insert(cert_path.clone(), vec![socket_path.clone()]);

    let adder = StapleAdder::new(mapping, 86_400).await;
    let records = new_record_map();
    records.insert(filename.clone(), staple_record(cert_path, filename.clone()));

    let err = adder.add_staple(&filename, &records).await.unwrap_err();
    assert!(matches!(err, stapled::error::StapleError::StapleAdderBadResponse(_)));
    server.await.unwrap();
}
