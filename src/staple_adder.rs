//! Pushes fresh OCSP staples to a running HAProxy over its admin socket
//! (`stats socket` in `haproxy.cfg`), keeping one connection open per socket
//! path for as long as possible and reconnecting once on a broken pipe.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StapleError;
use crate::model::RecordMap;

const SOCKET_BUFFER_SIZE: usize = 1024;
const OCSP_SUCCESS_RESPONSE: &str = "OCSP Response updated!";

/// `cert path -> admin socket path(s)` serving certificates found under it.
pub type HaproxySocketMapping = HashMap<PathBuf, Vec<PathBuf>>;

pub struct StapleAdder {
    sockets: Mutex<HashMap<PathBuf, UnixStream>>,
    mapping: HaproxySocketMapping,
    /// `set timeout cli` in seconds, sent right after connecting so the
    /// admin socket doesn't time out the connection between staple pushes.
    /// Configured via `Config::haproxy_socket_keepalive`.
    keepalive_secs: u64,
}

impl StapleAdder {
    /// Open every socket named in `mapping` up front, the same eager-connect
    /// behaviour `StapleAdder.__init__` has.
    pub async fn new(mapping: HaproxySocketMapping, keepalive_secs: u64) -> Self {
        let adder = StapleAdder {
            sockets: Mutex::new(HashMap::new()),
            mapping,
            keepalive_secs,
        };
        let paths: Vec<PathBuf> = adder
            .mapping
            .values()
            .flat_map(|v| v.iter().cloned())
            .collect();
        for path in paths {
            if let Err(e) = adder.open_socket(&path).await {
                warn!(socket = %path.display(), error = %e, "could not initialize admin socket");
            }
        }
        adder
    }

    async fn open_socket(&self, path: &Path) -> Result<(), StapleError> {
        let mut stream = UnixStream::connect(path)
            .await
            .map_err(|e| StapleError::SocketFatal {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        send_raw(&mut stream, "prompt").await?;
        send_raw(&mut stream, &format!("set timeout cli {}", self.keepalive_secs)).await?;
        debug!(socket = %path.display(), "opened admin socket prompt");
        self.sockets.lock().await.insert(path.to_path_buf(), stream);
        Ok(())
    }

    async fn reopen_socket(&self, path: &Path) -> Result<(), StapleError> {
        info!(socket = %path.display(), "re-opening socket");
        self.sockets.lock().await.remove(path);
        self.open_socket(path).await
    }

    /// Encode the staple for `filename` and push it to every admin socket
    /// registered for its `cert_path`. A non-success response from any
    /// socket is a fatal [`StapleError::StapleAdderBadResponse`].
    pub async fn add_staple(&self, filename: &Path, records: &RecordMap) -> Result<(), StapleError> {
        let (cert_path, staple_b64) = {
            let rec = records.get(filename).ok_or_else(|| StapleError::StapleAdderBadResponse(
                format!("{} is no longer tracked", filename.display()),
            ))?;
            let staple = rec.ocsp_staple.as_ref().ok_or_else(|| {
                StapleError::StapleAdderBadResponse(format!("{} has no staple yet", filename.display()))
            })?;
            (rec.cert_path.clone(), base64::engine::general_purpose::STANDARD.encode(&staple.raw))
        };

        let Some(paths) = self.mapping.get(&cert_path) else {
            debug!(file = %filename.display(), "no socket set for this certificate's path");
            return Ok(());
        };
        if paths.is_empty() {
            debug!(file = %filename.display(), "no socket set for this certificate's path");
            return Ok(());
        }

        let command = format!("set ssl ocsp-response {staple_b64}");
        debug!(file = %filename.display(), "setting OCSP staple");
        for path in paths {
            let response = self.send_with_reconnect(path, &command).await?;
            if response != OCSP_SUCCESS_RESPONSE {
                return Err(StapleError::StapleAdderBadResponse(format!(
                    "bad HAProxy response: '{response}' from socket {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    async fn send_with_reconnect(&self, path: &Path, command: &str) -> Result<String, StapleError> {
        {
            let mut sockets = self.sockets.lock().await;
            if let Some(stream) = sockets.get_mut(path) {
                match send_raw(stream, command).await {
                    Ok(resp) => return Ok(resp),
                    Err(_) => {
                        // fall through to reopen below
                    }
                }
            }
        }
        self.reopen_socket(path).await?;
        let mut sockets = self.sockets.lock().await;
        let stream = sockets
            .get_mut(path)
            .ok_or_else(|| StapleError::SocketFatal {
                path: path.to_path_buf(),
                reason: "socket missing after reopen".into(),
            })?;
        send_raw(stream, command).await
    }
}

/// Send `command` followed by a newline and read until the `> ` prompt
/// marker shows up in the stream (or the connection closes). Strips
/// trailing newlines/prompt characters from the response, matching
/// `_send`'s `.strip('\n> ')`.
async fn send_raw(stream: &mut UnixStream, command: &str) -> Result<String, StapleError> {
    stream
        .write_all(format!("{command}\n").as_bytes())
        .await
        .map_err(|e| StapleError::SocketFatal {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; SOCKET_BUFFER_SIZE];
    loop {
        let n = stream.read(&mut chunk).await.map_err(|e| StapleError::SocketFatal {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(2).any(|w| w == b"> ") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf).to_string();
    Ok(text.trim_matches(|c| c == '\n' || c == '>' || c == ' ').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_response_constant_matches_haproxy() {
        assert_eq!(OCSP_SUCCESS_RESPONSE, "OCSP Response updated!");
    }

    #[tokio::test]
    async fn add_staple_with_no_mapping_is_a_noop() {
        let records = crate::model::new_record_map();
        let path = PathBuf::from("/tmp/none.pem");
        records.insert(
            path.clone(),
            crate::model::CertRecord::new(path.clone(), PathBuf::from("/tmp/unmapped"), vec![], std::time::SystemTime::now()),
        );
        let adder = StapleAdder::new(HashMap::new(), 86_400).await;
        // No staple set yet, so this should error before ever touching a socket.
        let err = adder.add_staple(&path, &records).await.unwrap_err();
        assert!(matches!(err, StapleError::StapleAdderBadResponse(_)));
    }
}
