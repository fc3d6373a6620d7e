//! Parses tracked certificate files into their end-entity/intermediate
//! chain, validates the chain, and decides whether an existing `.ocsp`
//! staple can be recycled or a renewal needs to be scheduled.

use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info};

use crate::cert;
use crate::error::StapleError;
use crate::model::RecordMap;
use crate::ocsp::{self, OcspStatus};
use crate::scheduler::Scheduler;
use crate::task::{Stage, TaskContext};

pub struct ParserConfig {
    pub minimum_validity: ChronoDuration,
    pub no_recycle: bool,
}

/// Parse and validate the certificate at `filename`, then either recycle its
/// existing staple (scheduling a renewal before it expires) or schedule an
/// immediate renewal, matching `CertParserThread.parse_certificate`.
pub async fn parse_certificate(
    filename: &Path,
    records: &RecordMap,
    scheduler: &Scheduler,
    config: &ParserConfig,
) -> Result<(), StapleError> {
    let raw = {
        let rec = records
            .get(filename)
            .ok_or_else(|| StapleError::CertFileAccess {
                path: filename.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no longer tracked"),
            })?;
        rec.raw.clone()
    };

    let chain_result = cert::read_full_chain(filename, &raw)?;
    let end_entity = chain_result
        .end_entity
        .clone()
        .ok_or_else(|| StapleError::CertParsing {
            path: filename.to_path_buf(),
            reason: "no end-entity certificate found".into(),
            severity: crate::error::ParseSeverity::Info,
        })?;
    let ordered_chain = cert::validate_chain(filename, &end_entity, &chain_result.intermediates)?;

    {
        let mut rec = records
            .get_mut(filename)
            .ok_or_else(|| StapleError::CertFileAccess {
                path: filename.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no longer tracked"),
            })?;
        rec.end_entity = Some(end_entity);
        rec.intermediates = ordered_chain.iter().take(ordered_chain.len() - 1).cloned().collect();
        rec.ocsp_urls = chain_result.ocsp_urls;
    }

    let recycled = if config.no_recycle {
        false
    } else {
        recycle_staple(filename, records, config.minimum_validity)?
    };

    if recycled {
        let rec = records.get(filename).unwrap();
        let valid_until = rec.ocsp_staple.as_ref().and_then(|s| s.valid_until);
        if let Some(valid_until) = valid_until {
            let sched_time = valid_until - config.minimum_validity;
            info!(file = %filename.display(), at = %sched_time, "recycled staple, scheduling renewal");
            scheduler
                .add_task(TaskContext::new(Stage::Renew, filename.to_path_buf(), Some(sched_time)))
                .await;
        }
    } else {
        info!(file = %filename.display(), "scheduling staple renewal ASAP");
        scheduler
            .add_task(TaskContext::asap(Stage::Renew, filename.to_path_buf()))
            .await;
    }

    Ok(())
}

/// Try to find an existing `.ocsp` staple that's still valid for more than
/// `minimum_validity`. Returns `true` if the cached staple was assigned to
/// the record and is good enough that we can wait before renewing; `false`
/// whenever a fresh staple should be requested right away (matches
/// `CertModel.recycle_staple`'s contract exactly, including its
/// swallow-everything-and-ask-for-a-new-one-on-any-doubt behaviour).
fn recycle_staple(
    filename: &Path,
    records: &RecordMap,
    minimum_validity: ChronoDuration,
) -> Result<bool, StapleError> {
    let staple_path = {
        let rec = records.get(filename).unwrap();
        rec.staple_path()
    };

    let raw_staple = match std::fs::read(&staple_path) {
        Ok(bytes) => bytes,
        Err(_) => {
            debug!(file = %staple_path.display(), "no staple file yet, need to request one");
            return Ok(false);
        }
    };

    if raw_staple.is_empty() {
        info!(file = %staple_path.display(), "staple file is empty, scheduling a renewal");
        return Ok(false);
    }

    let parsed = match ocsp::parse_response(&raw_staple) {
        Ok(Some(staple)) => staple,
        _ => return Ok(false),
    };

    let now: DateTime<Utc> = Utc::now();
    let still_valid = parsed.status == OcspStatus::Good
        && parsed.valid_until.map(|until| until > now).unwrap_or(false);
    if !still_valid {
        debug!(file = %filename.display(), "staple has expired");
        return Ok(false);
    }

    // Re-validate the chain together with the cached staple before trusting
    // it. Any validation failure just means we ask for a new one.
    {
        let rec = records.get(filename).unwrap();
        if let (Some(end_entity), false) = (&rec.end_entity, rec.intermediates.is_empty()) {
            if cert::validate_chain(filename, end_entity, &rec.intermediates).is_err() {
                return Ok(false);
            }
        }
    }

    let valid_until = parsed.valid_until;
    {
        let mut rec = records.get_mut(filename).unwrap();
        rec.ocsp_staple = Some(parsed);
    }

    if let Some(until) = valid_until {
        info!(file = %staple_path.display(), expires = %until, "staple is still valid, reusing it");
        if until - minimum_validity < now {
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::SystemTime;

    use crate::model::{new_record_map, CertRecord};

    #[test]
    fn recycle_returns_false_when_no_staple_file() {
        let records = new_record_map();
        let path = PathBuf::from("/tmp/stapled-test-nonexistent-cert.pem");
        records.insert(
            path.clone(),
            CertRecord::new(path.clone(), path.clone(), vec![], SystemTime::now()),
        );
        let result = recycle_staple(&path, &records, ChronoDuration::seconds(7200)).unwrap();
        assert!(!result);
    }

    #[test]
    fn recycle_returns_false_for_empty_staple_file() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("a.pem");
        std::fs::write(&cert_path, b"").unwrap();
        let staple_path = dir.path().join("a.pem.ocsp");
        std::fs::write(&staple_path, b"").unwrap();

        let records = new_record_map();
        records.insert(
            cert_path.clone(),
            CertRecord::new(cert_path.clone(), cert_path.clone(), vec![], SystemTime::now()),
        );
        let result = recycle_staple(&cert_path, &records, ChronoDuration::seconds(7200)).unwrap();
        assert!(!result);
    }
}
