//! Minimal HAProxy config parsing: just enough to turn a `haproxy.cfg` into
//! the `cert path -> admin socket path` mapping the StapleAdder needs. Full
//! HAProxy config grammar (quoting rules, every directive) is out of scope;
//! we recognise the three directives that matter here: `stats socket`,
//! `crt`, and `crt-base`.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

static STATS_SOCKET: Lazy<Regex> = Lazy::new(|| Regex::new(r#"stats\s+socket\s+("[^"]*"|'[^']*'|\S+)"#).unwrap());
static CRT_BASE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"crt-base\s+("[^"]*"|'[^']*'|\S+)"#).unwrap());
static CRT: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bcrt\s+("[^"]*"|'[^']*'|\S+)"#).unwrap());

#[derive(Debug, Default)]
pub struct HaproxyConfig {
    pub cert_paths: Vec<PathBuf>,
    pub socket_paths: Vec<PathBuf>,
}

/// Parse a single HAProxy config file's text into cert and socket paths.
pub fn parse_config(contents: &str) -> HaproxyConfig {
    let mut socket_paths = Vec::new();
    let mut crt_base: Option<String> = None;
    let mut crt_lines = Vec::new();

    for line in contents.lines() {
        let line = line.trim_start_matches([' ', '\t']);
        if line.starts_with('#') {
            continue;
        }
        if let Some(caps) = STATS_SOCKET.captures(line) {
            let path = unquote(&caps[1]);
            if !socket_paths.contains(&path) {
                socket_paths.push(path);
            }
        }
        if crt_base.is_none() {
            if let Some(caps) = CRT_BASE.captures(line) {
                crt_base = Some(unquote(&caps[1]));
            }
        }
        if let Some(caps) = CRT.captures(line) {
            crt_lines.push(unquote(&caps[1]));
        }
    }

    let base = crt_base.unwrap_or_default();
    let mut cert_paths = Vec::new();
    for path in crt_lines {
        let path = if Path::new(&path).is_absolute() {
            PathBuf::from(path)
        } else {
            Path::new(&base).join(path)
        };
        if !cert_paths.contains(&path) {
            cert_paths.push(path);
        }
    }

    HaproxyConfig {
        cert_paths,
        socket_paths: socket_paths.into_iter().map(PathBuf::from).collect(),
    }
}

/// Parse several config files and produce one merged mapping from every
/// certificate path we found to every socket path we found in the same
/// file, matching `parse_haproxy_config`'s one-pair-per-file contract.
pub fn parse_files(paths: &[PathBuf]) -> Vec<(PathBuf, HaproxyConfig)> {
    paths
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok().map(|c| (p.clone(), parse_config(&c))))
        .collect()
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if (s.starts_with('"') && s.ends_with('"') || s.starts_with('\'') && s.ends_with('\'')) && s.len() >= 2 {
        s[1..s.len() - 1].to_string()
    } else {
        s.replace("\\ ", " ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stats_socket_and_crt() {
        let cfg = "global\n\tstats socket /run/haproxy/admin.sock mode 660 level admin\n\
                   frontend fe\n\tbind *:443 crt /etc/ssl/certs/site.pem\n";
        let parsed = parse_config(cfg);
        assert_eq!(parsed.socket_paths, vec![PathBuf::from("/run/haproxy/admin.sock")]);
        assert_eq!(parsed.cert_paths, vec![PathBuf::from("/etc/ssl/certs/site.pem")]);
    }

    #[test]
    fn resolves_relative_crt_against_crt_base() {
        let cfg = "global\n\tcrt-base /etc/ssl/certs\n\
                   frontend fe\n\tbind *:443 crt site.pem\n";
        let parsed = parse_config(cfg);
        assert_eq!(parsed.cert_paths, vec![PathBuf::from("/etc/ssl/certs/site.pem")]);
    }

    #[test]
    fn ignores_comment_lines() {
        let cfg = "# stats socket /should/not/match.sock\nglobal\n\tstats socket /real.sock\n";
        let parsed = parse_config(cfg);
        assert_eq!(parsed.socket_paths, vec![PathBuf::from("/real.sock")]);
    }
}
