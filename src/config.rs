//! Daemon configuration: a `Config` struct mirroring the CLI option table,
//! loadable from a TOML file (via the `config` crate) layered with
//! `STAPLED_`-prefixed environment variable overrides, plus a small `clap`
//! CLI surface for pointing at a config file and forcing one-off mode.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MINIMUM_VALIDITY: u64 = 7200;
pub const DEFAULT_RENEWAL_THREADS: usize = 2;
pub const DEFAULT_REFRESH_INTERVAL: u64 = 60;
pub const DEFAULT_FILE_EXTENSIONS: &str = "crt,pem,cer";
pub const MAX_RESTART_THREADS: u32 = 3;

#[derive(Debug, Clone, Parser)]
#[command(name = "stapled", about = "Keeps a fresh cache of OCSP staples for certificates on disk")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run a single refresh pass, wait for all queues to drain, then exit.
    #[arg(long)]
    pub one_off: bool,

    /// Verbosity, can be repeated (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_minimum_validity")]
    pub minimum_validity: u64,

    #[serde(default = "default_renewal_threads")]
    pub renewal_threads: usize,

    /// `None` means run the finder exactly once (`one_off` mode).
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: Option<u64>,

    #[serde(default = "default_file_extensions")]
    pub file_extensions: Vec<String>,

    #[serde(default)]
    pub cert_paths: Vec<PathBuf>,

    /// `cert path -> haproxy admin socket path(s)`. Typically produced by
    /// [`crate::haproxy::parse_files`] from `haproxy_config_files`, but can
    /// also be supplied directly for setups without an HAProxy config file.
    #[serde(default)]
    pub haproxy_socket_mapping: HashMap<PathBuf, Vec<PathBuf>>,

    #[serde(default)]
    pub haproxy_config_files: Vec<PathBuf>,

    /// How long (seconds) admin-socket connections ask HAProxy to keep the
    /// CLI session open for (`set timeout cli`).
    #[serde(default = "default_haproxy_socket_keepalive")]
    pub haproxy_socket_keepalive: u64,

    #[serde(default)]
    pub recursive: bool,

    #[serde(default)]
    pub no_recycle: bool,

    #[serde(default)]
    pub ignore: Vec<String>,

    /// Directory uncaught-exception trace files are written to. Defaults to
    /// the platform state/temp directory.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default)]
    pub one_off: bool,
}

fn default_minimum_validity() -> u64 {
    DEFAULT_MINIMUM_VALIDITY
}

fn default_renewal_threads() -> usize {
    DEFAULT_RENEWAL_THREADS
}

fn default_refresh_interval() -> Option<u64> {
    Some(DEFAULT_REFRESH_INTERVAL)
}

fn default_file_extensions() -> Vec<String> {
    DEFAULT_FILE_EXTENSIONS.split(',').map(str::to_string).collect()
}

fn default_haproxy_socket_keepalive() -> u64 {
    86_400
}

fn default_log_dir() -> PathBuf {
    dirs::state_dir()
        .map(|d| d.join("stapled"))
        .unwrap_or_else(std::env::temp_dir)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            minimum_validity: default_minimum_validity(),
            renewal_threads: default_renewal_threads(),
            refresh_interval: default_refresh_interval(),
            file_extensions: default_file_extensions(),
            cert_paths: Vec::new(),
            haproxy_socket_mapping: HashMap::new(),
            haproxy_config_files: Vec::new(),
            haproxy_socket_keepalive: default_haproxy_socket_keepalive(),
            recursive: false,
            no_recycle: false,
            ignore: Vec::new(),
            log_dir: default_log_dir(),
            one_off: false,
        }
    }
}

impl Config {
    /// Load configuration from (in increasing precedence order) built-in
    /// defaults, an optional TOML file, `STAPLED_`-prefixed environment
    /// variables, then the `--one-off` CLI flag.
    pub fn load(cli: &Cli) -> anyhow::Result<Config> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.clone()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STAPLED")
                .separator("__")
                .try_parsing(true),
        );

        let mut cfg: Config = builder.build()?.try_deserialize()?;
        if cli.one_off {
            cfg.one_off = true;
            cfg.refresh_interval = None;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.minimum_validity, 7200);
        assert_eq!(cfg.renewal_threads, 2);
        assert_eq!(cfg.refresh_interval, Some(60));
        assert_eq!(cfg.file_extensions, vec!["crt", "pem", "cer"]);
    }

    #[test]
    fn one_off_cli_flag_disables_refresh_interval() {
        let cli = Cli {
            config: None,
            one_off: true,
            verbosity: 0,
        };
        let cfg = Config::load(&cli).unwrap();
        assert!(cfg.one_off);
        assert_eq!(cfg.refresh_interval, None);
    }
}
