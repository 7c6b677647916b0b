//! Node configuration: an INI file on disk plus a thin CLI wrapper.
//!
//! The INI parser itself is an external crate; this module is the glue the
//! node needs to actually start from a file on disk: one
//! `[section] key = value` pair at a time, into a flat struct.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::error::{MdvError, MdvResult};

/// `medved --cfg=<path>` (or `-c <path>`).
#[derive(Parser, Debug)]
#[command(name = "medved", about = "MedvedDB node")]
pub struct Cli {
    /// Path to the node's INI configuration file.
    #[arg(short = 'c', long = "cfg")]
    pub cfg: PathBuf,

    /// Override the configured log level for this run.
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerSection {
    pub listen: SocketAddr,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct StorageSection {
    pub path: PathBuf,
    pub workers: usize,
    pub worker_queues: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionSection {
    pub retry_interval: std::time::Duration,
    pub keep_idle: std::time::Duration,
    pub keep_count: u32,
    pub keep_interval: std::time::Duration,
    pub response_timeout: std::time::Duration,
    pub collision_penalty: std::time::Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterSection {
    /// Seed peer addresses, dialed on startup.
    pub nodes: Vec<SocketAddr>,
}

/// `log.level`, one of `f,e,w,i,d,v,n` (fatal, error, warn, info, debug,
/// verbose, none) mapped onto `tracing`'s `LevelFilter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
    None,
}

impl LogLevel {
    fn parse(s: &str) -> MdvResult<Self> {
        Ok(match s {
            "f" => LogLevel::Fatal,
            "e" => LogLevel::Error,
            "w" => LogLevel::Warn,
            "i" => LogLevel::Info,
            "d" => LogLevel::Debug,
            "v" => LogLevel::Verbose,
            "n" => LogLevel::None,
            other => return Err(MdvError::InvalidArg.context(format!("unknown log level '{other}'"))),
        })
    }

    pub fn as_tracing_directive(&self) -> &'static str {
        match self {
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "trace",
            LogLevel::None => "off",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub connection: ConnectionSection,
    pub cluster: ClusterSection,
    pub log_level: LogLevel,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            server: ServerSection {
                listen: "0.0.0.0:6770".parse().unwrap(),
                workers: num_cpus(),
            },
            storage: StorageSection {
                path: PathBuf::from("./medved-data"),
                workers: 4,
                worker_queues: 4,
            },
            connection: ConnectionSection {
                retry_interval: std::time::Duration::from_secs(5),
                keep_idle: std::time::Duration::from_secs(30),
                keep_count: 3,
                keep_interval: std::time::Duration::from_secs(10),
                response_timeout: std::time::Duration::from_secs(15),
                collision_penalty: std::time::Duration::from_millis(500),
            },
            cluster: ClusterSection::default(),
            log_level: LogLevel::Info,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl NodeConfig {
    /// Load from an INI file, falling back to defaults for any field the
    /// file doesn't mention. Mandatory fields (`server.listen`,
    /// `storage.path`) must be present.
    pub fn load(path: &std::path::Path) -> MdvResult<Self> {
        let ini = ini::Ini::load_from_file(path)
            .map_err(|e| MdvError::Failed(format!("can't load '{}': {e}", path.display())))?;

        let mut cfg = NodeConfig::default();
        let mut saw_listen = false;
        let mut saw_storage_path = false;

        if let Some(section) = ini.section(Some("server")) {
            if let Some(v) = section.get("listen") {
                cfg.server.listen = v
                    .parse()
                    .map_err(|_| MdvError::InvalidArg.context(format!("bad server.listen '{v}'")))?;
                saw_listen = true;
            }
            if let Some(v) = section.get("workers") {
                cfg.server.workers = parse_usize(v)?;
            }
        }

        if let Some(section) = ini.section(Some("storage")) {
            if let Some(v) = section.get("path") {
                cfg.storage.path = PathBuf::from(v);
                saw_storage_path = true;
            }
            if let Some(v) = section.get("workers") {
                cfg.storage.workers = parse_usize(v)?;
            }
            if let Some(v) = section.get("worker_queues") {
                cfg.storage.worker_queues = parse_usize(v)?;
            }
        }

        if let Some(section) = ini.section(Some("connection")) {
            if let Some(v) = section.get("retry_interval") {
                cfg.connection.retry_interval = std::time::Duration::from_secs(parse_u64(v)?);
            }
            if let Some(v) = section.get("keep_idle") {
                cfg.connection.keep_idle = std::time::Duration::from_secs(parse_u64(v)?);
            }
            if let Some(v) = section.get("keep_count") {
                cfg.connection.keep_count = parse_usize(v)? as u32;
            }
            if let Some(v) = section.get("keep_interval") {
                cfg.connection.keep_interval = std::time::Duration::from_secs(parse_u64(v)?);
            }
            if let Some(v) = section.get("response_timeout") {
                cfg.connection.response_timeout = std::time::Duration::from_secs(parse_u64(v)?);
            }
            if let Some(v) = section.get("collision_penalty") {
                cfg.connection.collision_penalty = std::time::Duration::from_millis(parse_u64(v)?);
            }
        }

        if let Some(section) = ini.section(Some("cluster")) {
            if let Some(v) = section.get("nodes") {
                cfg.cluster.nodes = v
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse()
                            .map_err(|_| MdvError::InvalidArg.context(format!("bad cluster node address '{s}'")))
                    })
                    .collect::<MdvResult<Vec<_>>>()?;
            }
        }

        if let Some(section) = ini.section(Some("log")) {
            if let Some(v) = section.get("level") {
                cfg.log_level = LogLevel::parse(v)?;
            }
        }

        if !saw_listen || !saw_storage_path {
            return Err(MdvError::InvalidArg.context("mandatory configuration parameters weren't provided"));
        }

        Ok(cfg)
    }
}

fn parse_usize(v: &str) -> MdvResult<usize> {
    v.parse().map_err(|_| MdvError::InvalidArg.context(format!("expected an integer, got '{v}'")))
}

fn parse_u64(v: &str) -> MdvResult<u64> {
    v.parse().map_err(|_| MdvError::InvalidArg.context(format!("expected an integer, got '{v}'")))
}

// Small helper so config errors keep a human-readable message without
// growing the shared `MdvError` enum's variant count.
trait ErrContext {
    fn context(self, msg: impl Into<String>) -> MdvError;
}

impl ErrContext for MdvError {
    fn context(self, msg: impl Into<String>) -> MdvError {
        MdvError::Failed(format!("{self}: {}", msg.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ini(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_mandatory_fields() {
        let f = write_ini(
            "[server]\nlisten = 127.0.0.1:7001\n[storage]\npath = /tmp/mdv\n",
        );
        let cfg = NodeConfig::load(f.path()).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:7001".parse().unwrap());
        assert_eq!(cfg.storage.path, PathBuf::from("/tmp/mdv"));
    }

    #[test]
    fn rejects_missing_mandatory_fields() {
        let f = write_ini("[server]\nworkers = 4\n");
        assert!(NodeConfig::load(f.path()).is_err());
    }

    #[test]
    fn parses_cluster_node_list() {
        let f = write_ini(
            "[server]\nlisten = 127.0.0.1:7001\n[storage]\npath = /tmp/mdv\n[cluster]\nnodes = 127.0.0.1:7002, 127.0.0.1:7003\n",
        );
        let cfg = NodeConfig::load(f.path()).unwrap();
        assert_eq!(cfg.cluster.nodes.len(), 2);
    }
}
