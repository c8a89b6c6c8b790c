/// Node configuration: a TOML file (serde) merged with CLI flags (clap),
/// CLI always winning a conflict. Covers exactly the recognized option list
/// — data directory, RPC listener, gossip bind address, node identity,
/// join addresses, bootstrap flag, ACL file paths (accepted and stored; no
/// policy engine reads them), TLS material for both the server and peer
/// roles, and segment sizing.
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

use crate::tls::TlsPaths;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsFileConfig {
  pub cert: String,
  pub key: String,
  pub ca: Option<String>,
}

impl From<TlsFileConfig> for TlsPaths {
  fn from(file: TlsFileConfig) -> Self {
    TlsPaths {
      cert: file.cert,
      key: file.key,
      ca: file.ca,
    }
  }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SegmentFileConfig {
  pub max_store_bytes: Option<u64>,
  pub max_index_bytes: Option<u64>,
  pub initial_offset: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
  pub data_dir: Option<String>,
  pub rpc_port: Option<u16>,
  pub bind_addr: Option<String>,
  pub node_name: Option<String>,
  pub start_join_addrs: Option<Vec<String>>,
  pub bootstrap: Option<bool>,
  pub acl_model_file: Option<String>,
  pub acl_policy_file: Option<String>,
  pub server_tls: Option<TlsFileConfig>,
  pub peer_tls: Option<TlsFileConfig>,
  pub segment: Option<SegmentFileConfig>,
}

impl FileConfig {
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .with_context(|| format!("reading config file {}", path.display()))?;

    toml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))
  }
}

/// CLI flags. Any value left `None`/empty falls through to the config file,
/// and from there to the hardcoded default.
#[derive(Debug, Parser)]
#[command(name = "proglogd", about = "distributed append-only log node")]
pub struct Cli {
  #[arg(long, env = "PROGLOG_CONFIG")]
  pub config: Option<String>,

  #[arg(long, env = "PROGLOG_DATA_DIR")]
  pub data_dir: Option<String>,

  #[arg(long, env = "PROGLOG_RPC_PORT")]
  pub rpc_port: Option<u16>,

  #[arg(long, env = "PROGLOG_BIND_ADDR")]
  pub bind_addr: Option<String>,

  #[arg(long, env = "PROGLOG_NODE_NAME")]
  pub node_name: Option<String>,

  #[arg(long, value_delimiter = ',', env = "PROGLOG_START_JOIN_ADDRS")]
  pub start_join_addrs: Vec<String>,

  #[arg(long)]
  pub bootstrap: bool,

  #[arg(long)]
  pub acl_model_file: Option<String>,

  #[arg(long)]
  pub acl_policy_file: Option<String>,

  #[arg(long)]
  pub server_tls_cert: Option<String>,
  #[arg(long)]
  pub server_tls_key: Option<String>,
  #[arg(long)]
  pub server_tls_ca: Option<String>,

  #[arg(long)]
  pub peer_tls_cert: Option<String>,
  #[arg(long)]
  pub peer_tls_key: Option<String>,
  #[arg(long)]
  pub peer_tls_ca: Option<String>,

  #[arg(long)]
  pub max_store_bytes: Option<u64>,
  #[arg(long)]
  pub max_index_bytes: Option<u64>,
  #[arg(long)]
  pub initial_offset: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub data_dir: String,
  pub rpc_port: u16,
  pub bind_addr: String,
  pub node_name: String,
  pub start_join_addrs: Vec<String>,
  pub bootstrap: bool,
  pub acl_model_file: Option<String>,
  pub acl_policy_file: Option<String>,
  pub server_tls: Option<TlsPaths>,
  pub peer_tls: Option<TlsPaths>,
  pub segment: crate::log::Config,
}

impl Config {
  pub fn load(cli: Cli) -> Result<Self> {
    let file = match &cli.config {
      Some(path) => FileConfig::load(Path::new(path))?,
      None => FileConfig::default(),
    };

    let data_dir = cli
      .data_dir
      .or(file.data_dir)
      .context("data-dir is required (set --data-dir or data_dir in the config file)")?;

    let segment_file = file.segment.unwrap_or_default();

    let server_tls = cli
      .server_tls_cert
      .zip(cli.server_tls_key)
      .map(|(cert, key)| TlsPaths {
        cert,
        key,
        ca: cli.server_tls_ca,
      })
      .or_else(|| file.server_tls.map(Into::into));

    let peer_tls = cli
      .peer_tls_cert
      .zip(cli.peer_tls_key)
      .map(|(cert, key)| TlsPaths {
        cert,
        key,
        ca: cli.peer_tls_ca,
      })
      .or_else(|| file.peer_tls.map(Into::into));

    Ok(Self {
      data_dir,
      rpc_port: cli.rpc_port.or(file.rpc_port).unwrap_or(8400),
      bind_addr: cli
        .bind_addr
        .or(file.bind_addr)
        .unwrap_or_else(|| "127.0.0.1:8401".to_string()),
      node_name: cli.node_name.or(file.node_name).unwrap_or_else(|| "node".to_string()),
      start_join_addrs: if cli.start_join_addrs.is_empty() {
        file.start_join_addrs.unwrap_or_default()
      } else {
        cli.start_join_addrs
      },
      bootstrap: cli.bootstrap || file.bootstrap.unwrap_or(false),
      acl_model_file: cli.acl_model_file.or(file.acl_model_file),
      acl_policy_file: cli.acl_policy_file.or(file.acl_policy_file),
      server_tls,
      peer_tls,
      segment: crate::log::Config {
        initial_offset: cli.initial_offset.or(segment_file.initial_offset).unwrap_or(0),
        max_store_bytes: cli.max_store_bytes.or(segment_file.max_store_bytes).unwrap_or(1024),
        max_index_bytes: cli.max_index_bytes.or(segment_file.max_index_bytes).unwrap_or(1024),
      },
    })
  }
}
