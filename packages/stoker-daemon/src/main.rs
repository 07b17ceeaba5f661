//! stokerd: the stoker supervisor daemon. Loads the configuration, binds
//! the shared listeners, wires the built-in key manager and hands control
//! to the supervisor.

mod roles;

use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::Deserialize;
use stoker::keymgr::{Domain, DomainTable, ServerDomains};
use stoker::runtime::RoleRunners;
use stoker::supervisor::ServerParts;
use stoker::worker::WorkerParts;
use stoker::{Config, Supervisor};

#[derive(Debug, Parser)]
#[command(name = "stokerd", version, about = "Multi-process worker pool supervisor")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of general workers.
    #[arg(short, long)]
    workers: Option<u16>,

    /// Listen address, e.g. 127.0.0.1:8080. Repeatable.
    #[arg(short, long)]
    bind: Vec<String>,

    /// Do not switch workers to the configured runas user.
    #[arg(short = 'r', long)]
    skip_runas: bool,

    /// Do not chroot workers into the root path.
    #[arg(short = 'n', long)]
    skip_chroot: bool,

    /// Increase log verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DomainConfig {
    name: String,
    #[serde(default = "default_true")]
    tls: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    /// Listen addresses shared by every worker.
    listen: Vec<String>,

    /// Directory holding `<domain>.pem` certificate chains for the key
    /// manager.
    certs_dir: Option<PathBuf>,

    /// The worker-pool knobs.
    pool: Config,

    #[serde(rename = "domain")]
    domains: Vec<DomainConfig>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn load_config(args: &Args) -> Result<FileConfig> {
    let Some(path) = &args.config else {
        return Ok(FileConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn build_domains(configs: &[DomainConfig]) -> DomainTable {
    let mut table = DomainTable::new();
    if configs.is_empty() {
        return table;
    }
    table.servers.push(ServerDomains {
        tls: configs.iter().any(|d| d.tls),
        domains: configs.iter().map(|d| Domain::new(d.name.as_str())).collect(),
    });
    table
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let file_cfg = load_config(&args)?;

    let mut pool = file_cfg.pool;
    if let Some(workers) = args.workers {
        pool.worker_count = workers;
    }
    if args.skip_runas {
        pool.skip_runas = true;
    }
    if args.skip_chroot {
        pool.skip_chroot = true;
    }
    if !pool.skip_runas && pool.runas_user.is_none() {
        warn!("no runas user configured, workers keep the invoking uid");
        pool.skip_runas = true;
    }
    if !pool.skip_chroot && pool.root_path.is_none() {
        warn!("no root path configured, workers stay in the working directory");
        pool.skip_chroot = true;
    }

    let bind = if args.bind.is_empty() {
        file_cfg.listen.clone()
    } else {
        args.bind.clone()
    };
    let mut listeners = Vec::new();
    for addr in &bind {
        let listener = TcpListener::bind(addr).with_context(|| format!("binding {addr}"))?;
        info!("listening on {addr}");
        listeners.push(listener);
    }
    if listeners.is_empty() {
        warn!("no listen addresses configured, accept coordination is off");
    }

    let domain_names: Vec<String> = file_cfg.domains.iter().map(|d| d.name.clone()).collect();
    let parts = ServerParts {
        listeners,
        roles: RoleRunners {
            keymgr: Some(roles::keymgr(file_cfg.certs_dir.clone(), domain_names)),
            acme: None,
        },
        worker: WorkerParts {
            domains: build_domains(&file_cfg.domains),
            ..WorkerParts::default()
        },
    };

    let mut supervisor = Supervisor::new(pool, parts)?;
    supervisor.run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_round_trip() {
        let cfg: FileConfig = toml::from_str(
            r#"
            listen = ["127.0.0.1:8080", "127.0.0.1:8443"]
            certs_dir = "/etc/stoker/certs"

            [pool]
            worker_count = 4
            max_connections = 128
            policy = "terminate"

            [[domain]]
            name = "example.com"

            [[domain]]
            name = "plain.example.org"
            tls = false
            "#,
        )
        .expect("config parses");

        assert_eq!(cfg.listen.len(), 2);
        assert_eq!(cfg.pool.worker_count, 4);
        assert_eq!(cfg.pool.max_connections, 128);
        assert_eq!(cfg.pool.policy, stoker::WorkerPolicy::Terminate);
        assert_eq!(cfg.domains.len(), 2);
        assert!(cfg.domains[0].tls);
        assert!(!cfg.domains[1].tls);

        let table = build_domains(&cfg.domains);
        assert_eq!(table.servers.len(), 1);
        assert_eq!(table.servers[0].domains.len(), 2);
    }

    #[test]
    fn missing_config_file_defaults_are_sane() {
        let cfg = FileConfig::default();
        assert!(cfg.listen.is_empty());
        assert_eq!(cfg.pool.worker_count, 0);
        assert!(cfg.domains.is_empty());
    }
}
