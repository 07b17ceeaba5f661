//! The built-in reserved-role processes. The key manager keeps certificate
//! custody out of the connection-handling workers: they only ever see the
//! material it pushes over the control channel.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use stoker::keymgr::{ENTROPY_LEN, encode_tls_msg};
use stoker::msg::{ADDR_ALL, ADDR_KEYMGR, Channel, MsgKind};
use stoker::runtime::RoleRunner;
use stoker::signals;
use x509_parser::prelude::*;

const KEYMGR_TICK: Duration = Duration::from_millis(200);

/// The built-in key manager: answers entropy requests and serves
/// `<domain>.pem` chain files from the certs directory.
pub fn keymgr(certs_dir: Option<PathBuf>, domains: Vec<String>) -> RoleRunner {
    Box::new(move |mut channel: Channel| run_keymgr(&mut channel, certs_dir.as_deref(), &domains))
}

fn run_keymgr(channel: &mut Channel, certs_dir: Option<&Path>, domains: &[String]) {
    let mut rng = fastrand::Rng::new();
    info!("key manager started ({} domains)", domains.len());

    // Initial submission so first-boot workers have their certificates;
    // respawned workers ask again with CERTIFICATE_REQ.
    push_certificates(channel, ADDR_ALL, certs_dir, domains);

    loop {
        for frame in channel.drain() {
            match frame.msg_kind() {
                Some(MsgKind::EntropyReq) => {
                    let mut body = [0u8; ENTROPY_LEN];
                    rng.fill(&mut body);
                    channel.send(MsgKind::EntropyResp, ADDR_KEYMGR, frame.src, &body);
                }
                Some(MsgKind::CertificateReq) => {
                    push_certificates(channel, frame.src, certs_dir, domains);
                }
                other => warn!("keymgr ignoring message {other:?}"),
            }
        }

        if signals::shutdown_requested() {
            break;
        }
        channel.flush();
        std::thread::sleep(KEYMGR_TICK);
    }

    info!("key manager shutting down");
}

fn push_certificates(channel: &mut Channel, dst: u16, certs_dir: Option<&Path>, domains: &[String]) {
    let Some(dir) = certs_dir else {
        return;
    };
    for name in domains {
        let path = dir.join(format!("{name}.pem"));
        let blob = match std::fs::read(&path) {
            Ok(blob) => blob,
            Err(e) => {
                warn!("[{name}] cannot read {}: {e}", path.display());
                continue;
            }
        };
        if let Err(e) = validate_chain(&blob) {
            warn!("[{name}] refusing to push {}: {e}", path.display());
            continue;
        }
        match encode_tls_msg(name, &blob) {
            Ok(msg) => {
                channel.send(MsgKind::Certificate, ADDR_KEYMGR, dst, &msg);
                info!("[{name}] certificate chain submitted");
            }
            Err(e) => warn!("[{name}] {e}"),
        }
    }
}

/// A chain the workers cannot load is better caught before it leaves the
/// key manager.
fn validate_chain(blob: &[u8]) -> Result<(), String> {
    let blocks = ::pem::parse_many(blob).map_err(|e| e.to_string())?;
    let mut certs = 0;
    for block in blocks.iter().filter(|b| b.tag() == "CERTIFICATE") {
        parse_x509_certificate(block.contents()).map_err(|e| e.to_string())?;
        certs += 1;
    }
    if certs == 0 {
        return Err("no CERTIFICATE block".to_string());
    }
    Ok(())
}
