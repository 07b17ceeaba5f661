//! Worker-side handling of key manager responses: strict validation of the
//! fixed wire header, domain resolution across the TLS-enabled servers,
//! and installation of certificate, CRL and ACME-challenge material into
//! per-domain state. Nothing from the key manager is trusted past
//! [`verify_tls_msg`].

use log::{info, warn};
use x509_parser::prelude::*;

use crate::error::KeymgrError;
use crate::msg::MsgKind;

/// Longest domain name carried on the wire; the header field is this plus
/// a mandatory NUL.
pub const DOMAIN_NAME_MAX: usize = 255;

/// `{ domain: [u8; DOMAIN_NAME_MAX + 1], data_len: u32 }`.
pub const TLS_MSG_HEADER_LEN: usize = DOMAIN_NAME_MAX + 1 + 4;

/// Exact entropy payload size; anything else skips the reseed.
pub const ENTROPY_LEN: usize = 1024;

/// Builds the fixed header plus payload for a keymgr push. Used by role
/// runners feeding material to the workers.
pub fn encode_tls_msg(domain: &str, data: &[u8]) -> Result<Vec<u8>, KeymgrError> {
    if domain.len() > DOMAIN_NAME_MAX {
        return Err(KeymgrError::DomainTooLong);
    }
    let mut out = vec![0u8; TLS_MSG_HEADER_LEN + data.len()];
    out[..domain.len()].copy_from_slice(domain.as_bytes());
    let len_field = (data.len() as u32).to_le_bytes();
    out[DOMAIN_NAME_MAX + 1..TLS_MSG_HEADER_LEN].copy_from_slice(&len_field);
    out[TLS_MSG_HEADER_LEN..].copy_from_slice(data);
    Ok(out)
}

/// Validates a keymgr payload and splits it into domain name and data.
/// The total length must equal header plus the declared data length, and
/// the domain field must be NUL-terminated at its maximum index.
pub fn verify_tls_msg(payload: &[u8]) -> Result<(&str, &[u8]), KeymgrError> {
    if payload.len() < TLS_MSG_HEADER_LEN {
        return Err(KeymgrError::Short(payload.len()));
    }

    let mut len_field = [0u8; 4];
    len_field.copy_from_slice(&payload[DOMAIN_NAME_MAX + 1..TLS_MSG_HEADER_LEN]);
    let data_len = u32::from_le_bytes(len_field) as usize;

    if payload.len() != TLS_MSG_HEADER_LEN + data_len {
        return Err(KeymgrError::LengthMismatch {
            declared: TLS_MSG_HEADER_LEN + data_len,
            actual: payload.len(),
        });
    }

    if payload[DOMAIN_NAME_MAX] != 0 {
        return Err(KeymgrError::DomainNotTerminated);
    }

    let name_end = payload[..=DOMAIN_NAME_MAX]
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(DOMAIN_NAME_MAX);
    let domain = std::str::from_utf8(&payload[..name_end])
        .map_err(|_| KeymgrError::DomainNotUtf8)?;

    Ok((domain, &payload[TLS_MSG_HEADER_LEN..]))
}

/// Certificate material as delivered by the key manager.
pub enum CertBlob {
    /// PEM chain, leaf first.
    PemChain(Vec<::pem::Pem>),
    /// Bare DER certificate (the ACME challenge path).
    Der(Vec<u8>),
}

/// Leaf certificate facts for diagnostics and the TLS engine handoff.
pub struct CertInfo {
    pub subject: String,
    pub not_after: i64,
}

/// A domain's installed certificate material. The TLS engine proper lives
/// outside the core; this owns what the handshake layer is handed.
pub struct TlsContext {
    blob: CertBlob,
}

impl TlsContext {
    /// Builds the context from a PEM certificate chain blob.
    pub fn from_pem_chain(data: &[u8]) -> Result<Self, KeymgrError> {
        let blocks = ::pem::parse_many(data).map_err(|e| KeymgrError::BadPem(e.to_string()))?;
        let chain: Vec<::pem::Pem> = blocks
            .into_iter()
            .filter(|block| block.tag() == "CERTIFICATE")
            .collect();
        if chain.is_empty() {
            return Err(KeymgrError::NoCertificate);
        }
        Ok(TlsContext {
            blob: CertBlob::PemChain(chain),
        })
    }

    /// Builds the context from a bare DER certificate.
    pub fn from_der(data: &[u8]) -> Result<Self, KeymgrError> {
        // A certificate is a DER SEQUENCE; anything else is noise.
        if data.first() != Some(&0x30) {
            return Err(KeymgrError::BadDer);
        }
        Ok(TlsContext {
            blob: CertBlob::Der(data.to_vec()),
        })
    }

    pub fn leaf_der(&self) -> &[u8] {
        match &self.blob {
            CertBlob::PemChain(chain) => chain[0].contents(),
            CertBlob::Der(der) => der,
        }
    }

    pub fn chain(&self) -> &CertBlob {
        &self.blob
    }

    /// Decodes the leaf certificate.
    pub fn leaf_info(&self) -> Result<CertInfo, KeymgrError> {
        let (_, cert) = parse_x509_certificate(self.leaf_der())
            .map_err(|e| KeymgrError::CertParse(e.to_string()))?;
        Ok(CertInfo {
            subject: cert.subject().to_string(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }
}

/// Per-domain TLS state, mutated only by the keymgr handlers of the
/// receiving worker.
pub struct Domain {
    pub name: String,
    pub tls: Option<TlsContext>,
    pub crl: Option<Vec<::pem::Pem>>,
    pub acme_cert: Vec<u8>,
    pub acme_challenge: bool,
}

impl Domain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tls: None,
            crl: None,
            acme_cert: Vec::new(),
            acme_challenge: false,
        }
    }
}

/// One listening server's domain list.
pub struct ServerDomains {
    pub tls: bool,
    pub domains: Vec<Domain>,
}

/// Every server's domains, resolved linearly on each keymgr response.
#[derive(Default)]
pub struct DomainTable {
    pub servers: Vec<ServerDomains>,
}

impl DomainTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a domain across the TLS-enabled servers only.
    pub fn find_tls(&mut self, name: &str) -> Option<&mut Domain> {
        self.servers
            .iter_mut()
            .filter(|srv| srv.tls)
            .flat_map(|srv| srv.domains.iter_mut())
            .find(|dom| dom.name == name)
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.servers
            .iter()
            .flat_map(|srv| srv.domains.iter())
            .map(|dom| dom.name.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.servers.clear();
    }
}

/// Extracts the CRL blocks from a PEM blob.
pub fn crl_from_pem(data: &[u8]) -> Result<Vec<::pem::Pem>, KeymgrError> {
    let blocks = ::pem::parse_many(data).map_err(|e| KeymgrError::BadPem(e.to_string()))?;
    let crls: Vec<::pem::Pem> = blocks
        .into_iter()
        .filter(|block| block.tag() == "X509 CRL")
        .collect();
    if crls.is_empty() {
        return Err(KeymgrError::BadPem("no X509 CRL block".into()));
    }
    Ok(crls)
}

/// Installs one keymgr response into the domain table. Malformed input or
/// an unknown domain logs and mutates nothing.
pub fn install_response(table: &mut DomainTable, kind: MsgKind, payload: &[u8]) {
    let (name, data) = match verify_tls_msg(payload) {
        Ok(parts) => parts,
        Err(e) => {
            warn!("rejecting keymgr message: {e}");
            return;
        }
    };

    let Some(domain) = table.find_tls(name) else {
        warn!("got keymgr response for domain that does not exist: {name}");
        return;
    };

    match kind {
        MsgKind::Certificate => match TlsContext::from_pem_chain(data) {
            Ok(ctx) => {
                info!("[{name}] certificate chain installed ({} bytes)", data.len());
                domain.tls = Some(ctx);
            }
            Err(e) => warn!("[{name}] bad certificate chain: {e}"),
        },
        MsgKind::Crl => match crl_from_pem(data) {
            Ok(crls) => {
                info!("[{name}] certificate revocation list installed");
                domain.crl = Some(crls);
            }
            Err(e) => warn!("[{name}] bad crl: {e}"),
        },
        MsgKind::AcmeChallengeSetCert => {
            if domain.tls.is_none() {
                match TlsContext::from_der(data) {
                    Ok(ctx) => domain.tls = Some(ctx),
                    Err(e) => {
                        warn!("[{name}] bad challenge certificate: {e}");
                        return;
                    }
                }
            }
            domain.acme_cert = data.to_vec();
            domain.acme_challenge = true;
            info!("[{name}] tls-alpn-01 challenge active");
        }
        MsgKind::AcmeChallengeClearCert => {
            domain.acme_cert.clear();
            domain.acme_challenge = false;
            info!("[{name}] tls-alpn-01 challenge disabled");
        }
        other => warn!("unexpected keymgr message kind {other:?}"),
    }
}

/// Process-wide randomness pool, reseeded from keymgr entropy responses.
pub struct EntropyPool {
    rng: fastrand::Rng,
    reseeds: u64,
}

impl Default for EntropyPool {
    fn default() -> Self {
        Self::new()
    }
}

impl EntropyPool {
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
            reseeds: 0,
        }
    }

    /// Folds the entire payload into the generator seed.
    pub fn reseed(&mut self, data: &[u8]) {
        let mut seed = self.rng.get_seed();
        for chunk in data.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            seed = seed.rotate_left(7) ^ u64::from_le_bytes(word);
        }
        self.rng.seed(seed);
        self.reseeds += 1;
    }

    pub fn reseeds(&self) -> u64 {
        self.reseeds
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        self.rng.fill(buf);
    }
}

/// Everything the keymgr message handlers touch in a general worker.
pub struct KeymgrState {
    pub domains: DomainTable,
    pub entropy: EntropyPool,
    /// Wall-clock of the last ENTROPY_REQ; zero forces one on the first
    /// loop iteration.
    pub last_entropy_request: u64,
}

impl KeymgrState {
    pub fn new(domains: DomainTable) -> Self {
        Self {
            domains,
            entropy: EntropyPool::new(),
            last_entropy_request: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_domain_table(name: &str, tls: bool) -> DomainTable {
        DomainTable {
            servers: vec![ServerDomains {
                tls,
                domains: vec![Domain::new(name)],
            }],
        }
    }

    fn pem_cert_blob(payload: &[u8]) -> Vec<u8> {
        ::pem::encode(&::pem::Pem::new("CERTIFICATE", payload.to_vec())).into_bytes()
    }

    #[test]
    fn encode_verify_round_trip() {
        let msg = encode_tls_msg("example.com", b"data").expect("encode");
        assert_eq!(msg.len(), TLS_MSG_HEADER_LEN + 4);

        let (name, data) = verify_tls_msg(&msg).expect("verify");
        assert_eq!(name, "example.com");
        assert_eq!(data, b"data");
    }

    #[test]
    fn verify_rejects_short_messages() {
        assert_eq!(
            verify_tls_msg(&[0u8; 8]),
            Err(KeymgrError::Short(8))
        );
    }

    #[test]
    fn verify_rejects_length_mismatch() {
        let mut msg = encode_tls_msg("example.com", b"data").expect("encode");
        msg.push(0xFF);
        assert!(matches!(
            verify_tls_msg(&msg),
            Err(KeymgrError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn verify_rejects_unterminated_domain() {
        let mut msg = encode_tls_msg("example.com", b"").expect("encode");
        msg[DOMAIN_NAME_MAX] = b'x';
        assert_eq!(verify_tls_msg(&msg), Err(KeymgrError::DomainNotTerminated));
    }

    #[test]
    fn rejected_message_mutates_no_domain_state() {
        let mut table = single_domain_table("example.com", true);
        let mut truncated = encode_tls_msg("example.com", b"payload").expect("encode");
        truncated.pop();

        install_response(&mut table, MsgKind::AcmeChallengeSetCert, &truncated);

        let domain = &table.servers[0].domains[0];
        assert!(domain.tls.is_none());
        assert!(domain.acme_cert.is_empty());
        assert!(!domain.acme_challenge);
    }

    #[test]
    fn unknown_domain_is_dropped() {
        let mut table = single_domain_table("example.com", true);
        let msg =
            encode_tls_msg("other.org", &pem_cert_blob(b"leaf")).expect("encode");
        install_response(&mut table, MsgKind::Certificate, &msg);
        assert!(table.servers[0].domains[0].tls.is_none());
    }

    #[test]
    fn non_tls_servers_are_skipped_in_resolution() {
        let mut table = single_domain_table("example.com", false);
        assert!(table.find_tls("example.com").is_none());

        let msg =
            encode_tls_msg("example.com", &pem_cert_blob(b"leaf")).expect("encode");
        install_response(&mut table, MsgKind::Certificate, &msg);
        assert!(table.servers[0].domains[0].tls.is_none());
    }

    #[test]
    fn certificate_installs_pem_chain() {
        let mut table = single_domain_table("example.com", true);
        let msg =
            encode_tls_msg("example.com", &pem_cert_blob(b"leaf-der")).expect("encode");
        install_response(&mut table, MsgKind::Certificate, &msg);

        let domain = &table.servers[0].domains[0];
        let ctx = domain.tls.as_ref().expect("context installed");
        assert_eq!(ctx.leaf_der(), b"leaf-der");
    }

    #[test]
    fn acme_challenge_set_then_clear() {
        let mut table = single_domain_table("example.com", true);
        let der = [0x30, 0x82, 0x01, 0x00, 0xAA, 0xBB];

        let set = encode_tls_msg("example.com", &der).expect("encode");
        install_response(&mut table, MsgKind::AcmeChallengeSetCert, &set);
        {
            let domain = &table.servers[0].domains[0];
            assert!(domain.acme_challenge);
            assert_eq!(domain.acme_cert, der);
            assert!(domain.tls.is_some());
        }

        let clear = encode_tls_msg("example.com", b"").expect("encode");
        install_response(&mut table, MsgKind::AcmeChallengeClearCert, &clear);
        {
            let domain = &table.servers[0].domains[0];
            assert!(!domain.acme_challenge);
            assert!(domain.acme_cert.is_empty());
            // The installed context survives the challenge teardown.
            assert!(domain.tls.is_some());
        }
    }

    #[test]
    fn challenge_cert_must_look_like_der() {
        let mut table = single_domain_table("example.com", true);
        let msg = encode_tls_msg("example.com", b"not a certificate").expect("encode");
        install_response(&mut table, MsgKind::AcmeChallengeSetCert, &msg);

        let domain = &table.servers[0].domains[0];
        assert!(domain.tls.is_none());
        assert!(!domain.acme_challenge);
    }

    #[test]
    fn leaf_info_rejects_garbage_der() {
        let ctx = TlsContext::from_der(&[0x30, 0x03, 0x01, 0x02, 0x03]).expect("blob");
        assert!(ctx.leaf_info().is_err());
    }

    #[test]
    fn entropy_reseed_changes_the_stream() {
        let mut pool = EntropyPool::new();
        assert_eq!(pool.reseeds(), 0);

        let mut before = [0u8; 16];
        pool.fill(&mut before);

        pool.reseed(&[0x5Au8; ENTROPY_LEN]);
        assert_eq!(pool.reseeds(), 1);

        let mut after = [0u8; 16];
        pool.fill(&mut after);
        assert_ne!(before, after);
    }
}
