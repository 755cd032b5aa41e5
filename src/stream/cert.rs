//! Certificate authority for the intercept path.
//!
//! A self-signed CA is generated on first start and then reused for the
//! lifetime of the deployment (clients install trust once); per-domain
//! leaves are minted on demand and cached on disk. Validity windows are
//! intentionally long; the deployment is ephemeral and trust is manual.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::info;

const CA_KEY_FILE: &str = "ca.key";
const CA_CERT_FILE: &str = "ca.crt";
const CA_COMMON_NAME: &str = "uirelay interception CA";

/// Certificate chain and key for one intercepted domain, ready for a rustls
/// server config.
pub struct LeafIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

pub struct CertificateManager {
    dir: PathBuf,
    ca_key: KeyPair,
    ca_cert: rcgen::Certificate,
    ca_cert_pem: String,
}

impl CertificateManager {
    /// Open (or initialize) the certificate store at `dir`. Existing CA
    /// material is never regenerated.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating certificate store {}", dir.display()))?;

        let key_path = dir.join(CA_KEY_FILE);
        let cert_path = dir.join(CA_CERT_FILE);

        let (ca_key, ca_cert, ca_cert_pem) = if key_path.exists() && cert_path.exists() {
            let key_pem = fs::read_to_string(&key_path).context("reading CA key")?;
            let cert_pem = fs::read_to_string(&cert_path).context("reading CA certificate")?;
            let ca_key = KeyPair::from_pem(&key_pem).context("parsing CA key")?;
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .context("parsing CA certificate")?;
            let ca_cert = params.self_signed(&ca_key).context("rebuilding CA issuer")?;
            info!("Loaded existing interception CA from {}", dir.display());
            (ca_key, ca_cert, cert_pem)
        } else {
            let ca_key = KeyPair::generate().context("generating CA key")?;
            let mut params = CertificateParams::default();
            params
                .distinguished_name
                .push(DnType::CommonName, CA_COMMON_NAME);
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
            let ca_cert = params.self_signed(&ca_key).context("signing CA")?;
            let cert_pem = ca_cert.pem();
            fs::write(&key_path, ca_key.serialize_pem()).context("writing CA key")?;
            fs::write(&cert_path, &cert_pem).context("writing CA certificate")?;
            info!("Generated new interception CA in {}", dir.display());
            (ca_key, ca_cert, cert_pem)
        };

        Ok(CertificateManager {
            dir: dir.to_path_buf(),
            ca_key,
            ca_cert,
            ca_cert_pem,
        })
    }

    /// CA certificate in PEM form, for clients that want to install trust.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Mint (or load) the leaf identity for `domain`. The chain is
    /// `[leaf, ca]` and the leaf carries the exact domain as its SAN.
    pub fn leaf_for(&self, domain: &str) -> Result<LeafIdentity> {
        let stem = file_stem(domain);
        let cert_path = self.dir.join(format!("{stem}.crt"));
        let key_path = self.dir.join(format!("{stem}.key"));

        if cert_path.exists() && key_path.exists() {
            if let Ok(identity) = self.load_leaf(&cert_path, &key_path) {
                return Ok(identity);
            }
            // Unreadable cached leaf: fall through and regenerate. Leaves,
            // unlike the CA, may be re-minted freely.
        }

        let leaf_key = KeyPair::generate().context("generating leaf key")?;
        let mut params = CertificateParams::new(vec![domain.to_string()])
            .with_context(|| format!("leaf params for {domain}"))?;
        params.distinguished_name.push(DnType::CommonName, domain);
        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .with_context(|| format!("signing leaf for {domain}"))?;

        fs::write(&cert_path, leaf.pem()).context("writing leaf certificate")?;
        fs::write(&key_path, leaf_key.serialize_pem()).context("writing leaf key")?;

        Ok(LeafIdentity {
            chain: vec![leaf.der().clone(), self.ca_cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        })
    }

    fn load_leaf(&self, cert_path: &Path, key_path: &Path) -> Result<LeafIdentity> {
        let cert_pem = fs::read(cert_path).context("reading cached leaf certificate")?;
        let key_pem = fs::read(key_path).context("reading cached leaf key")?;

        let mut chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<std::io::Result<Vec<_>>>()
                .context("parsing cached leaf certificate")?;
        chain.push(self.ca_cert.der().clone());

        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .context("parsing cached leaf key")?
            .context("no key in cached leaf key file")?;

        anyhow::ensure!(!chain.is_empty(), "cached leaf file held no certificates");
        Ok(LeafIdentity { chain, key })
    }
}

/// Domain → safe file stem (wildcards never reach here, but be strict).
fn file_stem(domain: &str) -> String {
    domain
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
