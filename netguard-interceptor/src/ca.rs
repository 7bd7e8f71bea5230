//! Host-side certificate authority: mints per-`server_name` leaf
//! certificates on demand so the TLS path (`tls.rs`) can terminate a
//! guest's handshake and inspect the inner HTTP/1.1 traffic.
//!
//! Data shape grounded on `netguard_core::ssl::MintedCertificate`; the
//! root load-or-generate lifecycle and per-name lock follow
//! `ManagedMitmCa::load_or_create`'s naming and root/leaf split.

use dashmap::DashMap;
use netguard_core::ssl::MintedCertificate;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

const ROOT_CN: &str = "Sandbox MITM CA";
const ROOT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);
const LEAF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 3600);

/// In-memory leaf cache plus the root signing material. Leaf minting is
/// serialized behind `mint_lock` — rcgen's `KeyPair::generate` is not
/// free, and two concurrent first-time lookups for the same name racing
/// to populate `cache` would otherwise both pay that cost.
pub struct CertificateAuthority {
    root_key: KeyPair,
    root_cert: Certificate,
    root_der: Vec<u8>,
    cache: DashMap<String, Arc<MintedCertificate>>,
    mint_lock: Mutex<()>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("root_der_len", &self.root_der.len())
            .field("cached_leaves", &self.cache.len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Load `ca.crt`/`ca.key` from `cache_dir` if present, else generate
    /// and persist a fresh 10-year root (`ca.crt` 0644, `ca.key` 0600).
    pub fn load_or_create(cache_dir: &Path) -> anyhow::Result<Self> {
        let cert_path = cache_dir.join("ca.crt");
        let key_path = cache_dir.join("ca.key");

        if cert_path.exists() && key_path.exists() {
            return Self::load(&cert_path, &key_path);
        }

        std::fs::create_dir_all(cache_dir)?;
        let ca = Self::generate()?;
        ca.persist(&cert_path, &key_path)?;
        Ok(ca)
    }

    fn load(cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        let root_key = KeyPair::from_pem(&key_pem)?;
        let root_params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
        let root_cert = root_params.self_signed(&root_key)?;
        let root_der = root_cert.der().to_vec();
        Ok(Self {
            root_key,
            root_cert,
            root_der,
            cache: DashMap::new(),
            mint_lock: Mutex::new(()),
        })
    }

    fn generate() -> anyhow::Result<Self> {
        let root_key = KeyPair::generate()?;
        let mut root_params = CertificateParams::default();
        root_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        root_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        root_params.not_before = SystemTime::now().into();
        root_params.not_after = (SystemTime::now() + ROOT_VALIDITY).into();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_CN);
        root_params.distinguished_name = dn;

        let root_cert = root_params.self_signed(&root_key)?;
        let root_der = root_cert.der().to_vec();

        Ok(Self {
            root_key,
            root_cert,
            root_der,
            cache: DashMap::new(),
            mint_lock: Mutex::new(()),
        })
    }

    fn persist(&self, cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
        use std::fs::Permissions;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut cert_file = std::fs::File::create(cert_path)?;
        cert_file.write_all(self.root_cert.pem().as_bytes())?;
        cert_file.set_permissions(Permissions::from_mode(0o644))?;

        let mut key_file = std::fs::File::create(key_path)?;
        key_file.write_all(self.root_key.serialize_pem().as_bytes())?;
        key_file.set_permissions(Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Mint (or return the cached) leaf certificate for `server_name`.
    pub fn get_certificate(&self, server_name: &str) -> anyhow::Result<Arc<MintedCertificate>> {
        if let Some(existing) = self.cache.get(server_name) {
            return Ok(Arc::clone(&existing));
        }

        let _guard = self.mint_lock.lock().unwrap_or_else(|e| e.into_inner());
        // Re-check: another thread may have minted this name while we waited.
        if let Some(existing) = self.cache.get(server_name) {
            return Ok(Arc::clone(&existing));
        }

        let leaf_key = KeyPair::generate()?;
        let mut leaf_params = CertificateParams::new(vec![server_name.to_string()])?;
        leaf_params.is_ca = IsCa::NoCa;
        leaf_params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        leaf_params.subject_alt_names = vec![SanType::DnsName(server_name.to_string().try_into()?)];
        leaf_params.not_before = SystemTime::now().into();
        leaf_params.not_after = (SystemTime::now() + LEAF_VALIDITY).into();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, server_name);
        leaf_params.distinguished_name = dn;

        let leaf_cert = leaf_params.signed_by(&leaf_key, &self.root_cert, &self.root_key)?;

        let minted = Arc::new(MintedCertificate {
            leaf_der: leaf_cert.der().to_vec(),
            root_der: self.root_der.clone(),
            private_key_der: leaf_key.serialize_der(),
        });
        self.cache.insert(server_name.to_string(), Arc::clone(&minted));
        Ok(minted)
    }

    pub fn root_der(&self) -> &[u8] {
        &self.root_der
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_leaf_with_matching_san() {
        let ca = CertificateAuthority::generate().unwrap();
        let leaf = ca.get_certificate("api.example.com").unwrap();
        assert!(!leaf.leaf_der.is_empty());
        assert_eq!(leaf.root_der, ca.root_der());
    }

    #[test]
    fn repeated_lookup_returns_same_cached_leaf() {
        let ca = CertificateAuthority::generate().unwrap();
        let a = ca.get_certificate("api.example.com").unwrap();
        let b = ca.get_certificate("api.example.com").unwrap();
        assert_eq!(a.leaf_der, b.leaf_der);
    }

    #[test]
    fn different_names_mint_different_leaves() {
        let ca = CertificateAuthority::generate().unwrap();
        let a = ca.get_certificate("a.example.com").unwrap();
        let b = ca.get_certificate("b.example.com").unwrap();
        assert_ne!(a.leaf_der, b.leaf_der);
    }

    #[test]
    fn load_or_create_persists_root_across_reopen() {
        let dir = std::env::temp_dir().join(format!("netguard-ca-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let ca1 = CertificateAuthority::load_or_create(&dir).unwrap();
        let ca2 = CertificateAuthority::load_or_create(&dir).unwrap();
        assert_eq!(ca1.root_der(), ca2.root_der());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
