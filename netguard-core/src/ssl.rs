//! Data shape produced by the CA pool (`netguard-interceptor::ca`). Kept
//! here, next to the rest of the data model, so plugins and the
//! interceptor agree on one representation without depending on each
//! other. Trimmed from an APISIX-compatible `SslCertificate` shape
//! (an admin-facing CRUD record with an `id`/`status` pair) down to what
//! the CA pool actually produces: a freshly minted leaf plus its root.

/// A minted leaf certificate plus the root that signed it, in DER form,
/// ready to be handed to a TLS server config.
#[derive(Clone)]
pub struct MintedCertificate {
    pub leaf_der: Vec<u8>,
    pub root_der: Vec<u8>,
    pub private_key_der: Vec<u8>,
}
