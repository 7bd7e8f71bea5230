pub mod ca;
pub mod interceptor;
pub mod pool;
pub mod tls;
pub mod wire;

pub use ca::CertificateAuthority;
pub use pool::ConnPool;
