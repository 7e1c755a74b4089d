//! Certificate issuance (CA, server and client certificates)

pub mod manager;

pub use manager::{serial_and_common_name, CertificateIdentity, CertificateManager, CertificateOptions};
