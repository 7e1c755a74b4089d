//! Local certificate authority for the VPN endpoint and its clients

use chrono::{Datelike, Duration, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, DnValue, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{EidolonError, Result};

const CA_VALIDITY_DAYS: i64 = 3650;
const SERVER_VALIDITY_DAYS: i64 = 825;
const CLIENT_VALIDITY_DAYS: i64 = 365;

/// Subject fields shared by every issued certificate
#[derive(Debug, Clone)]
pub struct CertificateOptions {
    pub ca_common_name: String,
    pub server_common_name: String,
    pub organization: String,
    pub country: String,
}

/// Identity extracted from a presented certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateIdentity {
    pub serial: Vec<u8>,
    pub common_name: String,
}

impl CertificateIdentity {
    pub fn serial_hex(&self) -> String {
        self.serial.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

pub struct CertificateManager {
    directory: PathBuf,
    options: CertificateOptions,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl CertificateManager {
    /// Load the CA and server certificate from `directory`, creating whichever is missing
    pub fn load_or_create(directory: impl AsRef<Path>, options: CertificateOptions) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let (ca_cert, ca_key) = Self::load_or_create_ca(&directory, &options)?;
        let manager = Self {
            directory,
            options,
            ca_cert,
            ca_key,
        };

        manager.ensure_server_certificate()?;
        Ok(manager)
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.directory.join("ca.crt")
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.directory.join("ca.key")
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.directory.join("server.crt")
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.directory.join("server.key")
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    fn load_or_create_ca(dir: &Path, options: &CertificateOptions) -> Result<(Certificate, KeyPair)> {
        let cert_path = dir.join("ca.crt");
        let key_path = dir.join("ca.key");

        if cert_path.exists() && key_path.exists() {
            let key = KeyPair::from_pem(&fs::read_to_string(&key_path)?)?;
            let params = CertificateParams::from_ca_cert_pem(&fs::read_to_string(&cert_path)?)?;
            // Re-signing the parsed params yields an issuer with the same subject and key
            let cert = params.self_signed(&key)?;
            info!("Loaded CA certificate from {}", cert_path.display());
            return Ok((cert, key));
        }

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        set_subject(&mut params, &options.ca_common_name, options);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        fs::write(&cert_path, cert.pem())?;
        write_private(&key_path, &key.serialize_pem())?;
        info!("Created CA certificate at {}", cert_path.display());

        Ok((cert, key))
    }

    fn ensure_server_certificate(&self) -> Result<()> {
        let cert_path = self.server_cert_path();
        let key_path = self.server_key_path();

        if cert_path.exists() && key_path.exists() {
            return Ok(());
        }

        let cn = &self.options.server_common_name;
        let mut params = CertificateParams::new(vec![cn.clone()])?;
        set_subject(&mut params, cn, &self.options);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.serial_number = Some(random_serial());
        set_validity(&mut params, SERVER_VALIDITY_DAYS);

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;

        fs::write(&cert_path, cert.pem())?;
        write_private(&key_path, &key.serialize_pem())?;
        info!("Created server certificate for {}", cn);
        Ok(())
    }

    /// Issue a client certificate for `username`; returns certificate and key PEM concatenated
    pub fn create_client_certificate(&self, username: &str) -> Result<String> {
        let username = username.trim();
        if username.is_empty() {
            return Err(EidolonError::invalid("Username must not be empty"));
        }

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        set_subject(&mut params, username, &self.options);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.serial_number = Some(random_serial());
        set_validity(&mut params, CLIENT_VALIDITY_DAYS);

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key)?;

        info!("Issued client certificate for {}", username);
        Ok(format!("{}{}", cert.pem(), key.serialize_pem()))
    }
}

/// Serial number and common name of the first certificate in `pem`
pub fn serial_and_common_name(pem: &str) -> Result<CertificateIdentity> {
    let params = CertificateParams::from_ca_cert_pem(pem)?;

    let serial = params
        .serial_number
        .as_ref()
        .map(|s| s.to_bytes())
        .ok_or_else(|| EidolonError::Certificate("certificate has no serial number".to_string()))?;

    let common_name = match params.distinguished_name.get(&DnType::CommonName) {
        Some(DnValue::Utf8String(cn)) => cn.clone(),
        Some(DnValue::PrintableString(cn)) => cn.as_str().to_string(),
        _ => {
            return Err(EidolonError::Certificate(
                "certificate has no common name".to_string(),
            ))
        }
    };

    Ok(CertificateIdentity {
        serial,
        common_name,
    })
}

fn set_subject(params: &mut CertificateParams, common_name: &str, options: &CertificateOptions) {
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, options.organization.as_str());
    params
        .distinguished_name
        .push(DnType::CountryName, options.country.as_str());
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let start = Utc::now() - Duration::days(1);
    let end = Utc::now() + Duration::days(days);
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Positive and without a leading zero byte
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from(bytes.to_vec())
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
