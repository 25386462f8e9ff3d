//! Self-signed certificate generation for hosts without a certificate

use std::ffi::{CStr, CString};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use zeroize::Zeroizing;

/// Validity of generated certificates, shared by both generators
const VALIDITY_DAYS: u32 = 7300;

/// Errors that can occur during self-signed cert generation
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Invalid certificate subject '{0}'")]
    InvalidSubject(String),

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Certificate generation failed: {0}")]
    GenerationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces a PEM certificate and private key in a single file.
pub trait CertificateGenerator: Send + Sync {
    fn generate(&self, path: &Path, subject: &str) -> Result<(), GenerateError>;
}

fn validate_subject(subject: &str) -> Result<(), GenerateError> {
    let valid = !subject.is_empty()
        && subject
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(GenerateError::InvalidSubject(subject.to_string()))
    }
}

/// Write `pem` next to `path` with owner-read-only permissions, then move it
/// into place.
fn install_pem(path: &Path, pem: &[u8]) -> Result<(), GenerateError> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(format!(".{}.tmp", std::process::id()));
    let staging = PathBuf::from(staging);

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o400)
            .open(&staging)?;
        file.write_all(pem)?;
        file.sync_all()?;
        std::fs::rename(&staging, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&staging);
    }
    Ok(result?)
}

/// Runs the `openssl req` command to create a self-signed certificate
#[derive(Debug, Clone)]
pub struct OpensslCommand {
    program: PathBuf,
    key_bits: u32,
    validity_days: u32,
}

impl Default for OpensslCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("openssl"),
            key_bits: 2048,
            validity_days: VALIDITY_DAYS,
        }
    }
}

impl OpensslCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    fn args(&self, subject: &str) -> Vec<String> {
        vec![
            "req".to_string(),
            "-x509".to_string(),
            "-nodes".to_string(),
            "-days".to_string(),
            self.validity_days.to_string(),
            "-newkey".to_string(),
            format!("rsa:{}", self.key_bits),
            "-keyout".to_string(),
            "/dev/stdout".to_string(),
            "-out".to_string(),
            "/dev/stdout".to_string(),
            "-subj".to_string(),
            format!("/CN={subject}/"),
        ]
    }
}

impl CertificateGenerator for OpensslCommand {
    fn generate(&self, path: &Path, subject: &str) -> Result<(), GenerateError> {
        validate_subject(subject)?;

        tracing::info!(
            path = %path.display(),
            hostname = %subject,
            "Auto-generating missing certificate"
        );

        let output = Command::new(&self.program)
            .args(self.args(subject))
            .env("PATH", "/usr/bin:/bin")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| GenerateError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        let pem = Zeroizing::new(output.stdout);

        if !output.status.success() {
            return Err(GenerateError::GenerationError(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }
        if pem.is_empty() {
            return Err(GenerateError::GenerationError(format!(
                "{} produced no output",
                self.program.display()
            )));
        }

        install_pem(path, &pem)
    }
}

/// Generates certificates in-process with `rcgen`
#[derive(Debug, Clone, Default)]
pub struct SelfSignedGenerator;

fn validity_window(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    (now, now + Duration::days(i64::from(VALIDITY_DAYS)))
}

impl CertificateGenerator for SelfSignedGenerator {
    fn generate(&self, path: &Path, subject: &str) -> Result<(), GenerateError> {
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

        validate_subject(subject)?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject);
        params.distinguished_name = dn;

        let dns_name = subject.try_into().map_err(|e| {
            GenerateError::GenerationError(format!("Invalid DNS name '{}': {}", subject, e))
        })?;
        params.subject_alt_names = vec![SanType::DnsName(dns_name)];

        let (not_before, not_after) = validity_window(OffsetDateTime::now_utc());
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            GenerateError::GenerationError(format!("Failed to generate key pair: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            GenerateError::GenerationError(format!("Failed to generate certificate: {}", e))
        })?;

        let mut pem = Zeroizing::new(cert.pem().into_bytes());
        pem.extend_from_slice(key_pair.serialize_pem().as_bytes());
        install_pem(path, &pem)?;

        tracing::info!(
            path = %path.display(),
            hostname = %subject,
            "Generated self-signed certificate"
        );
        Ok(())
    }
}

/// Name of this machine, preferring its canonical DNS name.
///
/// The name is normalized like an announced server name, so it is always a
/// usable certificate subject.
pub fn machine_hostname() -> String {
    let name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    subject_for_machine(&canonical_name(&name).unwrap_or(name))
}

fn subject_for_machine(name: &str) -> String {
    let subject = super::normalize_hostname(name);
    if subject.is_empty() {
        "localhost".to_string()
    } else {
        subject
    }
}

fn canonical_name(host: &str) -> Option<String> {
    let host = CString::new(host).ok()?;
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_flags = libc::AI_CANONNAME;
    hints.ai_family = libc::AF_UNSPEC;

    let mut result: *mut libc::addrinfo = std::ptr::null_mut();
    // SAFETY: host and hints outlive the call; result is freed below.
    let rc = unsafe { libc::getaddrinfo(host.as_ptr(), std::ptr::null(), &hints, &mut result) };
    if rc != 0 || result.is_null() {
        return None;
    }

    // SAFETY: result is a valid list returned by getaddrinfo.
    let name = unsafe {
        let canon = (*result).ai_canonname;
        let name = (!canon.is_null())
            .then(|| CStr::from_ptr(canon).to_string_lossy().into_owned())
            .filter(|n| !n.is_empty());
        libc::freeaddrinfo(result);
        name
    };
    name
}
