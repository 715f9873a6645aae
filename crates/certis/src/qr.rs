use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use qrcode::render::svg;
use qrcode::{EcLevel, QrCode};
use serde::Serialize;

use crate::config::Settings;
use crate::error::CertisError;
use crate::types::Certificate;

/// Data encoded into a certificate's QR code.
#[derive(Debug, Clone, Serialize)]
pub struct QrPayload {
    pub student_name: String,
    pub course_name: String,
    pub certificate_number: String,
    pub issued_at: String,
    pub verify_url: String,
}

impl QrPayload {
    pub fn for_certificate(cert: &Certificate, settings: &Settings) -> QrPayload {
        QrPayload {
            student_name: cert.student_name.clone(),
            course_name: cert.course_name.clone(),
            certificate_number: cert.certificate_number.clone(),
            issued_at: cert.issued_on.format("%Y-%m-%d").to_string(),
            verify_url: settings.verify_url(&cert.certificate_number),
        }
    }
}

pub fn render_svg(payload: &QrPayload) -> Result<String, CertisError> {
    let json = serde_json::to_string(payload)
        .map_err(|e| CertisError::Internal(format!("failed to encode qr payload: {e}")))?;
    let code = QrCode::with_error_correction_level(json.as_bytes(), EcLevel::L)
        .map_err(|e| CertisError::Internal(format!("failed to build qr code: {e}")))?;
    Ok(code
        .render::<svg::Color>()
        .min_dimensions(200, 200)
        .quiet_zone(true)
        .build())
}

/// `SHSL/25B/DM/0001` -> `SHSL_25B_DM_0001.svg`
pub fn file_name(certificate_number: &str) -> String {
    format!("{}.svg", certificate_number.replace('/', "_"))
}

/// Where rendered QR images live. `put` returns the public URL of the image.
pub trait QrStore: Send + Sync {
    fn put(&self, name: &str, content: &[u8]) -> Result<String, CertisError>;
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, CertisError>;
    fn remove(&self, name: &str) -> Result<(), CertisError>;
}

pub struct DirQrStore {
    dir: PathBuf,
    base_url: String,
}

impl DirQrStore {
    pub fn open(settings: &Settings) -> Result<DirQrStore, CertisError> {
        let dir = settings.data_dir.join("qrcodes");
        fs::create_dir_all(&dir)
            .map_err(|e| CertisError::Internal(format!("failed to create qr dir: {e}")))?;
        Ok(DirQrStore {
            dir,
            base_url: format!("{}/qrcodes", settings.public_url.trim_end_matches('/')),
        })
    }

    fn path_for(&self, name: &str) -> Option<PathBuf> {
        let valid = name.ends_with(".svg")
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        valid.then(|| self.dir.join(name))
    }
}

impl QrStore for DirQrStore {
    fn put(&self, name: &str, content: &[u8]) -> Result<String, CertisError> {
        let path = self
            .path_for(name)
            .ok_or_else(|| CertisError::InvalidInput(format!("bad qr file name: {name}")))?;
        fs::write(&path, content)
            .map_err(|e| CertisError::Internal(format!("failed to write {}: {e}", path.display())))?;
        Ok(format!("{}/{name}", self.base_url))
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, CertisError> {
        let Some(path) = self.path_for(name) else {
            return Ok(None);
        };
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CertisError::Internal(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn remove(&self, name: &str) -> Result<(), CertisError> {
        let Some(path) = self.path_for(name) else {
            return Ok(());
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CertisError::Internal(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }
}
