use std::path::{Path, PathBuf};

use clap::Args;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CertisError;

pub const DEFAULT_PORT: u16 = 7610;
pub const DEFAULT_ORG_CODE: &str = "SHSL";
pub const DEFAULT_BATCH: char = 'B';
pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 12;

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub data_dir: PathBuf,
    pub org_code: String,
    pub batch: char,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub public_url: String,
}

impl Settings {
    /// Defaults rooted at `data_dir`, with a throwaway signing secret.
    pub fn for_dir(data_dir: &Path) -> Settings {
        Settings {
            port: DEFAULT_PORT,
            data_dir: data_dir.to_path_buf(),
            org_code: DEFAULT_ORG_CODE.to_string(),
            batch: DEFAULT_BATCH,
            jwt_secret: random_secret(),
            token_ttl_hours: DEFAULT_TOKEN_TTL_HOURS,
            public_url: format!("http://localhost:{DEFAULT_PORT}"),
        }
    }

    pub fn verify_url(&self, certificate_number: &str) -> String {
        format!(
            "{}/verify/{certificate_number}",
            self.public_url.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Clone, Args)]
pub struct DaemonArgs {
    #[arg(long, env = "CV_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Directory holding the database and stored QR codes.
    #[arg(long, env = "CV_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    #[arg(long, env = "CV_ORG_CODE", default_value = DEFAULT_ORG_CODE)]
    pub org_code: String,
    #[arg(long, env = "CV_BATCH", default_value_t = DEFAULT_BATCH)]
    pub batch: char,
    #[arg(long, env = "CV_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,
    #[arg(long, env = "CV_TOKEN_TTL_HOURS", default_value_t = DEFAULT_TOKEN_TTL_HOURS)]
    pub token_ttl_hours: i64,
    /// Base URL embedded in QR codes and stored QR links.
    #[arg(long, env = "CV_PUBLIC_URL")]
    pub public_url: Option<String>,
}

impl DaemonArgs {
    pub fn into_settings(self, cwd: &Path) -> Result<Settings, CertisError> {
        let org_code = self.org_code.trim().to_ascii_uppercase();
        if org_code.is_empty() || !org_code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CertisError::InvalidInput(format!(
                "org code must be non-empty and alphanumeric, got {:?}",
                self.org_code
            )));
        }
        if !self.batch.is_ascii_alphabetic() {
            return Err(CertisError::InvalidInput(format!(
                "batch must be a single letter, got {:?}",
                self.batch
            )));
        }
        if self.token_ttl_hours <= 0 {
            return Err(CertisError::InvalidInput(
                "token ttl must be positive".to_string(),
            ));
        }

        let jwt_secret = match self.jwt_secret.filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None => {
                warn!("CV_JWT_SECRET not set, tokens will not survive a restart");
                random_secret()
            }
        };

        let data_dir = self.data_dir.unwrap_or_else(|| cwd.join(".certis"));
        let public_url = self.public_url.unwrap_or_else(|| {
            let url = format!("http://localhost:{}", self.port);
            info!("CV_PUBLIC_URL not set, using default: {url}");
            url
        });

        Ok(Settings {
            port: self.port,
            data_dir,
            org_code,
            batch: self.batch.to_ascii_uppercase(),
            jwt_secret,
            token_ttl_hours: self.token_ttl_hours,
            public_url,
        })
    }
}

fn random_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> DaemonArgs {
        DaemonArgs {
            port: 9000,
            data_dir: None,
            org_code: "shsl".into(),
            batch: 'b',
            jwt_secret: Some("s3cret".into()),
            token_ttl_hours: 1,
            public_url: None,
        }
    }

    #[test]
    fn normalizes_codes_and_defaults_paths() {
        let settings = args().into_settings(Path::new("/srv")).unwrap();
        assert_eq!(settings.org_code, "SHSL");
        assert_eq!(settings.batch, 'B');
        assert_eq!(settings.data_dir, PathBuf::from("/srv/.certis"));
        assert_eq!(settings.public_url, "http://localhost:9000");
        assert_eq!(settings.jwt_secret, "s3cret");
    }

    #[test]
    fn rejects_bad_org_code() {
        let mut a = args();
        a.org_code = "SH/SL".into();
        assert!(matches!(
            a.into_settings(Path::new("/srv")),
            Err(CertisError::InvalidInput(_))
        ));
    }

    #[test]
    fn missing_secret_is_generated() {
        let mut a = args();
        a.jwt_secret = None;
        let settings = a.into_settings(Path::new("/srv")).unwrap();
        assert_eq!(settings.jwt_secret.len(), 64);
    }

    #[test]
    fn verify_url_joins_cleanly() {
        let mut settings = Settings::for_dir(Path::new("/tmp"));
        settings.public_url = "https://certs.example.org/".into();
        assert_eq!(
            settings.verify_url("SHSL/25B/DM/0001"),
            "https://certs.example.org/verify/SHSL/25B/DM/0001"
        );
    }
}
