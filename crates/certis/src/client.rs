use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use serde_json::Value;

use crate::error::{CertisError, ErrorResponse};
use crate::types::{
    CertificateUpdate, IssueCertificateParams, NewStudent, NewUser, PageQuery, StudentUpdate,
    UserUpdate,
};

pub const DEFAULT_DAEMON_URL: &str = "http://localhost:7610";

/// The daemon renders errors with their variant prefix; drop it so the
/// rebuilt error does not repeat it.
fn strip(msg: &str, prefix: &str) -> String {
    msg.strip_prefix(prefix).unwrap_or(msg).to_string()
}

pub struct Client {
    http: HttpClient,
    base_url: String,
    token: Option<String>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Client {
    pub fn new(token: Option<String>) -> Self {
        let base_url =
            std::env::var("CV_DAEMON").unwrap_or_else(|_| DEFAULT_DAEMON_URL.to_string());
        Client {
            http: HttpClient::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn check_reachable(&self) -> Result<(), String> {
        match self.http.get(format!("{}/status", self.base_url)).send() {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("daemon returned status {}", resp.status())),
            Err(e) => Err(format!("cannot reach daemon at {}: {}", self.base_url, e)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn parse_error(resp: Response) -> CertisError {
        let status = resp.status();
        let Ok(err_resp) = resp.json::<ErrorResponse>() else {
            return CertisError::Internal(format!("unexpected response from daemon: {status}"));
        };
        error_from_body(err_resp)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn send(&self, req: RequestBuilder) -> Result<Response, CertisError> {
        let resp = self
            .authed(req)
            .send()
            .map_err(|e| CertisError::Internal(e.to_string()))?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(Self::parse_error(resp))
        }
    }

    fn send_json(&self, req: RequestBuilder) -> Result<Value, CertisError> {
        self.send(req)?
            .json()
            .map_err(|e| CertisError::Internal(e.to_string()))
    }

    fn send_text(&self, req: RequestBuilder) -> Result<String, CertisError> {
        self.send(req)?
            .text()
            .map_err(|e| CertisError::Internal(e.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn page_params(query: PageQuery) -> [(&'static str, String); 2] {
        [
            ("page", query.page.to_string()),
            ("limit", query.limit.to_string()),
        ]
    }

    pub fn status(&self) -> Result<Value, CertisError> {
        self.send_json(self.http.get(self.url("/status")))
    }

    // --- Auth ---

    pub fn register(&self, user: &NewUser) -> Result<Value, CertisError> {
        self.send_json(self.http.post(self.url("/auth/register")).json(user))
    }

    pub fn login(&self, email: &str, password: &str) -> Result<Value, CertisError> {
        let body = serde_json::json!({ "email": email, "password": password });
        self.send_json(self.http.post(self.url("/auth/login")).json(&body))
    }

    // --- Students ---

    pub fn create_student(&self, student: &NewStudent) -> Result<Value, CertisError> {
        self.send_json(self.http.post(self.url("/students")).json(student))
    }

    pub fn list_students(&self) -> Result<Value, CertisError> {
        self.send_json(self.http.get(self.url("/students")))
    }

    pub fn get_student(&self, id: i64) -> Result<Value, CertisError> {
        self.send_json(self.http.get(self.url(&format!("/students/{id}"))))
    }

    pub fn update_student(&self, id: i64, fields: &StudentUpdate) -> Result<Value, CertisError> {
        self.send_json(
            self.http
                .patch(self.url(&format!("/students/{id}")))
                .json(fields),
        )
    }

    pub fn delete_student(&self, id: i64) -> Result<Value, CertisError> {
        self.send_json(self.http.delete(self.url(&format!("/students/{id}"))))
    }

    pub fn import_students(&self, csv: String) -> Result<Value, CertisError> {
        self.send_json(
            self.http
                .post(self.url("/students/import"))
                .header(reqwest::header::CONTENT_TYPE, "text/csv")
                .body(csv),
        )
    }

    pub fn export_students(&self) -> Result<String, CertisError> {
        self.send_text(self.http.get(self.url("/students/export")))
    }

    // --- Certificates ---

    pub fn issue_certificate(&self, params: &IssueCertificateParams) -> Result<Value, CertisError> {
        self.send_json(self.http.post(self.url("/certificates")).json(params))
    }

    pub fn list_certificates(&self, query: PageQuery) -> Result<Value, CertisError> {
        self.send_json(
            self.http
                .get(self.url("/certificates"))
                .query(&Self::page_params(query)),
        )
    }

    pub fn get_certificate(&self, id: i64) -> Result<Value, CertisError> {
        self.send_json(self.http.get(self.url(&format!("/certificates/{id}"))))
    }

    pub fn update_certificate(
        &self,
        id: i64,
        fields: &CertificateUpdate,
    ) -> Result<Value, CertisError> {
        self.send_json(
            self.http
                .patch(self.url(&format!("/certificates/{id}")))
                .json(fields),
        )
    }

    pub fn revoke_certificate(&self, id: i64) -> Result<Value, CertisError> {
        self.send_json(
            self.http
                .post(self.url(&format!("/certificates/{id}/revoke"))),
        )
    }

    pub fn delete_certificate(&self, id: i64) -> Result<Value, CertisError> {
        self.send_json(self.http.delete(self.url(&format!("/certificates/{id}"))))
    }

    pub fn regenerate_qr(&self, id: i64) -> Result<Value, CertisError> {
        self.send_json(self.http.post(self.url(&format!("/certificates/{id}/qr"))))
    }

    pub fn export_certificates(&self) -> Result<String, CertisError> {
        self.send_text(self.http.get(self.url("/certificates/export")))
    }

    // --- Admins ---

    pub fn list_admins(&self, query: PageQuery) -> Result<Value, CertisError> {
        self.send_json(
            self.http
                .get(self.url("/admins"))
                .query(&Self::page_params(query)),
        )
    }

    pub fn update_admin(&self, id: i64, fields: &UserUpdate) -> Result<Value, CertisError> {
        self.send_json(self.http.patch(self.url(&format!("/admins/{id}"))).json(fields))
    }

    pub fn delete_admin(&self, id: i64) -> Result<Value, CertisError> {
        self.send_json(self.http.delete(self.url(&format!("/admins/{id}"))))
    }

    // --- Public and reporting ---

    /// Certificate numbers contain slashes and go into the path as-is.
    pub fn verify(&self, code: &str) -> Result<Value, CertisError> {
        self.send_json(self.http.get(self.url(&format!("/verify/{}", code.trim()))))
    }

    pub fn dashboard(&self) -> Result<Value, CertisError> {
        self.send_json(self.http.get(self.url("/dashboard")))
    }

    pub fn backup(&self) -> Result<Value, CertisError> {
        self.send_json(self.http.get(self.url("/backup")))
    }
}

fn error_from_body(err_resp: ErrorResponse) -> CertisError {
    let msg = err_resp.error;
    match err_resp.code.as_deref() {
        Some("not_found") => CertisError::NotFound(msg),
        Some("invalid_input") => CertisError::InvalidInput(strip(&msg, "invalid input: ")),
        Some("duplicate") => CertisError::Duplicate(msg),
        Some("unauthorized") => CertisError::Unauthorized(strip(&msg, "unauthorized: ")),
        Some("forbidden") => CertisError::Forbidden(strip(&msg, "forbidden: ")),
        Some("identifier_exhausted") => exhausted(&msg),
        _ => CertisError::Internal(strip(&msg, "internal error: ")),
    }
}

/// Recovers prefix and attempt count from the daemon's exhaustion message.
fn exhausted(msg: &str) -> CertisError {
    let parsed = msg
        .strip_prefix("unable to generate unique identifier for ")
        .and_then(|rest| rest.split_once(" after "))
        .and_then(|(prefix, rest)| {
            let attempts = rest.split_whitespace().next()?.parse().ok()?;
            Some((prefix.to_string(), attempts))
        });
    match parsed {
        Some((prefix, attempts)) => CertisError::IdentifierExhausted { prefix, attempts },
        None => CertisError::Internal(msg.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(err: &CertisError) -> ErrorResponse {
        ErrorResponse::from(err)
    }

    #[test]
    fn exhaustion_survives_the_wire() {
        let sent = CertisError::IdentifierExhausted {
            prefix: "SHSL/25B/DM".into(),
            attempts: 10,
        };
        let received = error_from_body(body(&sent));
        assert!(matches!(
            &received,
            CertisError::IdentifierExhausted { prefix, attempts: 10 } if prefix == "SHSL/25B/DM"
        ));
        assert_eq!(received.to_string(), sent.to_string());
        assert!(received.to_string().ends_with("try again"));
    }

    #[test]
    fn garbled_exhaustion_message_is_kept_verbatim() {
        let received = error_from_body(ErrorResponse {
            error: "busy".into(),
            code: Some("identifier_exhausted".into()),
        });
        assert!(matches!(received, CertisError::Internal(ref m) if m == "busy"));
    }

    #[test]
    fn prefixed_messages_are_not_doubled() {
        let received = error_from_body(body(&CertisError::Forbidden("admin role required".into())));
        assert_eq!(received.to_string(), "forbidden: admin role required");
        let received = error_from_body(body(&CertisError::not_found("admin", 3)));
        assert_eq!(received.to_string(), "admin not found: 3");
    }
}
