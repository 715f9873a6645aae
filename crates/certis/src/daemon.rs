use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use tracing::{error, info, warn};

use crate::auth::{self, Claims};
use crate::config::Settings;
use crate::csv_io;
use crate::db::Db;
use crate::error::{CertisError, ErrorResponse};
use crate::qr::{self, DirQrStore, QrPayload, QrStore};
use crate::types::{
    Certificate, CertificateUpdate, IssueCertificateParams, LoginRequest, NewStudent, NewUser,
    PageQuery, Role, StudentUpdate, TokenResponse, UserUpdate,
};

pub struct App {
    db: Mutex<Db>,
    settings: Settings,
    qr: Box<dyn QrStore>,
}

impl App {
    pub fn new(db: Db, settings: Settings, qr: Box<dyn QrStore>) -> App {
        App {
            db: Mutex::new(db),
            settings,
            qr,
        }
    }

    fn db(&self) -> Result<MutexGuard<'_, Db>, CertisError> {
        self.db
            .lock()
            .map_err(|_| CertisError::Internal("database lock poisoned".to_string()))
    }

    /// Renders the certificate's QR code, stores it, and records its URL.
    fn store_qr(&self, db: &Db, cert: &Certificate) -> Result<Certificate, CertisError> {
        let svg = qr::render_svg(&QrPayload::for_certificate(cert, &self.settings))?;
        let url = self
            .qr
            .put(&qr::file_name(&cert.certificate_number), svg.as_bytes())?;
        db.set_qr_url(cert.id, Some(&url))
    }

    fn store_qr_or_warn(&self, db: &Db, cert: Certificate) -> Certificate {
        match self.store_qr(db, &cert) {
            Ok(updated) => updated,
            Err(e) => {
                warn!(number = %cert.certificate_number, "qr code not stored: {e}");
                cert
            }
        }
    }

    fn remove_qr(&self, certificate_number: &str) {
        if let Err(e) = self.qr.remove(&qr::file_name(certificate_number)) {
            warn!(number = %certificate_number, "failed to remove qr code: {e}");
        }
    }
}

type AppState = Arc<App>;

struct AppError(CertisError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CertisError::NotFound(_) => StatusCode::NOT_FOUND,
            CertisError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CertisError::Duplicate(_) => StatusCode::CONFLICT,
            CertisError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CertisError::Forbidden(_) => StatusCode::FORBIDDEN,
            CertisError::IdentifierExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CertisError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        }
        let body = ErrorResponse::from(&self.0);
        (status, Json(body)).into_response()
    }
}

impl From<CertisError> for AppError {
    fn from(err: CertisError) -> Self {
        AppError(err)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn require_admin(settings: &Settings, headers: &HeaderMap) -> Result<Claims, CertisError> {
    let token = bearer_token(headers)
        .ok_or_else(|| CertisError::Unauthorized("missing bearer token".to_string()))?;
    let claims = auth::verify_token(token, &settings.jwt_secret)?;
    if !claims.is_admin() {
        return Err(CertisError::Forbidden("admin role required".to_string()));
    }
    Ok(claims)
}

/// First `X-Forwarded-For` hop, else the peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map_or_else(|| peer.ip().to_string(), str::to_string)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/admins", get(list_admins))
        .route("/admins/{id}", patch(update_admin).delete(delete_admin))
        .route("/students", get(list_students).post(create_student))
        .route("/students/import", post(import_students))
        .route("/students/export", get(export_students))
        .route(
            "/students/{id}",
            get(get_student).patch(update_student).delete(delete_student),
        )
        .route("/certificates", get(list_certificates).post(issue_certificate))
        .route("/certificates/export", get(export_certificates))
        .route(
            "/certificates/{id}",
            get(get_certificate)
                .patch(update_certificate)
                .delete(delete_certificate),
        )
        .route("/certificates/{id}/revoke", post(revoke_certificate))
        .route("/certificates/{id}/qr", post(regenerate_qr))
        .route("/verify/{*code}", get(verify))
        .route("/qrcodes/{file}", get(serve_qr))
        .route("/dashboard", get(dashboard))
        .route("/backup", get(backup))
        .with_state(state)
}

pub async fn start(settings: Settings) -> Result<(), CertisError> {
    let db = Db::open(&settings)?;
    let store = DirQrStore::open(&settings)?;
    let port = settings.port;
    info!(data_dir = %settings.data_dir.display(), "database opened");
    let state: AppState = Arc::new(App::new(db, settings, Box::new(store)));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| CertisError::Internal(format!("failed to bind port {port}: {e}")))?;

    info!("certis daemon listening on port {port}");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| CertisError::Internal(format!("server error: {e}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl+c handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}

async fn status(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let db = app.db()?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "org_code": app.settings.org_code,
        "users": db.count_users()?,
    })))
}

// --- Auth ---

async fn register(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<NewUser>,
) -> Result<impl IntoResponse, AppError> {
    auth::check_password_strength(&body.password)?;
    let hash = auth::hash_password(&body.password);

    let db = app.db()?;
    if db.count_users()? > 0 {
        require_admin(&app.settings, &headers)?;
    } else {
        // bootstrap account is always an admin
        if body.role.is_some_and(|r| r != Role::Admin) {
            warn!(requested = ?body.role, "first user is always registered as admin");
        }
        body.role = Some(Role::Admin);
        info!("registering first user without a token");
    }
    let user = db.register_user(&body, &hash)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login(
    State(app): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    let credentials = app.db()?.credentials(&body.email)?;
    let user = match credentials {
        Some((user, hash)) if auth::verify_password(&body.password, &hash) => user,
        _ => {
            warn!("failed login attempt");
            return Err(CertisError::Unauthorized("invalid email or password".to_string()).into());
        }
    };

    let (access_token, expires_at) =
        auth::issue_token(&user, &app.settings.jwt_secret, app.settings.token_ttl_hours)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_at,
        user,
    }))
}

// --- Admins ---

async fn list_admins(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let page = app.db()?.list_admins(query)?;
    Ok(Json(page))
}

async fn update_admin(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UserUpdate>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let db = app.db()?;
    db.get_admin(id)?;
    let user = db.update_user(id, &body)?;
    Ok(Json(user))
}

async fn delete_admin(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let claims = require_admin(&app.settings, &headers)?;
    if claims.sub == id {
        return Err(CertisError::Forbidden("cannot delete your own account".to_string()).into());
    }
    let db = app.db()?;
    db.get_admin(id)?;
    let user = db.delete_user(id)?;
    Ok(Json(user))
}

// --- Students ---

async fn list_students(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let students = app.db()?.list_students()?;
    Ok(Json(students))
}

async fn create_student(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<NewStudent>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let student = app.db()?.create_student(&body)?;
    Ok((StatusCode::CREATED, Json(student)))
}

async fn get_student(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let student = app.db()?.get_student(id)?;
    Ok(Json(student))
}

async fn update_student(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<StudentUpdate>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let student = app.db()?.update_student(id, &body)?;
    Ok(Json(student))
}

async fn delete_student(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let removed = app.db()?.delete_student(id)?;
    for cert in &removed {
        app.remove_qr(&cert.certificate_number);
    }
    Ok(Json(serde_json::json!({
        "status": "deleted",
        "certificates_removed": removed.len(),
    })))
}

async fn import_students(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let db = app.db()?;
    let report = csv_io::import_students(&db, body.as_bytes())?;
    Ok(Json(report))
}

fn csv_response(file_name: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        body,
    )
        .into_response()
}

async fn export_students(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_admin(&app.settings, &headers)?;
    let students = app.db()?.backup()?.students;
    Ok(csv_response("students.csv", csv_io::students_csv(&students)?))
}

// --- Certificates ---

async fn list_certificates(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let page = app.db()?.list_certificates(query)?;
    Ok(Json(page))
}

async fn issue_certificate(
    State(app): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IssueCertificateParams>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let db = app.db()?;
    let cert = db.issue_certificate(&body)?;
    let cert = app.store_qr_or_warn(&db, cert);
    Ok((StatusCode::CREATED, Json(cert)))
}

async fn get_certificate(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let cert = app.db()?.get_certificate(id)?;
    Ok(Json(cert))
}

async fn update_certificate(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<CertificateUpdate>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let db = app.db()?;
    let before = db.get_certificate(id)?;
    let mut cert = db.update_certificate(id, &body)?;
    // the QR payload embeds the number and names
    let payload_changed = cert.certificate_number != before.certificate_number
        || cert.student_name != before.student_name
        || cert.course_name != before.course_name;
    if payload_changed {
        if cert.certificate_number != before.certificate_number {
            app.remove_qr(&before.certificate_number);
        }
        cert = app.store_qr_or_warn(&db, cert);
    }
    Ok(Json(cert))
}

async fn revoke_certificate(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let cert = app.db()?.revoke_certificate(id)?;
    Ok(Json(cert))
}

async fn delete_certificate(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let cert = app.db()?.delete_certificate(id)?;
    app.remove_qr(&cert.certificate_number);
    Ok(Json(serde_json::json!({
        "status": "deleted",
        "certificate_number": cert.certificate_number,
    })))
}

async fn regenerate_qr(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let db = app.db()?;
    let cert = db.get_certificate(id)?;
    let cert = app.store_qr(&db, &cert)?;
    Ok(Json(cert))
}

async fn export_certificates(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_admin(&app.settings, &headers)?;
    let certificates = app.db()?.all_certificates()?;
    Ok(csv_response(
        "certificates.csv",
        csv_io::certificates_csv(&certificates)?,
    ))
}

// --- Public ---

async fn verify(
    State(app): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let ip = client_ip(&headers, peer);
    let result = app.db()?.verify(&code, Some(&ip))?;
    info!(code = %code, status = result.status.as_str(), ip = %ip, "verification");
    Ok(Json(result))
}

async fn serve_qr(
    State(app): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, AppError> {
    let bytes = app
        .qr
        .get(&file)?
        .ok_or_else(|| CertisError::not_found("qr code", &file))?;
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], bytes).into_response())
}

// --- Reporting ---

async fn dashboard(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let summary = app.db()?.dashboard()?;
    Ok(Json(summary))
}

async fn backup(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&app.settings, &headers)?;
    let snapshot = app.db()?.backup()?;
    info!(
        students = snapshot.students.len(),
        certificates = snapshot.certificates.len(),
        "backup taken"
    );
    Ok(Json(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_for_wins_over_peer() {
        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, peer), "10.0.0.9");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, peer), "203.0.113.7");
    }

    #[test]
    fn bearer_token_requires_scheme() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }

    #[test]
    fn staff_tokens_are_forbidden() {
        let settings = Settings::for_dir(std::path::Path::new("/tmp"));
        let user = crate::types::User {
            id: 3,
            first_name: "Kofi".into(),
            last_name: "Boateng".into(),
            email: "kofi@example.org".into(),
            phone_number: None,
            responsibility: None,
            year_of_employment: None,
            role: crate::types::Role::Staff,
            staff_id: "SHSL/00/ST/0001".into(),
            created_at: chrono::Utc::now(),
        };
        let (token, _) = auth::issue_token(&user, &settings.jwt_secret, 1).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        assert!(matches!(
            require_admin(&settings, &headers),
            Err(CertisError::Forbidden(_))
        ));
    }
}
