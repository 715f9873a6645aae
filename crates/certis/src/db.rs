use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::CertisError;
use crate::ident::{self, MAX_ATTEMPTS, Prefix};
use crate::types::{
    Backup, Certificate, CertificateUpdate, DashboardMetrics, DashboardSummary,
    IssueCertificateParams, NewStudent, NewUser, Page, PageQuery, RecentVerification, Role,
    Student, StudentSummary, StudentUpdate, User, UserUpdate, Verification, VerifyStatus,
};

const RECENT_VERIFICATIONS: i64 = 10;

pub struct Db {
    pub conn: Connection,
    pub data_dir: PathBuf,
    org_code: String,
    batch: char,
}

/// Which persisted identifier a sequence belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentKind {
    Certificate,
    Staff,
}

impl IdentKind {
    fn as_str(&self) -> &'static str {
        match self {
            IdentKind::Certificate => "certificate",
            IdentKind::Staff => "staff",
        }
    }

    fn table(&self) -> &'static str {
        match self {
            IdentKind::Certificate => "certificates",
            IdentKind::Staff => "users",
        }
    }

    fn column(&self) -> &'static str {
        match self {
            IdentKind::Certificate => "certificate_number",
            IdentKind::Staff => "staff_id",
        }
    }
}

/// Certificate fields fixed before a number is assigned.
#[derive(Debug, Clone)]
pub(crate) struct CertificateRow {
    pub student_id: Option<i64>,
    pub student_name: String,
    pub course_name: String,
    pub course_code: String,
    pub issued_on: NaiveDate,
    pub year_of_study: Option<String>,
    pub course_summary: Option<String>,
}

fn conversion_error(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, msg.into())
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(format!("bad timestamp {s:?}: {e}")))
}

fn parse_day(s: &str) -> Result<NaiveDate, rusqlite::Error> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| conversion_error(format!("bad date {s:?}: {e}")))
}

fn format_day(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub(crate) fn student_from_row(row: &rusqlite::Row) -> Result<Student, rusqlite::Error> {
    let start: Option<String> = row.get("program_start_date")?;
    let end: Option<String> = row.get("program_end_date")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Student {
        id: row.get("id")?,
        first_name: row.get("first_name")?,
        last_name: row.get("last_name")?,
        email: row.get("email")?,
        phone_number: row.get("phone_number")?,
        course_name: row.get("course_name")?,
        year_of_study: row.get("year_of_study")?,
        program_start_date: start.as_deref().map(parse_day).transpose()?,
        program_end_date: end.as_deref().map(parse_day).transpose()?,
        photo_url: row.get("photo_url")?,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

pub(crate) fn certificate_from_row(row: &rusqlite::Row) -> Result<Certificate, rusqlite::Error> {
    let issued_on: String = row.get("issued_on")?;
    let created_at: String = row.get("created_at")?;

    Ok(Certificate {
        id: row.get("id")?,
        student_id: row.get("student_id")?,
        student_name: row.get("student_name")?,
        course_name: row.get("course_name")?,
        course_code: row.get("course_code")?,
        certificate_number: row.get("certificate_number")?,
        issued_on: parse_day(&issued_on)?,
        year_of_study: row.get("year_of_study")?,
        course_summary: row.get("course_summary")?,
        qr_code_url: row.get("qr_code_url")?,
        is_active: row.get("is_active")?,
        created_at: parse_dt(&created_at)?,
    })
}

pub(crate) fn user_from_row(row: &rusqlite::Row) -> Result<User, rusqlite::Error> {
    let role: String = row.get("role")?;
    let created_at: String = row.get("created_at")?;

    Ok(User {
        id: row.get("id")?,
        first_name: row.get("first_name")?,
        last_name: row.get("last_name")?,
        email: row.get("email")?,
        phone_number: row.get("phone_number")?,
        responsibility: row.get("responsibility")?,
        year_of_employment: row.get("year_of_employment")?,
        role: role.parse().map_err(conversion_error)?,
        staff_id: row.get("staff_id")?,
        created_at: parse_dt(&created_at)?,
    })
}

/// UNIQUE violation on `table.column`.
fn is_unique_violation(err: &rusqlite::Error, table: &str, column: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                && msg.contains(&format!("{table}.{column}"))
        }
        _ => false,
    }
}

fn write_error(context: &str, err: rusqlite::Error) -> CertisError {
    if is_unique_violation(&err, "students", "email") || is_unique_violation(&err, "users", "email")
    {
        return CertisError::Duplicate("email is already in use".to_string());
    }
    CertisError::Internal(format!("{context}: {err}"))
}

fn internal(context: &str) -> impl Fn(rusqlite::Error) -> CertisError + '_ {
    move |e| CertisError::Internal(format!("{context}: {e}"))
}

fn required(field: &str, value: &str) -> Result<String, CertisError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CertisError::InvalidInput(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn valid_email(value: &str) -> Result<String, CertisError> {
    let email = required("email", value)?.to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(CertisError::InvalidInput(format!("invalid email: {value}"))),
    }
}

/// Blank strings become `None`.
fn optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_date_field(field: &str, value: Option<&str>) -> Result<Option<NaiveDate>, CertisError> {
    match optional(value) {
        None => Ok(None),
        Some(v) => NaiveDate::parse_from_str(&v, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| CertisError::InvalidInput(format!("invalid {field} format, use YYYY-MM-DD"))),
    }
}

fn text_or_null(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::Text)
}

impl Db {
    pub fn open(settings: &Settings) -> Result<Db, CertisError> {
        let data_dir = settings.data_dir.clone();
        fs::create_dir_all(&data_dir)
            .map_err(|e| CertisError::Internal(format!("failed to create data dir: {e}")))?;

        let db_path = data_dir.join("db.sqlite");
        let conn = Connection::open(&db_path)
            .map_err(|e| CertisError::Internal(format!("failed to open database: {e}")))?;

        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| CertisError::Internal(format!("failed to set busy_timeout: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| CertisError::Internal(format!("failed to enable foreign_keys: {e}")))?;

        Self::run_migrations(&conn)?;

        Ok(Db {
            conn,
            data_dir,
            org_code: settings.org_code.clone(),
            batch: settings.batch,
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), CertisError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS students (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                first_name         TEXT NOT NULL,
                last_name          TEXT NOT NULL,
                email              TEXT NOT NULL UNIQUE,
                phone_number       TEXT,
                course_name        TEXT NOT NULL,
                year_of_study      TEXT,
                program_start_date TEXT,
                program_end_date   TEXT,
                photo_url          TEXT,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS certificates (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id         INTEGER REFERENCES students(id) ON DELETE CASCADE,
                student_name       TEXT NOT NULL,
                course_name        TEXT NOT NULL,
                course_code        TEXT NOT NULL,
                certificate_number TEXT NOT NULL UNIQUE,
                issued_on          TEXT NOT NULL,
                year_of_study      TEXT,
                course_summary     TEXT,
                qr_code_url        TEXT,
                is_active          INTEGER NOT NULL DEFAULT 1,
                created_at         TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                first_name         TEXT NOT NULL,
                last_name          TEXT NOT NULL,
                email              TEXT NOT NULL UNIQUE,
                phone_number       TEXT,
                responsibility     TEXT,
                year_of_employment TEXT,
                role               TEXT NOT NULL DEFAULT 'admin' CHECK (role IN ('admin', 'staff', 'employer')),
                staff_id           TEXT NOT NULL UNIQUE,
                password_hash      TEXT NOT NULL,
                created_at         TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS verification_logs (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                certificate_id INTEGER REFERENCES certificates(id) ON DELETE SET NULL,
                code           TEXT NOT NULL,
                verified_at    TEXT NOT NULL,
                ip_address     TEXT,
                status         TEXT NOT NULL CHECK (status IN ('valid', 'invalid', 'revoked'))
            );

            CREATE TABLE IF NOT EXISTS retired_identifiers (
                identifier TEXT PRIMARY KEY,
                kind       TEXT NOT NULL CHECK (kind IN ('certificate', 'staff')),
                retired_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_certificates_student ON certificates(student_id);
            CREATE INDEX IF NOT EXISTS idx_verification_logs_time ON verification_logs(verified_at);",
        )
        .map_err(|e| CertisError::Internal(format!("migration failed: {e}")))?;

        Ok(())
    }

    // --- Identifiers ---

    /// Next candidate for `prefix`: one past the highest live or retired sequence.
    pub fn next_identifier(&self, kind: IdentKind, prefix: &Prefix) -> Result<String, CertisError> {
        let head = format!("{prefix}/");
        let sql = format!(
            "SELECT {col} FROM {table} WHERE substr({col}, 1, ?2) = ?1
             UNION ALL
             SELECT identifier FROM retired_identifiers WHERE kind = ?3 AND substr(identifier, 1, ?2) = ?1",
            col = kind.column(),
            table = kind.table(),
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(internal("failed to prepare identifier scan"))?;
        let existing = stmt
            .query_map(
                rusqlite::params![head, head.chars().count() as i64, kind.as_str()],
                |row| row.get::<_, String>(0),
            )
            .map_err(internal("failed to scan identifiers"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read identifiers"))?;

        Ok(prefix.next_identifier(existing.iter().map(String::as_str)))
    }

    /// Runs `attempt` with fresh candidates until it persists one without a
    /// UNIQUE collision on the identifier column.
    pub(crate) fn with_unique_identifier<T, F>(
        &self,
        kind: IdentKind,
        prefix: &Prefix,
        mut attempt: F,
    ) -> Result<T, CertisError>
    where
        F: FnMut(&str) -> Result<T, rusqlite::Error>,
    {
        for n in 1..=MAX_ATTEMPTS {
            let candidate = self.next_identifier(kind, prefix)?;
            match attempt(&candidate) {
                Ok(value) => return Ok(value),
                Err(e) if is_unique_violation(&e, kind.table(), kind.column()) => {
                    warn!(%prefix, %candidate, attempt = n, "identifier collision, retrying");
                }
                Err(e) => return Err(write_error("failed to persist identifier", e)),
            }
        }
        Err(CertisError::IdentifierExhausted {
            prefix: prefix.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }

    fn retire(
        conn: &Connection,
        kind: IdentKind,
        identifier: &str,
        ts: &str,
    ) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT OR IGNORE INTO retired_identifiers (identifier, kind, retired_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![identifier, kind.as_str(), ts],
        )?;
        Ok(())
    }

    pub fn certificate_prefix(&self, issued_on: NaiveDate, course_code: &str) -> Prefix {
        Prefix::certificate(&self.org_code, issued_on.year(), self.batch, Some(course_code))
    }

    pub fn staff_prefix(&self, year_of_employment: Option<&str>, role: Role) -> Prefix {
        Prefix::staff(&self.org_code, year_of_employment, Some(role.as_str()))
    }

    // --- Students ---

    pub fn create_student(&self, new: &NewStudent) -> Result<Student, CertisError> {
        let first_name = required("first_name", &new.first_name)?;
        let last_name = required("last_name", &new.last_name)?;
        let email = valid_email(&new.email)?;
        let course_name = required("course_name", &new.course_name)?;
        let start = parse_date_field("program_start_date", new.program_start_date.as_deref())?;
        let end = parse_date_field("program_end_date", new.program_end_date.as_deref())?;

        if let Some(existing) = self.find_student_by_email(&email)? {
            return Err(CertisError::Duplicate(format!(
                "student with email {email} already exists (id {})",
                existing.id
            )));
        }

        let ts = now();
        self.conn
            .execute(
                "INSERT INTO students (first_name, last_name, email, phone_number, course_name, year_of_study,
                                       program_start_date, program_end_date, photo_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    first_name,
                    last_name,
                    email,
                    optional(new.phone_number.as_deref()),
                    course_name,
                    optional(new.year_of_study.as_deref()),
                    start.map(format_day),
                    end.map(format_day),
                    optional(new.photo_url.as_deref()),
                    ts,
                    ts,
                ],
            )
            .map_err(|e| write_error("failed to create student", e))?;

        let id = self.conn.last_insert_rowid();
        info!(student_id = id, "student created");
        self.get_student(id)
    }

    pub fn get_student(&self, id: i64) -> Result<Student, CertisError> {
        self.conn
            .query_row(
                "SELECT * FROM students WHERE id = ?1",
                rusqlite::params![id],
                student_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => CertisError::not_found("student", id),
                other => CertisError::Internal(format!("failed to get student: {other}")),
            })
    }

    pub fn find_student_by_email(&self, email: &str) -> Result<Option<Student>, CertisError> {
        self.conn
            .query_row(
                "SELECT * FROM students WHERE email = ?1",
                rusqlite::params![email.trim().to_ascii_lowercase()],
                student_from_row,
            )
            .optional()
            .map_err(internal("failed to look up student"))
    }

    /// All students, newest first, with their certification status.
    pub fn list_students(&self) -> Result<Vec<StudentSummary>, CertisError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT s.*, (SELECT COUNT(*) FROM certificates c WHERE c.student_id = s.id) AS certificate_count
                 FROM students s
                 ORDER BY s.created_at DESC, s.id DESC",
            )
            .map_err(internal("failed to prepare student list"))?;
        stmt.query_map([], |row| {
            let certificate_count: i64 = row.get("certificate_count")?;
            Ok(StudentSummary {
                student: student_from_row(row)?,
                certified: certificate_count > 0,
                certificate_count,
            })
        })
        .map_err(internal("failed to list students"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(internal("failed to read students"))
    }

    pub fn update_student(&self, id: i64, fields: &StudentUpdate) -> Result<Student, CertisError> {
        self.get_student(id)?;

        let mut set_clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(v) = &fields.first_name {
            set_clauses.push("first_name = ?");
            values.push(Value::Text(required("first_name", v)?));
        }
        if let Some(v) = &fields.last_name {
            set_clauses.push("last_name = ?");
            values.push(Value::Text(required("last_name", v)?));
        }
        if let Some(v) = &fields.email {
            let email = valid_email(v)?;
            if let Some(other) = self.find_student_by_email(&email)?
                && other.id != id
            {
                return Err(CertisError::Duplicate(format!(
                    "student with email {email} already exists (id {})",
                    other.id
                )));
            }
            set_clauses.push("email = ?");
            values.push(Value::Text(email));
        }
        if let Some(v) = &fields.course_name {
            set_clauses.push("course_name = ?");
            values.push(Value::Text(required("course_name", v)?));
        }
        if let Some(v) = &fields.phone_number {
            set_clauses.push("phone_number = ?");
            values.push(text_or_null(optional(Some(v))));
        }
        if let Some(v) = &fields.year_of_study {
            set_clauses.push("year_of_study = ?");
            values.push(text_or_null(optional(Some(v))));
        }
        if let Some(v) = &fields.program_start_date {
            set_clauses.push("program_start_date = ?");
            let day = parse_date_field("program_start_date", Some(v))?;
            values.push(text_or_null(day.map(format_day)));
        }
        if let Some(v) = &fields.program_end_date {
            set_clauses.push("program_end_date = ?");
            let day = parse_date_field("program_end_date", Some(v))?;
            values.push(text_or_null(day.map(format_day)));
        }
        if let Some(v) = &fields.photo_url {
            set_clauses.push("photo_url = ?");
            values.push(text_or_null(optional(Some(v))));
        }

        set_clauses.push("updated_at = ?");
        values.push(Value::Text(now()));
        values.push(Value::Integer(id));

        let sql = format!("UPDATE students SET {} WHERE id = ?", set_clauses.join(", "));
        self.conn
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(|e| write_error("failed to update student", e))?;

        self.get_student(id)
    }

    /// Deletes the student and their certificates; returns the removed certificates.
    pub fn delete_student(&self, id: i64) -> Result<Vec<Certificate>, CertisError> {
        self.get_student(id)?;
        let removed = self.certificates_for_student(id)?;

        let ts = now();
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(internal("failed to begin transaction"))?;
        for cert in &removed {
            Self::retire(&tx, IdentKind::Certificate, &cert.certificate_number, &ts)
                .map_err(internal("failed to retire certificate number"))?;
        }
        tx.execute("DELETE FROM students WHERE id = ?1", rusqlite::params![id])
            .map_err(internal("failed to delete student"))?;
        tx.commit().map_err(internal("failed to commit delete"))?;

        info!(student_id = id, certificates = removed.len(), "student deleted");
        Ok(removed)
    }

    pub fn certificates_for_student(&self, student_id: i64) -> Result<Vec<Certificate>, CertisError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM certificates WHERE student_id = ?1 ORDER BY id")
            .map_err(internal("failed to prepare certificate query"))?;
        stmt.query_map(rusqlite::params![student_id], certificate_from_row)
            .map_err(internal("failed to query certificates"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read certificates"))
    }

    // --- Certificates ---

    pub(crate) fn insert_certificate_row(
        &self,
        row: &CertificateRow,
        number: &str,
    ) -> Result<i64, rusqlite::Error> {
        self.conn.execute(
            "INSERT INTO certificates (student_id, student_name, course_name, course_code, certificate_number,
                                       issued_on, year_of_study, course_summary, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)",
            rusqlite::params![
                row.student_id,
                row.student_name,
                row.course_name,
                row.course_code,
                number,
                format_day(row.issued_on),
                row.year_of_study,
                row.course_summary,
                now(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn issue_certificate(&self, params: &IssueCertificateParams) -> Result<Certificate, CertisError> {
        let student = params.student_id.map(|id| self.get_student(id)).transpose()?;

        let student_name = optional(params.student_name.as_deref())
            .or_else(|| student.as_ref().map(Student::full_name))
            .ok_or_else(|| {
                CertisError::InvalidInput("student_name or student_id is required".to_string())
            })?;
        let course_name = optional(params.course_name.as_deref())
            .or_else(|| student.as_ref().map(|s| s.course_name.clone()))
            .ok_or_else(|| {
                CertisError::InvalidInput("course_name or student_id is required".to_string())
            })?;
        let year_of_study = optional(params.year_of_study.as_deref())
            .or_else(|| student.as_ref().and_then(|s| s.year_of_study.clone()));

        let row = CertificateRow {
            student_id: student.as_ref().map(|s| s.id),
            student_name,
            course_name,
            course_code: ident::course_code(params.course_code.as_deref()),
            issued_on: params.issued_on.unwrap_or_else(|| Utc::now().date_naive()),
            year_of_study,
            course_summary: optional(params.course_summary.as_deref()),
        };

        let prefix = self.certificate_prefix(row.issued_on, &row.course_code);
        let id = self.with_unique_identifier(IdentKind::Certificate, &prefix, |number| {
            self.insert_certificate_row(&row, number)
        })?;

        let cert = self.get_certificate(id)?;
        info!(certificate_id = id, number = %cert.certificate_number, "certificate issued");
        Ok(cert)
    }

    pub fn get_certificate(&self, id: i64) -> Result<Certificate, CertisError> {
        self.conn
            .query_row(
                "SELECT * FROM certificates WHERE id = ?1",
                rusqlite::params![id],
                certificate_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => CertisError::not_found("certificate", id),
                other => CertisError::Internal(format!("failed to get certificate: {other}")),
            })
    }

    pub fn find_certificate_by_number(&self, number: &str) -> Result<Option<Certificate>, CertisError> {
        self.conn
            .query_row(
                "SELECT * FROM certificates WHERE certificate_number = ?1",
                rusqlite::params![number],
                certificate_from_row,
            )
            .optional()
            .map_err(internal("failed to look up certificate"))
    }

    /// Newest issue date first.
    pub fn list_certificates(&self, query: PageQuery) -> Result<Page<Certificate>, CertisError> {
        let query = query.normalized();
        let total = self.count("SELECT COUNT(*) FROM certificates")?;
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM certificates ORDER BY issued_on DESC, id DESC LIMIT ?1 OFFSET ?2")
            .map_err(internal("failed to prepare certificate list"))?;
        let items = stmt
            .query_map(
                rusqlite::params![i64::from(query.limit), query.offset()],
                certificate_from_row,
            )
            .map_err(internal("failed to list certificates"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read certificates"))?;
        Ok(Page::new(items, query, total))
    }

    pub fn all_certificates(&self) -> Result<Vec<Certificate>, CertisError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM certificates ORDER BY id")
            .map_err(internal("failed to prepare certificate export"))?;
        stmt.query_map([], certificate_from_row)
            .map_err(internal("failed to query certificates"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read certificates"))
    }

    pub fn set_qr_url(&self, id: i64, url: Option<&str>) -> Result<Certificate, CertisError> {
        let changed = self
            .conn
            .execute(
                "UPDATE certificates SET qr_code_url = ?1 WHERE id = ?2",
                rusqlite::params![url, id],
            )
            .map_err(internal("failed to store qr url"))?;
        if changed == 0 {
            return Err(CertisError::not_found("certificate", id));
        }
        self.get_certificate(id)
    }

    /// Applies descriptive edits. A course code that lands in a different
    /// prefix re-numbers the certificate and retires the old number.
    pub fn update_certificate(
        &self,
        id: i64,
        fields: &CertificateUpdate,
    ) -> Result<Certificate, CertisError> {
        let current = self.get_certificate(id)?;

        let mut set_clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(v) = &fields.student_name {
            set_clauses.push("student_name = ?");
            values.push(Value::Text(required("student_name", v)?));
        }
        if let Some(v) = &fields.course_name {
            set_clauses.push("course_name = ?");
            values.push(Value::Text(required("course_name", v)?));
        }
        if let Some(v) = &fields.year_of_study {
            set_clauses.push("year_of_study = ?");
            values.push(text_or_null(optional(Some(v))));
        }
        if let Some(v) = &fields.course_summary {
            set_clauses.push("course_summary = ?");
            values.push(text_or_null(optional(Some(v))));
        }

        let apply_fields = |conn: &Connection| -> Result<(), rusqlite::Error> {
            if set_clauses.is_empty() {
                return Ok(());
            }
            let sql = format!("UPDATE certificates SET {} WHERE id = ?", set_clauses.join(", "));
            let params = values.iter().cloned().chain([Value::Integer(id)]);
            conn.execute(&sql, rusqlite::params_from_iter(params))?;
            Ok(())
        };

        let renumber = fields
            .course_code
            .as_deref()
            .map(|code| ident::course_code(Some(code)))
            .map(|code| (self.certificate_prefix(current.issued_on, &code), code))
            .filter(|(prefix, _)| {
                *prefix != self.certificate_prefix(current.issued_on, &current.course_code)
            });

        match renumber {
            Some((prefix, course_code)) => {
                // field edits share the renumbering transaction
                let number = self.with_unique_identifier(IdentKind::Certificate, &prefix, |number| {
                    let tx = self.conn.unchecked_transaction()?;
                    apply_fields(&tx)?;
                    tx.execute(
                        "UPDATE certificates SET certificate_number = ?1, course_code = ?2 WHERE id = ?3",
                        rusqlite::params![number, course_code, id],
                    )?;
                    Self::retire(&tx, IdentKind::Certificate, &current.certificate_number, &now())?;
                    tx.commit()?;
                    Ok(number.to_string())
                })?;
                info!(
                    certificate_id = id,
                    old = %current.certificate_number,
                    new = %number,
                    "certificate renumbered"
                );
            }
            None => apply_fields(&self.conn)
                .map_err(|e| write_error("failed to update certificate", e))?,
        }

        self.get_certificate(id)
    }

    pub fn revoke_certificate(&self, id: i64) -> Result<Certificate, CertisError> {
        let changed = self
            .conn
            .execute(
                "UPDATE certificates SET is_active = 0 WHERE id = ?1",
                rusqlite::params![id],
            )
            .map_err(internal("failed to revoke certificate"))?;
        if changed == 0 {
            return Err(CertisError::not_found("certificate", id));
        }
        info!(certificate_id = id, "certificate revoked");
        self.get_certificate(id)
    }

    pub fn delete_certificate(&self, id: i64) -> Result<Certificate, CertisError> {
        let cert = self.get_certificate(id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(internal("failed to begin transaction"))?;
        Self::retire(&tx, IdentKind::Certificate, &cert.certificate_number, &now())
            .map_err(internal("failed to retire certificate number"))?;
        tx.execute("DELETE FROM certificates WHERE id = ?1", rusqlite::params![id])
            .map_err(internal("failed to delete certificate"))?;
        tx.commit().map_err(internal("failed to commit delete"))?;

        info!(certificate_id = id, number = %cert.certificate_number, "certificate deleted");
        Ok(cert)
    }

    // --- Verification ---

    /// Looks up `code` and records the attempt.
    pub fn verify(&self, code: &str, ip_address: Option<&str>) -> Result<Verification, CertisError> {
        let code = code.trim();
        let cert = self.find_certificate_by_number(code)?;
        let status = match &cert {
            Some(c) if c.is_active => VerifyStatus::Valid,
            Some(_) => VerifyStatus::Revoked,
            None => VerifyStatus::Invalid,
        };

        self.conn
            .execute(
                "INSERT INTO verification_logs (certificate_id, code, verified_at, ip_address, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    cert.as_ref().map(|c| c.id),
                    code,
                    now(),
                    ip_address,
                    status.as_str(),
                ],
            )
            .map_err(internal("failed to log verification"))?;

        let message = match status {
            VerifyStatus::Valid => None,
            VerifyStatus::Revoked => Some("certificate has been revoked".to_string()),
            VerifyStatus::Invalid => Some("certificate not found".to_string()),
        };
        Ok(Verification {
            status,
            certificate: cert,
            message,
        })
    }

    // --- Users ---

    pub fn count_users(&self) -> Result<i64, CertisError> {
        self.count("SELECT COUNT(*) FROM users")
    }

    pub fn register_user(&self, new: &NewUser, password_hash: &str) -> Result<User, CertisError> {
        let first_name = required("first_name", &new.first_name)?;
        let last_name = required("last_name", &new.last_name)?;
        let email = valid_email(&new.email)?;
        let role = new.role.unwrap_or(Role::Admin);
        let year = optional(new.year_of_employment.as_deref());

        if self.find_user_by_email(&email)?.is_some() {
            return Err(CertisError::Duplicate(format!(
                "user with email {email} already exists"
            )));
        }

        let prefix = self.staff_prefix(year.as_deref(), role);
        let ts = now();
        let id = self.with_unique_identifier(IdentKind::Staff, &prefix, |staff_id| {
            self.conn.execute(
                "INSERT INTO users (first_name, last_name, email, phone_number, responsibility,
                                    year_of_employment, role, staff_id, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    first_name,
                    last_name,
                    email,
                    optional(new.phone_number.as_deref()),
                    optional(new.responsibility.as_deref()),
                    year,
                    role.as_str(),
                    staff_id,
                    password_hash,
                    ts,
                ],
            )?;
            Ok(self.conn.last_insert_rowid())
        })?;

        let user = self.get_user(id)?;
        info!(user_id = id, staff_id = %user.staff_id, role = %user.role, "user registered");
        Ok(user)
    }

    pub fn get_user(&self, id: i64) -> Result<User, CertisError> {
        self.conn
            .query_row(
                "SELECT * FROM users WHERE id = ?1",
                rusqlite::params![id],
                user_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => CertisError::not_found("user", id),
                other => CertisError::Internal(format!("failed to get user: {other}")),
            })
    }

    /// Like `get_user`, but a non-admin id is reported as not found.
    pub fn get_admin(&self, id: i64) -> Result<User, CertisError> {
        match self.get_user(id) {
            Ok(user) if user.role == Role::Admin => Ok(user),
            Ok(_) | Err(CertisError::NotFound(_)) => Err(CertisError::not_found("admin", id)),
            Err(e) => Err(e),
        }
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>, CertisError> {
        self.conn
            .query_row(
                "SELECT * FROM users WHERE email = ?1",
                rusqlite::params![email.trim().to_ascii_lowercase()],
                user_from_row,
            )
            .optional()
            .map_err(internal("failed to look up user"))
    }

    /// The user and stored password hash for a login attempt.
    pub fn credentials(&self, email: &str) -> Result<Option<(User, String)>, CertisError> {
        self.conn
            .query_row(
                "SELECT * FROM users WHERE email = ?1",
                rusqlite::params![email.trim().to_ascii_lowercase()],
                |row| Ok((user_from_row(row)?, row.get::<_, String>("password_hash")?)),
            )
            .optional()
            .map_err(internal("failed to look up credentials"))
    }

    pub fn list_admins(&self, query: PageQuery) -> Result<Page<User>, CertisError> {
        let query = query.normalized();
        let total = self.count("SELECT COUNT(*) FROM users WHERE role = 'admin'")?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM users WHERE role = 'admin'
                 ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            )
            .map_err(internal("failed to prepare admin list"))?;
        let items = stmt
            .query_map(
                rusqlite::params![i64::from(query.limit), query.offset()],
                user_from_row,
            )
            .map_err(internal("failed to list admins"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read admins"))?;
        Ok(Page::new(items, query, total))
    }

    /// Partial update. A year or role change that moves the user into a new
    /// prefix issues a fresh staff ID and retires the old one.
    pub fn update_user(&self, id: i64, fields: &UserUpdate) -> Result<User, CertisError> {
        let current = self.get_user(id)?;

        let mut set_clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(v) = &fields.first_name {
            set_clauses.push("first_name = ?");
            values.push(Value::Text(required("first_name", v)?));
        }
        if let Some(v) = &fields.last_name {
            set_clauses.push("last_name = ?");
            values.push(Value::Text(required("last_name", v)?));
        }
        if let Some(v) = &fields.email {
            let email = valid_email(v)?;
            if let Some(other) = self.find_user_by_email(&email)?
                && other.id != id
            {
                return Err(CertisError::Duplicate(format!(
                    "user with email {email} already exists"
                )));
            }
            set_clauses.push("email = ?");
            values.push(Value::Text(email));
        }
        if let Some(v) = &fields.phone_number {
            set_clauses.push("phone_number = ?");
            values.push(text_or_null(optional(Some(v))));
        }
        if let Some(v) = &fields.responsibility {
            set_clauses.push("responsibility = ?");
            values.push(text_or_null(optional(Some(v))));
        }

        let year = match &fields.year_of_employment {
            Some(v) => optional(Some(v)),
            None => current.year_of_employment.clone(),
        };
        let role = fields.role.unwrap_or(current.role);
        if fields.year_of_employment.is_some() {
            set_clauses.push("year_of_employment = ?");
            values.push(text_or_null(year.clone()));
        }
        if fields.role.is_some() {
            set_clauses.push("role = ?");
            values.push(Value::Text(role.as_str().to_string()));
        }

        let apply_fields = |conn: &Connection| -> Result<(), rusqlite::Error> {
            if set_clauses.is_empty() {
                return Ok(());
            }
            let sql = format!("UPDATE users SET {} WHERE id = ?", set_clauses.join(", "));
            let params = values.iter().cloned().chain([Value::Integer(id)]);
            conn.execute(&sql, rusqlite::params_from_iter(params))?;
            Ok(())
        };

        let prefix = self.staff_prefix(year.as_deref(), role);
        let current_prefix = self.staff_prefix(current.year_of_employment.as_deref(), current.role);
        if prefix != current_prefix {
            let staff_id = self.with_unique_identifier(IdentKind::Staff, &prefix, |staff_id| {
                let tx = self.conn.unchecked_transaction()?;
                apply_fields(&tx)?;
                tx.execute(
                    "UPDATE users SET staff_id = ?1 WHERE id = ?2",
                    rusqlite::params![staff_id, id],
                )?;
                Self::retire(&tx, IdentKind::Staff, &current.staff_id, &now())?;
                tx.commit()?;
                Ok(staff_id.to_string())
            })?;
            info!(user_id = id, old = %current.staff_id, new = %staff_id, "staff id reissued");
        } else {
            apply_fields(&self.conn).map_err(|e| write_error("failed to update user", e))?;
        }

        self.get_user(id)
    }

    pub fn delete_user(&self, id: i64) -> Result<User, CertisError> {
        let user = self.get_user(id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(internal("failed to begin transaction"))?;
        Self::retire(&tx, IdentKind::Staff, &user.staff_id, &now())
            .map_err(internal("failed to retire staff id"))?;
        tx.execute("DELETE FROM users WHERE id = ?1", rusqlite::params![id])
            .map_err(internal("failed to delete user"))?;
        tx.commit().map_err(internal("failed to commit delete"))?;

        info!(user_id = id, staff_id = %user.staff_id, "user deleted");
        Ok(user)
    }

    // --- Reporting ---

    fn count(&self, sql: &str) -> Result<i64, CertisError> {
        self.conn
            .query_row(sql, [], |row| row.get(0))
            .map_err(internal("failed to count rows"))
    }

    pub fn dashboard(&self) -> Result<DashboardSummary, CertisError> {
        let metrics = DashboardMetrics {
            total_certificates: self.count("SELECT COUNT(*) FROM certificates")?,
            total_verified_certificates: self
                .count("SELECT COUNT(*) FROM verification_logs WHERE status = 'valid'")?,
            total_students: self.count("SELECT COUNT(*) FROM students")?,
            pending_verifications: self.count(
                "SELECT COUNT(*) FROM certificates c
                 WHERE NOT EXISTS (SELECT 1 FROM verification_logs v WHERE v.certificate_id = c.id)",
            )?,
            courses_managed: self.count("SELECT COUNT(DISTINCT course_name) FROM certificates")?,
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT v.code, v.verified_at, v.status, c.student_name, c.course_name
                 FROM verification_logs v
                 LEFT JOIN certificates c ON c.id = v.certificate_id
                 ORDER BY v.verified_at DESC, v.id DESC
                 LIMIT ?1",
            )
            .map_err(internal("failed to prepare recent verifications"))?;
        let recent_verifications = stmt
            .query_map(rusqlite::params![RECENT_VERIFICATIONS], |row| {
                let verified_at: String = row.get("verified_at")?;
                let status: String = row.get("status")?;
                Ok(RecentVerification {
                    name: row.get("student_name")?,
                    course: row.get("course_name")?,
                    code: row.get("code")?,
                    verified_at: parse_dt(&verified_at)?,
                    status: status.parse().map_err(conversion_error)?,
                })
            })
            .map_err(internal("failed to query recent verifications"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read recent verifications"))?;

        Ok(DashboardSummary {
            metrics,
            recent_verifications,
        })
    }

    pub fn backup(&self) -> Result<Backup, CertisError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM students ORDER BY id")
            .map_err(internal("failed to prepare student backup"))?;
        let students = stmt
            .query_map([], student_from_row)
            .map_err(internal("failed to query students"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read students"))?;

        Ok(Backup {
            timestamp: Utc::now(),
            students,
            certificates: self.all_certificates()?,
        })
    }
}

pub fn now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp_db() -> (Db, Settings, TempDir) {
        let dir = TempDir::new().unwrap();
        let settings = Settings::for_dir(dir.path());
        let db = Db::open(&settings).unwrap();
        (db, settings, dir)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn new_student(email: &str) -> NewStudent {
        NewStudent {
            first_name: "Ama".into(),
            last_name: "Mensah".into(),
            email: email.into(),
            course_name: "Digital Marketing".into(),
            year_of_study: Some("2025".into()),
            program_start_date: Some("2025-01-06".into()),
            ..Default::default()
        }
    }

    fn issue(db: &Db, name: &str, code: &str) -> Certificate {
        db.issue_certificate(&IssueCertificateParams {
            student_name: Some(name.into()),
            course_name: Some("Digital Marketing".into()),
            course_code: Some(code.into()),
            issued_on: Some(day(2025, 5, 1)),
            ..Default::default()
        })
        .unwrap()
    }

    fn row(name: &str) -> CertificateRow {
        CertificateRow {
            student_id: None,
            student_name: name.into(),
            course_name: "Digital Marketing".into(),
            course_code: "DM".into(),
            issued_on: day(2025, 5, 1),
            year_of_study: None,
            course_summary: None,
        }
    }

    fn new_user(email: &str, year: Option<&str>, role: Option<Role>) -> NewUser {
        NewUser {
            first_name: "Kofi".into(),
            last_name: "Boateng".into(),
            email: email.into(),
            password: "irrelevant".into(),
            phone_number: None,
            responsibility: None,
            year_of_employment: year.map(String::from),
            role,
        }
    }

    #[test]
    fn open_creates_tables() {
        let (db, _settings, _dir) = open_temp_db();

        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for table in [
            "students",
            "certificates",
            "users",
            "verification_logs",
            "retired_identifiers",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::for_dir(dir.path());
        let _db1 = Db::open(&settings).unwrap();
        let _db2 = Db::open(&settings).unwrap();
    }

    #[test]
    fn foreign_keys_enforced() {
        let (db, _settings, _dir) = open_temp_db();
        let result = db.conn.execute(
            "INSERT INTO certificates (student_id, student_name, course_name, course_code, certificate_number, issued_on, created_at)
             VALUES (999, 'x', 'y', 'Z', 'SHSL/25B/Z/0001', '2025-01-01', '2025-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err(), "should reject certificate for missing student");
    }

    #[test]
    fn create_and_get_student() {
        let (db, _settings, _dir) = open_temp_db();
        let student = db.create_student(&new_student("Ama@Example.org")).unwrap();
        assert_eq!(student.email, "ama@example.org");
        assert_eq!(student.program_start_date, Some(day(2025, 1, 6)));
        assert!(student.program_end_date.is_none());

        let fetched = db.get_student(student.id).unwrap();
        assert_eq!(fetched.full_name(), "Ama Mensah");
    }

    #[test]
    fn duplicate_student_email_names_existing_id() {
        let (db, _settings, _dir) = open_temp_db();
        let first = db.create_student(&new_student("ama@example.org")).unwrap();
        let err = db.create_student(&new_student("AMA@example.org")).unwrap_err();
        match err {
            CertisError::Duplicate(msg) => assert!(msg.contains(&format!("id {}", first.id))),
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[test]
    fn student_validation() {
        let (db, _settings, _dir) = open_temp_db();
        let mut s = new_student("ama@example.org");
        s.course_name = "  ".into();
        assert!(matches!(db.create_student(&s), Err(CertisError::InvalidInput(_))));

        let mut s = new_student("ama@example.org");
        s.program_end_date = Some("01/02/2025".into());
        let err = db.create_student(&s).unwrap_err();
        assert!(err.to_string().contains("YYYY-MM-DD"));

        let s = new_student("not-an-email");
        assert!(matches!(db.create_student(&s), Err(CertisError::InvalidInput(_))));
    }

    #[test]
    fn update_student_fields() {
        let (db, _settings, _dir) = open_temp_db();
        let student = db.create_student(&new_student("ama@example.org")).unwrap();

        let updated = db
            .update_student(
                student.id,
                &StudentUpdate {
                    course_name: Some("Data Analytics".into()),
                    year_of_study: Some(String::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.course_name, "Data Analytics");
        assert!(updated.year_of_study.is_none());
        assert_eq!(updated.first_name, "Ama");
    }

    #[test]
    fn list_students_reports_certification() {
        let (db, _settings, _dir) = open_temp_db();
        let certified = db.create_student(&new_student("a@example.org")).unwrap();
        db.create_student(&new_student("b@example.org")).unwrap();
        db.issue_certificate(&IssueCertificateParams {
            student_id: Some(certified.id),
            course_code: Some("DM".into()),
            ..Default::default()
        })
        .unwrap();

        let list = db.list_students().unwrap();
        assert_eq!(list.len(), 2);
        let entry = list.iter().find(|s| s.student.id == certified.id).unwrap();
        assert!(entry.certified);
        assert_eq!(entry.certificate_count, 1);
        assert!(list.iter().any(|s| !s.certified));
    }

    #[test]
    fn certificate_from_student_inherits_details() {
        let (db, _settings, _dir) = open_temp_db();
        let student = db.create_student(&new_student("ama@example.org")).unwrap();
        let cert = db
            .issue_certificate(&IssueCertificateParams {
                student_id: Some(student.id),
                course_code: Some("dm".into()),
                issued_on: Some(day(2025, 2, 1)),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(cert.student_name, "Ama Mensah");
        assert_eq!(cert.course_name, "Digital Marketing");
        assert_eq!(cert.year_of_study.as_deref(), Some("2025"));
        assert_eq!(cert.certificate_number, "SHSL/25B/DM/0001");
        assert!(cert.is_active);
    }

    #[test]
    fn certificate_requires_names() {
        let (db, _settings, _dir) = open_temp_db();
        let err = db
            .issue_certificate(&IssueCertificateParams::default())
            .unwrap_err();
        assert!(matches!(err, CertisError::InvalidInput(_)));
    }

    #[test]
    fn missing_course_code_uses_default() {
        let (db, _settings, _dir) = open_temp_db();
        let cert = db
            .issue_certificate(&IssueCertificateParams {
                student_name: Some("Ama Mensah".into()),
                course_name: Some("Digital Marketing".into()),
                issued_on: Some(day(2024, 12, 31)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(cert.certificate_number, "SHSL/24B/GEN/0001");
    }

    #[test]
    fn sequences_are_contiguous_per_prefix() {
        let (db, _settings, _dir) = open_temp_db();
        let numbers: Vec<String> = (0..5)
            .map(|i| issue(&db, &format!("student {i}"), "DM").certificate_number)
            .collect();
        assert_eq!(
            numbers,
            (1..=5)
                .map(|n| format!("SHSL/25B/DM/{n:04}"))
                .collect::<Vec<_>>()
        );

        // a different course starts its own sequence
        assert_eq!(issue(&db, "other", "DA").certificate_number, "SHSL/25B/DA/0001");
        assert_eq!(issue(&db, "again", "DM").certificate_number, "SHSL/25B/DM/0006");
    }

    #[test]
    fn deleted_highest_number_is_not_reissued() {
        let (db, _settings, _dir) = open_temp_db();
        let certs: Vec<Certificate> = (0..3).map(|i| issue(&db, &format!("s{i}"), "DM")).collect();
        db.delete_certificate(certs[2].id).unwrap();

        let next = issue(&db, "s3", "DM");
        assert_eq!(next.certificate_number, "SHSL/25B/DM/0004");
    }

    #[test]
    fn collision_retries_with_next_candidate() {
        let (db, settings, _dir) = open_temp_db();
        let rival = Db::open(&settings).unwrap();
        let prefix = db.certificate_prefix(day(2025, 5, 1), "DM");

        let mut calls = 0;
        let (id, number) = db
            .with_unique_identifier(IdentKind::Certificate, &prefix, |number| {
                calls += 1;
                if calls == 1 {
                    // another request commits the same candidate first
                    rival.insert_certificate_row(&row("rival"), number)?;
                }
                let id = db.insert_certificate_row(&row("ours"), number)?;
                Ok((id, number.to_string()))
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(number, "SHSL/25B/DM/0002");
        assert_eq!(db.get_certificate(id).unwrap().student_name, "ours");
        let first = db.find_certificate_by_number("SHSL/25B/DM/0001").unwrap().unwrap();
        assert_eq!(first.student_name, "rival");
    }

    #[test]
    fn persistent_collisions_are_fatal() {
        let (db, _settings, _dir) = open_temp_db();
        let prefix = db.certificate_prefix(day(2025, 5, 1), "DM");

        let mut calls = 0;
        let result: Result<i64, CertisError> =
            db.with_unique_identifier(IdentKind::Certificate, &prefix, |number| {
                calls += 1;
                db.insert_certificate_row(&row("first"), number)?;
                db.insert_certificate_row(&row("second"), number)
            });

        assert_eq!(calls, MAX_ATTEMPTS);
        assert!(matches!(
            result,
            Err(CertisError::IdentifierExhausted { attempts: MAX_ATTEMPTS, .. })
        ));
    }

    #[test]
    fn other_unique_violations_are_not_retried() {
        let (db, _settings, _dir) = open_temp_db();
        db.register_user(&new_user("kofi@example.org", Some("2023"), None), "h")
            .unwrap();

        let prefix = db.staff_prefix(Some("2023"), Role::Admin);
        let mut calls = 0;
        let result: Result<(), CertisError> =
            db.with_unique_identifier(IdentKind::Staff, &prefix, |staff_id| {
                calls += 1;
                db.conn.execute(
                    "INSERT INTO users (first_name, last_name, email, role, staff_id, password_hash, created_at)
                     VALUES ('a', 'b', 'kofi@example.org', 'admin', ?1, 'h', '2025-01-01T00:00:00Z')",
                    rusqlite::params![staff_id],
                )?;
                Ok(())
            });

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(CertisError::Duplicate(_))));
    }

    #[test]
    fn staff_ids_follow_year_and_role() {
        let (db, _settings, _dir) = open_temp_db();
        let a = db
            .register_user(&new_user("a@example.org", Some("2023"), None), "h")
            .unwrap();
        let b = db
            .register_user(&new_user("b@example.org", Some("2023"), Some(Role::Admin)), "h")
            .unwrap();
        let c = db
            .register_user(&new_user("c@example.org", None, Some(Role::Staff)), "h")
            .unwrap();
        let d = db.register_user(&new_user("d@example.org", None, None), "h").unwrap();

        assert_eq!(a.staff_id, "SHSL/23/AD/0001");
        assert_eq!(b.staff_id, "SHSL/23/AD/0002");
        assert_eq!(c.staff_id, "SHSL/00/ST/0001");
        assert_eq!(d.staff_id, "SHSL/00/AD/0001");
        assert_eq!(d.role, Role::Admin);
    }

    #[test]
    fn duplicate_user_email_rejected() {
        let (db, _settings, _dir) = open_temp_db();
        db.register_user(&new_user("a@example.org", None, None), "h").unwrap();
        let err = db
            .register_user(&new_user("A@example.org", None, None), "h")
            .unwrap_err();
        assert!(matches!(err, CertisError::Duplicate(_)));
    }

    #[test]
    fn year_change_reissues_staff_id() {
        let (db, _settings, _dir) = open_temp_db();
        let user = db
            .register_user(&new_user("a@example.org", Some("2023"), None), "h")
            .unwrap();
        db.register_user(&new_user("b@example.org", Some("2024"), None), "h")
            .unwrap();

        let moved = db
            .update_user(
                user.id,
                &UserUpdate {
                    year_of_employment: Some("2024".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(moved.staff_id, "SHSL/24/AD/0002");
        assert_eq!(moved.year_of_employment.as_deref(), Some("2024"));

        // the superseded id is never handed out again
        let next = db
            .register_user(&new_user("c@example.org", Some("2023"), None), "h")
            .unwrap();
        assert_eq!(next.staff_id, "SHSL/23/AD/0002");
    }

    #[test]
    fn unrelated_edit_keeps_staff_id() {
        let (db, _settings, _dir) = open_temp_db();
        let user = db
            .register_user(&new_user("a@example.org", Some("2023"), None), "h")
            .unwrap();
        let updated = db
            .update_user(
                user.id,
                &UserUpdate {
                    responsibility: Some("Registrar".into()),
                    year_of_employment: Some("2023".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.staff_id, user.staff_id);
        assert_eq!(updated.responsibility.as_deref(), Some("Registrar"));
    }

    #[test]
    fn course_code_change_renumbers_certificate() {
        let (db, _settings, _dir) = open_temp_db();
        let cert = issue(&db, "Ama", "DM");
        issue(&db, "Kwame", "DA");

        let moved = db
            .update_certificate(
                cert.id,
                &CertificateUpdate {
                    course_code: Some("da".into()),
                    course_summary: Some("Twelve weeks".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(moved.certificate_number, "SHSL/25B/DA/0002");
        assert_eq!(moved.course_code, "DA");
        assert_eq!(moved.course_summary.as_deref(), Some("Twelve weeks"));

        assert_eq!(issue(&db, "Esi", "DM").certificate_number, "SHSL/25B/DM/0002");
    }

    #[test]
    fn failed_renumber_keeps_other_edits_unapplied() {
        let (db, _settings, _dir) = open_temp_db();
        let cert = issue(&db, "Ama", "DM");
        db.conn
            .execute_batch(
                "CREATE TRIGGER block_renumber BEFORE UPDATE OF certificate_number ON certificates
                 BEGIN SELECT RAISE(ABORT, 'renumber failed'); END;",
            )
            .unwrap();

        let err = db
            .update_certificate(
                cert.id,
                &CertificateUpdate {
                    student_name: Some("Changed".into()),
                    course_code: Some("DA".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CertisError::Internal(_)), "{err:?}");

        let stored = db.get_certificate(cert.id).unwrap();
        assert_eq!(stored.student_name, "Ama");
        assert_eq!(stored.certificate_number, "SHSL/25B/DM/0001");
        let retired: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM retired_identifiers", [], |r| r.get(0))
            .unwrap();
        assert_eq!(retired, 0);
    }

    #[test]
    fn failed_staff_reissue_keeps_other_edits_unapplied() {
        let (db, _settings, _dir) = open_temp_db();
        let user = db
            .register_user(&new_user("a@example.org", Some("2023"), None), "h")
            .unwrap();
        db.conn
            .execute_batch(
                "CREATE TRIGGER block_reissue BEFORE UPDATE OF staff_id ON users
                 BEGIN SELECT RAISE(ABORT, 'reissue failed'); END;",
            )
            .unwrap();

        db.update_user(
            user.id,
            &UserUpdate {
                first_name: Some("Changed".into()),
                role: Some(Role::Staff),
                ..Default::default()
            },
        )
        .unwrap_err();

        let stored = db.get_user(user.id).unwrap();
        assert_eq!(stored.first_name, "Kofi");
        assert_eq!(stored.role, Role::Admin);
        assert_eq!(stored.staff_id, "SHSL/23/AD/0001");
    }

    #[test]
    fn role_change_reissues_staff_id() {
        let (db, _settings, _dir) = open_temp_db();
        let user = db
            .register_user(&new_user("a@example.org", Some("2023"), None), "h")
            .unwrap();
        let moved = db
            .update_user(
                user.id,
                &UserUpdate {
                    role: Some(Role::Staff),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(moved.role, Role::Staff);
        assert_eq!(moved.staff_id, "SHSL/23/ST/0001");
    }

    #[test]
    fn unrecognised_role_registers_with_default_department() {
        let (db, _settings, _dir) = open_temp_db();
        let body: NewUser = serde_json::from_str(
            r#"{"first_name":"Yaw","last_name":"Asante","email":"yaw@example.org",
                "password":"irrelevant","year_of_employment":"2023","role":"student"}"#,
        )
        .unwrap();
        let user = db.register_user(&body, "h").unwrap();
        assert_eq!(user.role, Role::Admin);
        assert_eq!(user.staff_id, "SHSL/23/AD/0001");
    }

    #[test]
    fn get_admin_hides_other_roles() {
        let (db, _settings, _dir) = open_temp_db();
        let admin = db.register_user(&new_user("a@example.org", None, None), "h").unwrap();
        let staff = db
            .register_user(&new_user("b@example.org", None, Some(Role::Staff)), "h")
            .unwrap();
        assert_eq!(db.get_admin(admin.id).unwrap().id, admin.id);
        assert!(matches!(db.get_admin(staff.id), Err(CertisError::NotFound(_))));
        assert!(matches!(db.get_admin(999), Err(CertisError::NotFound(_))));
    }

    #[test]
    fn verification_outcomes_are_logged() {
        let (db, _settings, _dir) = open_temp_db();
        let cert = issue(&db, "Ama", "DM");

        let ok = db.verify(&cert.certificate_number, Some("10.0.0.1")).unwrap();
        assert_eq!(ok.status, VerifyStatus::Valid);
        assert_eq!(ok.certificate.unwrap().id, cert.id);

        let missing = db.verify("SHSL/25B/DM/9999", None).unwrap();
        assert_eq!(missing.status, VerifyStatus::Invalid);
        assert!(missing.certificate.is_none());

        db.revoke_certificate(cert.id).unwrap();
        let revoked = db.verify(&cert.certificate_number, None).unwrap();
        assert_eq!(revoked.status, VerifyStatus::Revoked);

        let logged = db.count("SELECT COUNT(*) FROM verification_logs").unwrap();
        assert_eq!(logged, 3);
    }

    #[test]
    fn dashboard_aggregates() {
        let (db, _settings, _dir) = open_temp_db();
        db.create_student(&new_student("a@example.org")).unwrap();
        let verified = issue(&db, "Ama", "DM");
        issue(&db, "Kwame", "DM");
        db.issue_certificate(&IssueCertificateParams {
            student_name: Some("Esi".into()),
            course_name: Some("Data Analytics".into()),
            course_code: Some("DA".into()),
            ..Default::default()
        })
        .unwrap();

        db.verify(&verified.certificate_number, None).unwrap();
        db.verify("nope", None).unwrap();

        let summary = db.dashboard().unwrap();
        assert_eq!(
            summary.metrics,
            DashboardMetrics {
                total_certificates: 3,
                total_verified_certificates: 1,
                total_students: 1,
                pending_verifications: 2,
                courses_managed: 2,
            }
        );
        assert_eq!(summary.recent_verifications.len(), 2);
        assert_eq!(summary.recent_verifications[0].code, "nope");
        assert!(summary.recent_verifications[0].name.is_none());
        assert_eq!(summary.recent_verifications[1].name.as_deref(), Some("Ama"));
    }

    #[test]
    fn deleting_student_cascades_and_retires_numbers() {
        let (db, _settings, _dir) = open_temp_db();
        let student = db.create_student(&new_student("a@example.org")).unwrap();
        let cert = db
            .issue_certificate(&IssueCertificateParams {
                student_id: Some(student.id),
                course_code: Some("DM".into()),
                issued_on: Some(day(2025, 5, 1)),
                ..Default::default()
            })
            .unwrap();
        db.verify(&cert.certificate_number, None).unwrap();

        let removed = db.delete_student(student.id).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(matches!(
            db.get_certificate(cert.id),
            Err(CertisError::NotFound(_))
        ));
        assert_eq!(issue(&db, "next", "DM").certificate_number, "SHSL/25B/DM/0002");

        // the log survives without its certificate
        let orphaned: Option<i64> = db
            .conn
            .query_row("SELECT certificate_id FROM verification_logs", [], |r| r.get(0))
            .unwrap();
        assert!(orphaned.is_none());
    }

    #[test]
    fn certificate_pages() {
        let (db, _settings, _dir) = open_temp_db();
        for i in 0..7 {
            issue(&db, &format!("s{i}"), "DM");
        }
        let page = db.list_certificates(PageQuery { page: 2, limit: 3 }).unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.items[0].certificate_number, "SHSL/25B/DM/0004");
    }

    #[test]
    fn admin_listing_excludes_other_roles() {
        let (db, _settings, _dir) = open_temp_db();
        db.register_user(&new_user("a@example.org", None, None), "h").unwrap();
        db.register_user(&new_user("b@example.org", None, Some(Role::Staff)), "h")
            .unwrap();
        let page = db.list_admins(PageQuery::default()).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].email, "a@example.org");
    }

    #[test]
    fn credentials_return_stored_hash() {
        let (db, _settings, _dir) = open_temp_db();
        db.register_user(&new_user("a@example.org", None, None), "stored-hash")
            .unwrap();
        let (user, hash) = db.credentials("A@example.org").unwrap().unwrap();
        assert_eq!(user.email, "a@example.org");
        assert_eq!(hash, "stored-hash");
        assert!(db.credentials("missing@example.org").unwrap().is_none());
    }
}
