use std::io::{Read, Write};

use csv::{ReaderBuilder, Trim, Writer};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::Db;
use crate::error::CertisError;
use crate::types::{Certificate, ImportReport, NewStudent, SkippedRow, Student};

/// One row of a student import file. Unknown columns are ignored and
/// missing ones read as empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StudentRecord {
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone_number: Option<String>,
    course_name: Option<String>,
    year_of_study: Option<String>,
    program_start_date: Option<String>,
    program_end_date: Option<String>,
    photo_url: Option<String>,
}

impl From<StudentRecord> for NewStudent {
    fn from(r: StudentRecord) -> Self {
        NewStudent {
            first_name: r.first_name.unwrap_or_default(),
            last_name: r.last_name.unwrap_or_default(),
            email: r.email.unwrap_or_default(),
            phone_number: r.phone_number,
            course_name: r.course_name.unwrap_or_default(),
            year_of_study: r.year_of_study,
            program_start_date: r.program_start_date,
            program_end_date: r.program_end_date,
            photo_url: r.photo_url,
        }
    }
}

/// Imports students from a CSV with a header row.
///
/// Rows that fail validation or collide with an existing email are skipped
/// and reported by line number; storage failures abort the import.
pub fn import_students<R: Read>(db: &Db, reader: R) -> Result<ImportReport, CertisError> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| CertisError::InvalidInput(format!("unreadable csv header: {e}")))?
        .clone();
    if !headers.iter().any(|h| h == "email") {
        return Err(CertisError::InvalidInput(
            "csv header must include an email column".to_string(),
        ));
    }

    let mut report = ImportReport::default();
    for (i, result) in rdr.records().enumerate() {
        // header is line 1
        let fallback_line = i as u64 + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                report.skipped.push(SkippedRow {
                    line: e.position().map_or(fallback_line, |p| p.line()),
                    reason: format!("malformed row: {e}"),
                });
                continue;
            }
        };
        let line = record.position().map_or(fallback_line, |p| p.line());

        let row: StudentRecord = match record.deserialize(Some(&headers)) {
            Ok(r) => r,
            Err(e) => {
                report.skipped.push(SkippedRow {
                    line,
                    reason: format!("malformed row: {e}"),
                });
                continue;
            }
        };

        match db.create_student(&NewStudent::from(row)) {
            Ok(_) => report.imported += 1,
            Err(e @ (CertisError::InvalidInput(_) | CertisError::Duplicate(_))) => {
                debug!(line, "skipping student row: {e}");
                report.skipped.push(SkippedRow {
                    line,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        imported = report.imported,
        skipped = report.skipped.len(),
        "student import finished"
    );
    Ok(report)
}

#[derive(Serialize)]
struct StudentExportRow<'a> {
    id: i64,
    first_name: &'a str,
    last_name: &'a str,
    email: &'a str,
    phone_number: Option<&'a str>,
    course_name: &'a str,
    year_of_study: Option<&'a str>,
    program_start_date: Option<String>,
    program_end_date: Option<String>,
    photo_url: Option<&'a str>,
    created_at: String,
}

impl<'a> From<&'a Student> for StudentExportRow<'a> {
    fn from(s: &'a Student) -> Self {
        StudentExportRow {
            id: s.id,
            first_name: &s.first_name,
            last_name: &s.last_name,
            email: &s.email,
            phone_number: s.phone_number.as_deref(),
            course_name: &s.course_name,
            year_of_study: s.year_of_study.as_deref(),
            program_start_date: s.program_start_date.map(|d| d.to_string()),
            program_end_date: s.program_end_date.map(|d| d.to_string()),
            photo_url: s.photo_url.as_deref(),
            created_at: s.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct CertificateExportRow<'a> {
    certificate_number: &'a str,
    student_name: &'a str,
    course_name: &'a str,
    course_code: &'a str,
    issued_on: String,
    year_of_study: Option<&'a str>,
    course_summary: Option<&'a str>,
    is_active: bool,
    qr_code_url: Option<&'a str>,
}

impl<'a> From<&'a Certificate> for CertificateExportRow<'a> {
    fn from(c: &'a Certificate) -> Self {
        CertificateExportRow {
            certificate_number: &c.certificate_number,
            student_name: &c.student_name,
            course_name: &c.course_name,
            course_code: &c.course_code,
            issued_on: c.issued_on.to_string(),
            year_of_study: c.year_of_study.as_deref(),
            course_summary: c.course_summary.as_deref(),
            is_active: c.is_active,
            qr_code_url: c.qr_code_url.as_deref(),
        }
    }
}

fn write_rows<W, T, I>(writer: W, rows: I) -> Result<(), CertisError>
where
    W: Write,
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let mut wtr = Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row)
            .map_err(|e| CertisError::Internal(format!("failed to write csv row: {e}")))?;
    }
    wtr.flush()
        .map_err(|e| CertisError::Internal(format!("failed to flush csv: {e}")))?;
    Ok(())
}

pub fn write_students<W: Write>(students: &[Student], writer: W) -> Result<(), CertisError> {
    write_rows(writer, students.iter().map(StudentExportRow::from))
}

pub fn write_certificates<W: Write>(
    certificates: &[Certificate],
    writer: W,
) -> Result<(), CertisError> {
    write_rows(writer, certificates.iter().map(CertificateExportRow::from))
}

pub fn students_csv(students: &[Student]) -> Result<String, CertisError> {
    let mut buf = Vec::new();
    write_students(students, &mut buf)?;
    String::from_utf8(buf).map_err(|e| CertisError::Internal(format!("csv is not utf-8: {e}")))
}

pub fn certificates_csv(certificates: &[Certificate]) -> Result<String, CertisError> {
    let mut buf = Vec::new();
    write_certificates(certificates, &mut buf)?;
    String::from_utf8(buf).map_err(|e| CertisError::Internal(format!("csv is not utf-8: {e}")))
}
