use serde_json::Value;

use crate::error::{CertisError, ErrorResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Json,
    Human,
}

pub fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("error: failed to render json: {e}"),
    }
}

pub fn print_error(err: &CertisError, mode: OutputMode) {
    match mode {
        OutputMode::Json => {
            let resp = ErrorResponse::from(err);
            match serde_json::to_string(&resp) {
                Ok(s) => eprintln!("{s}"),
                Err(_) => eprintln!("error: {err}"),
            }
        }
        OutputMode::Human => {
            eprintln!("error: {err}");
        }
    }
}

fn s<'a>(value: &'a Value, key: &str, default: &'a str) -> &'a str {
    value[key].as_str().unwrap_or(default)
}

pub fn print_student(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let id = value["id"].as_i64().unwrap_or(0);
            let first = s(value, "first_name", "?");
            let last = s(value, "last_name", "?");
            let email = s(value, "email", "?");
            let course = s(value, "course_name", "?");
            let status = match value["certified"].as_bool() {
                Some(true) => "certified",
                Some(false) => "pending",
                None => "",
            };
            println!("{id:>4}  {first} {last} <{email}>  {course}  {status}");
        }
    }
}

pub fn print_student_detail(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            print_student(value, OutputMode::Human);
            for key in [
                "phone_number",
                "year_of_study",
                "program_start_date",
                "program_end_date",
                "photo_url",
            ] {
                if let Some(v) = value[key].as_str() {
                    println!("  {key}: {v}");
                }
            }
            println!("  created: {}", s(value, "created_at", "?"));
        }
    }
}

pub fn print_student_list(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            if let Some(arr) = value.as_array() {
                if arr.is_empty() {
                    println!("(no students)");
                } else {
                    for item in arr {
                        print_student(item, OutputMode::Human);
                    }
                }
            }
        }
    }
}

pub fn print_certificate(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let id = value["id"].as_i64().unwrap_or(0);
            let number = s(value, "certificate_number", "?");
            let name = s(value, "student_name", "?");
            let course = s(value, "course_name", "?");
            let issued = s(value, "issued_on", "?");
            let state = if value["is_active"].as_bool().unwrap_or(true) {
                "active"
            } else {
                "revoked"
            };
            println!("{id:>4}  {number:<20} {state:<8} {issued}  {name}  ({course})");
        }
    }
}

pub fn print_certificate_detail(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            print_certificate(value, OutputMode::Human);
            for key in ["course_code", "year_of_study", "course_summary", "qr_code_url"] {
                if let Some(v) = value[key].as_str() {
                    println!("  {key}: {v}");
                }
            }
            if let Some(student_id) = value["student_id"].as_i64() {
                println!("  student: {student_id}");
            }
        }
    }
}

fn print_page_footer(value: &Value) {
    let page = value["page"].as_i64().unwrap_or(1);
    let total_pages = value["total_pages"].as_i64().unwrap_or(0);
    let total = value["total"].as_i64().unwrap_or(0);
    println!("page {page}/{total_pages} ({total} total)");
}

pub fn print_certificate_page(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            match value["items"].as_array() {
                Some(items) if !items.is_empty() => {
                    for item in items {
                        print_certificate(item, OutputMode::Human);
                    }
                }
                _ => println!("(no certificates)"),
            }
            print_page_footer(value);
        }
    }
}

pub fn print_user(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let id = value["id"].as_i64().unwrap_or(0);
            let staff_id = s(value, "staff_id", "?");
            let role = s(value, "role", "?");
            let first = s(value, "first_name", "?");
            let last = s(value, "last_name", "?");
            let email = s(value, "email", "?");
            println!("{id:>4}  {staff_id:<18} {role:<8} {first} {last} <{email}>");
        }
    }
}

pub fn print_user_page(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            match value["items"].as_array() {
                Some(items) if !items.is_empty() => {
                    for item in items {
                        print_user(item, OutputMode::Human);
                    }
                }
                _ => println!("(no admins)"),
            }
            print_page_footer(value);
        }
    }
}

pub fn print_token(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let token = s(value, "access_token", "?");
            let expires = s(value, "expires_at", "?");
            let staff_id = s(&value["user"], "staff_id", "?");
            println!("logged in as {staff_id}, token expires {expires}");
            println!("export CV_TOKEN={token}");
        }
    }
}

pub fn print_verification(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let status = s(value, "status", "?");
            println!("{status}");
            let cert = &value["certificate"];
            if cert.is_object() {
                println!(
                    "  {}  {}  ({}), issued {}",
                    s(cert, "certificate_number", "?"),
                    s(cert, "student_name", "?"),
                    s(cert, "course_name", "?"),
                    s(cert, "issued_on", "?"),
                );
            }
            if let Some(msg) = value["message"].as_str() {
                println!("  {msg}");
            }
        }
    }
}

pub fn print_dashboard(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let m = &value["metrics"];
            for key in [
                "total_certificates",
                "total_verified_certificates",
                "total_students",
                "pending_verifications",
                "courses_managed",
            ] {
                println!("{key:<28} {:>6}", m[key].as_i64().unwrap_or(0));
            }
            if let Some(recent) = value["recent_verifications"].as_array()
                && !recent.is_empty()
            {
                println!("recent verifications:");
                for r in recent {
                    println!(
                        "  [{}] {:<8} {}  {}",
                        s(r, "verified_at", "?"),
                        s(r, "status", "?"),
                        s(r, "code", "?"),
                        s(r, "name", "-"),
                    );
                }
            }
        }
    }
}

pub fn print_import_report(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let imported = value["imported"].as_i64().unwrap_or(0);
            let skipped = value["skipped"].as_array();
            println!(
                "imported {imported} students, skipped {}",
                skipped.map_or(0, Vec::len)
            );
            for row in skipped.into_iter().flatten() {
                let line = row["line"].as_i64().unwrap_or(0);
                println!("  line {line}: {}", s(row, "reason", ""));
            }
        }
    }
}

pub fn print_status(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => {
            let status = s(value, "status", "?");
            let version = s(value, "version", "?");
            let org = s(value, "org_code", "?");
            let users = value["users"].as_i64().unwrap_or(0);
            println!("{status}  version {version}  org {org}  users {users}");
        }
    }
}

pub fn print_deleted(value: &Value, mode: OutputMode) {
    match mode {
        OutputMode::Json => print_json(value),
        OutputMode::Human => match value["certificate_number"].as_str() {
            Some(number) => println!("deleted {number}"),
            None => println!("deleted"),
        },
    }
}
