use std::path::{Path, PathBuf};
use std::process;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use certis::client::Client;
use certis::config::DaemonArgs;
use certis::error::CertisError;
use certis::output::{self, OutputMode};
use certis::types::{
    CertificateUpdate, IssueCertificateParams, NewStudent, NewUser, PageQuery, Role,
    StudentUpdate, UserUpdate,
};

#[derive(Parser)]
#[command(name = "cv", about = "Certificate issuance and verification")]
struct Cli {
    /// Bearer token from `cv login`.
    #[arg(long, env = "CV_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Daemon {
        #[command(flatten)]
        args: DaemonArgs,
        #[command(subcommand)]
        subcmd: Option<DaemonSubcommand>,
    },
    /// Print the data directory the daemon would use.
    Where {
        #[arg(long, env = "CV_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
    Register {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "CV_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        responsibility: Option<String>,
        #[arg(long)]
        year_of_employment: Option<String>,
        /// admin, staff or employer; anything else registers as admin
        #[arg(long)]
        role: Option<String>,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "CV_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Student {
        #[command(subcommand)]
        subcmd: StudentSubcommand,
    },
    Cert {
        #[command(subcommand)]
        subcmd: CertSubcommand,
    },
    Admin {
        #[command(subcommand)]
        subcmd: AdminSubcommand,
    },
    Verify {
        code: String,
    },
    Dashboard,
    Backup {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum DaemonSubcommand {
    Status,
}

#[derive(Subcommand)]
enum StudentSubcommand {
    Create {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        course: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        year_of_study: Option<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        photo_url: Option<String>,
    },
    List,
    Show {
        id: i64,
    },
    Update {
        id: i64,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        year_of_study: Option<String>,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        photo_url: Option<String>,
    },
    Delete {
        id: i64,
    },
    Import {
        file: PathBuf,
    },
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum CertSubcommand {
    Issue {
        #[arg(long)]
        student_id: Option<i64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        course_code: Option<String>,
        #[arg(long)]
        issued_on: Option<NaiveDate>,
        #[arg(long)]
        year_of_study: Option<String>,
        #[arg(long)]
        summary: Option<String>,
    },
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: u32,
    },
    Show {
        id: i64,
    },
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        course_code: Option<String>,
        #[arg(long)]
        year_of_study: Option<String>,
        #[arg(long)]
        summary: Option<String>,
    },
    Revoke {
        id: i64,
    },
    Delete {
        id: i64,
    },
    /// Regenerate and store the QR code.
    Qr {
        id: i64,
    },
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AdminSubcommand {
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: u32,
    },
    Update {
        id: i64,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        responsibility: Option<String>,
        #[arg(long)]
        year_of_employment: Option<String>,
        #[arg(long)]
        role: Option<String>,
    },
    Delete {
        id: i64,
    },
}

fn fail(err: CertisError, mode: OutputMode) -> ! {
    output::print_error(&err, mode);
    process::exit(1);
}

fn current_dir(mode: OutputMode) -> PathBuf {
    std::env::current_dir().unwrap_or_else(|e| {
        fail(
            CertisError::Internal(format!("cannot read current directory: {e}")),
            mode,
        )
    })
}

/// Writes `content` to `out`, or stdout when no file is given.
fn write_out(out: Option<&Path>, content: &str, mode: OutputMode) {
    match out {
        Some(path) => {
            if let Err(e) = std::fs::write(path, content) {
                fail(
                    CertisError::Internal(format!("failed to write {}: {e}", path.display())),
                    mode,
                );
            }
            eprintln!("wrote {}", path.display());
        }
        None => print!("{content}"),
    }
}

fn run_daemon(args: DaemonArgs, mode: OutputMode) {
    let settings = args
        .into_settings(&current_dir(mode))
        .unwrap_or_else(|e| fail(e, mode));
    let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        fail(
            CertisError::Internal(format!("failed to create tokio runtime: {e}")),
            mode,
        )
    });
    if let Err(e) = rt.block_on(certis::daemon::start(settings)) {
        fail(e, mode);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let client = || Client::new(cli.token.clone());

    match cli.command {
        Commands::Daemon { args, subcmd } => match subcmd {
            Some(DaemonSubcommand::Status) => {
                let client = client();
                match client.check_reachable() {
                    Ok(()) => {
                        println!("daemon reachable at {}", client.base_url());
                        process::exit(0);
                    }
                    Err(e) => {
                        eprintln!("daemon unreachable: {e}");
                        process::exit(1);
                    }
                }
            }
            None => run_daemon(args, mode),
        },

        Commands::Where { data_dir } => {
            let dir = data_dir.unwrap_or_else(|| current_dir(mode).join(".certis"));
            println!("{}", dir.display());
        }

        Commands::Register {
            first_name,
            last_name,
            email,
            password,
            phone,
            responsibility,
            year_of_employment,
            role,
        } => {
            let user = NewUser {
                first_name,
                last_name,
                email,
                password,
                phone_number: phone,
                responsibility,
                year_of_employment,
                role: role.as_deref().map(Role::parse_or_default),
            };
            match client().register(&user) {
                Ok(v) => output::print_user(&v, mode),
                Err(e) => fail(e, mode),
            }
        }

        Commands::Login { email, password } => match client().login(&email, &password) {
            Ok(v) => output::print_token(&v, mode),
            Err(e) => fail(e, mode),
        },

        Commands::Student { subcmd } => match subcmd {
            StudentSubcommand::Create {
                first_name,
                last_name,
                email,
                course,
                phone,
                year_of_study,
                start,
                end,
                photo_url,
            } => {
                let student = NewStudent {
                    first_name,
                    last_name,
                    email,
                    phone_number: phone,
                    course_name: course,
                    year_of_study,
                    program_start_date: start,
                    program_end_date: end,
                    photo_url,
                };
                match client().create_student(&student) {
                    Ok(v) => output::print_student_detail(&v, mode),
                    Err(e) => fail(e, mode),
                }
            }
            StudentSubcommand::List => match client().list_students() {
                Ok(v) => output::print_student_list(&v, mode),
                Err(e) => fail(e, mode),
            },
            StudentSubcommand::Show { id } => match client().get_student(id) {
                Ok(v) => output::print_student_detail(&v, mode),
                Err(e) => fail(e, mode),
            },
            StudentSubcommand::Update {
                id,
                first_name,
                last_name,
                email,
                course,
                phone,
                year_of_study,
                start,
                end,
                photo_url,
            } => {
                let fields = StudentUpdate {
                    first_name,
                    last_name,
                    email,
                    phone_number: phone,
                    course_name: course,
                    year_of_study,
                    program_start_date: start,
                    program_end_date: end,
                    photo_url,
                };
                match client().update_student(id, &fields) {
                    Ok(v) => output::print_student_detail(&v, mode),
                    Err(e) => fail(e, mode),
                }
            }
            StudentSubcommand::Delete { id } => match client().delete_student(id) {
                Ok(v) => output::print_deleted(&v, mode),
                Err(e) => fail(e, mode),
            },
            StudentSubcommand::Import { file } => {
                let csv = std::fs::read_to_string(&file).unwrap_or_else(|e| {
                    fail(
                        CertisError::InvalidInput(format!(
                            "cannot read {}: {e}",
                            file.display()
                        )),
                        mode,
                    )
                });
                match client().import_students(csv) {
                    Ok(v) => output::print_import_report(&v, mode),
                    Err(e) => fail(e, mode),
                }
            }
            StudentSubcommand::Export { out } => match client().export_students() {
                Ok(csv) => write_out(out.as_deref(), &csv, mode),
                Err(e) => fail(e, mode),
            },
        },

        Commands::Cert { subcmd } => match subcmd {
            CertSubcommand::Issue {
                student_id,
                name,
                course,
                course_code,
                issued_on,
                year_of_study,
                summary,
            } => {
                let params = IssueCertificateParams {
                    student_id,
                    student_name: name,
                    course_name: course,
                    course_code,
                    issued_on,
                    year_of_study,
                    course_summary: summary,
                };
                match client().issue_certificate(&params) {
                    Ok(v) => output::print_certificate_detail(&v, mode),
                    Err(e) => fail(e, mode),
                }
            }
            CertSubcommand::List { page, limit } => {
                match client().list_certificates(PageQuery { page, limit }) {
                    Ok(v) => output::print_certificate_page(&v, mode),
                    Err(e) => fail(e, mode),
                }
            }
            CertSubcommand::Show { id } => match client().get_certificate(id) {
                Ok(v) => output::print_certificate_detail(&v, mode),
                Err(e) => fail(e, mode),
            },
            CertSubcommand::Update {
                id,
                name,
                course,
                course_code,
                year_of_study,
                summary,
            } => {
                let fields = CertificateUpdate {
                    student_name: name,
                    course_name: course,
                    course_code,
                    year_of_study,
                    course_summary: summary,
                };
                match client().update_certificate(id, &fields) {
                    Ok(v) => output::print_certificate_detail(&v, mode),
                    Err(e) => fail(e, mode),
                }
            }
            CertSubcommand::Revoke { id } => match client().revoke_certificate(id) {
                Ok(v) => output::print_certificate(&v, mode),
                Err(e) => fail(e, mode),
            },
            CertSubcommand::Delete { id } => match client().delete_certificate(id) {
                Ok(v) => output::print_deleted(&v, mode),
                Err(e) => fail(e, mode),
            },
            CertSubcommand::Qr { id } => match client().regenerate_qr(id) {
                Ok(v) => output::print_certificate_detail(&v, mode),
                Err(e) => fail(e, mode),
            },
            CertSubcommand::Export { out } => match client().export_certificates() {
                Ok(csv) => write_out(out.as_deref(), &csv, mode),
                Err(e) => fail(e, mode),
            },
        },

        Commands::Admin { subcmd } => match subcmd {
            AdminSubcommand::List { page, limit } => {
                match client().list_admins(PageQuery { page, limit }) {
                    Ok(v) => output::print_user_page(&v, mode),
                    Err(e) => fail(e, mode),
                }
            }
            AdminSubcommand::Update {
                id,
                first_name,
                last_name,
                email,
                phone,
                responsibility,
                year_of_employment,
                role,
            } => {
                let fields = UserUpdate {
                    first_name,
                    last_name,
                    email,
                    phone_number: phone,
                    responsibility,
                    year_of_employment,
                    role: role.as_deref().map(Role::parse_or_default),
                };
                match client().update_admin(id, &fields) {
                    Ok(v) => output::print_user(&v, mode),
                    Err(e) => fail(e, mode),
                }
            }
            AdminSubcommand::Delete { id } => match client().delete_admin(id) {
                Ok(v) => output::print_user(&v, mode),
                Err(e) => fail(e, mode),
            },
        },

        Commands::Verify { code } => match client().verify(&code) {
            Ok(v) => output::print_verification(&v, mode),
            Err(e) => fail(e, mode),
        },

        Commands::Dashboard => match client().dashboard() {
            Ok(v) => output::print_dashboard(&v, mode),
            Err(e) => fail(e, mode),
        },

        Commands::Backup { out } => match client().backup() {
            Ok(v) => match out {
                Some(path) => {
                    let body = serde_json::to_string_pretty(&v).unwrap_or_else(|e| {
                        fail(CertisError::Internal(e.to_string()), mode)
                    });
                    write_out(Some(&path), &body, mode);
                }
                None => output::print_json(&v),
            },
            Err(e) => fail(e, mode),
        },
    }
}
