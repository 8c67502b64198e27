//! Purpose: `clickdump` CLI entry point: parse args, install logging, dispatch commands.
//! Role: Binary crate root; builds the query client and storage backend explicitly per run.
//! Invariants: Command results are JSON on stdout; logs and errors go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use clap::builder::RangedU64ValueParser;
use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clickdump::clickhouse::HttpQueryClient;
use clickdump::core::codec::Compression;
use clickdump::core::error::{Error, ErrorKind, to_exit_code};
use clickdump::filter::{Filters, NameFilter};
use clickdump::storage::{S3Config, Storage, StorageConfig, open_storage};
use serde_json::{Map, Value, json};
use time::macros::format_description;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                let message = err
                    .to_string()
                    .lines()
                    .next()
                    .unwrap_or("invalid arguments")
                    .trim_start_matches("error: ")
                    .to_string();
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(message)
                        .with_hint("Run `clickdump --help` for usage."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    init_tracing(cli.log_level.as_deref());
    command_dispatch::dispatch_command(cli.command).map_err(|err| (err, color_mode))
}

fn init_tracing(level: Option<&str>) {
    let env_filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "clickdump",
    version,
    about = "Export ClickHouse schema and data to storage, and restore it",
    long_about = None,
    after_help = r#"EXAMPLES
  $ clickdump dump --backup nightly --storage file --path /var/backups/ch
  $ clickdump dump --compression zstd --parallelism 4 --storage s3 --s3-bucket ch-backups \
      --s3-access-key AKIA... --s3-secret-key-file ~/.s3-secret
  $ clickdump list --storage file --path /var/backups/ch
  $ clickdump restore --backup nightly --storage file --path /var/backups/ch

NOTES
  - Objects: <backup>/<db>.database.sql, <backup>/<db>/<table>.{schema,data}.sql[.gz|.zstd]
  - Restore replays descriptors, then schemas, then data; re-running duplicates rows"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        value_name = "FILTER",
        help = "Log filter, e.g. info or clickdump=debug (default: RUST_LOG or info)"
    )]
    log_level: Option<String>,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CompressionArg {
    Gzip,
    Zstd,
    None,
}

impl From<CompressionArg> for Compression {
    fn from(value: CompressionArg) -> Self {
        match value {
            CompressionArg::Gzip => Compression::Gzip,
            CompressionArg::Zstd => Compression::Zstd,
            CompressionArg::None => Compression::None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StorageKind {
    File,
    S3,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Export databases and tables into a backup",
        after_help = r#"EXAMPLES
  $ clickdump dump --backup nightly --path ./backups
  $ clickdump dump --databases sales,logs --exclude-tables tmp --compression zstd --path ./backups"#
    )]
    Dump {
        #[arg(long, help = "Backup name (default: UTC timestamp)")]
        backup: Option<String>,
        #[arg(long, default_value = "gzip", value_enum, help = "Object compression")]
        compression: CompressionArg,
        #[arg(
            long,
            default_value_t = 0,
            help = "Compression level (gzip 1-9, zstd 1-22; 0 = codec default)"
        )]
        compression_level: i32,
        #[arg(
            long,
            default_value_t = 1,
            value_parser = parallelism_parser(),
            help = "Tables exported concurrently"
        )]
        parallelism: usize,
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        filters: FilterArgs,
        #[command(flatten)]
        storage: StorageArgs,
    },
    #[command(
        about = "Replay a backup into the destination server",
        after_help = r#"EXAMPLES
  $ clickdump restore --backup nightly --path ./backups
  $ clickdump restore --backup nightly --databases sales --parallelism 4 --path ./backups"#
    )]
    Restore {
        #[arg(long, help = "Backup name to restore")]
        backup: String,
        #[arg(
            long,
            default_value_t = 1,
            value_parser = parallelism_parser(),
            help = "Objects replayed concurrently per phase"
        )]
        parallelism: usize,
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        filters: FilterArgs,
        #[command(flatten)]
        storage: StorageArgs,
    },
    #[command(about = "List backups, or the objects of one backup")]
    List {
        #[arg(long, help = "Backup whose objects to list")]
        backup: Option<String>,
        #[command(flatten)]
        storage: StorageArgs,
    },
}

fn parallelism_parser() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::<usize>::new().range(1..=1024)
}

#[derive(Args, Clone, Debug)]
#[command(next_help_heading = "ClickHouse connection")]
struct ConnectionArgs {
    #[arg(long, default_value = "http://localhost:8123", help = "ClickHouse HTTP URL")]
    host: String,
    #[arg(long, default_value = "default", help = "ClickHouse user")]
    user: String,
    #[arg(long, help = "Password (dev-only; prefer --password-file)")]
    password: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        conflicts_with = "password",
        value_hint = ValueHint::FilePath,
        help = "Read the password from a file"
    )]
    password_file: Option<PathBuf>,
    #[arg(
        long = "tls-ca",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        help = "Trust this PEM CA/certificate for ClickHouse TLS"
    )]
    tls_ca: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
#[command(next_help_heading = "Filters")]
struct FilterArgs {
    #[arg(long, value_delimiter = ',', help = "Only these databases")]
    databases: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Skip these databases")]
    exclude_databases: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Only these tables")]
    tables: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Skip these tables")]
    exclude_tables: Vec<String>,
}

#[derive(Args, Clone, Debug)]
#[command(next_help_heading = "Storage")]
struct StorageArgs {
    #[arg(long, default_value = "file", value_enum, help = "Storage backend: file|s3")]
    storage: StorageKind,
    #[arg(
        long,
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        help = "Read the backend from a JSON file, e.g. {\"type\":\"file\",\"path\":\"/backups\"} (overrides the other storage flags)"
    )]
    storage_config: Option<PathBuf>,
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath, help = "Root directory (file)")]
    path: Option<PathBuf>,
    #[arg(long, help = "Bucket (s3)")]
    s3_bucket: Option<String>,
    #[arg(long, help = "Region (s3, default us-east-1)")]
    s3_region: Option<String>,
    #[arg(long, help = "Endpoint URL for S3-compatible servers (s3)")]
    s3_endpoint: Option<String>,
    #[arg(long, help = "Key prefix under the bucket (s3)")]
    s3_prefix: Option<String>,
    #[arg(long, help = "Access key id (s3)")]
    s3_access_key: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        help = "Read the secret access key from a file (s3)"
    )]
    s3_secret_key_file: Option<PathBuf>,
    #[arg(long, help = "Use path-style addressing (s3)")]
    s3_path_style: bool,
}

impl FilterArgs {
    fn to_filters(&self) -> Filters {
        Filters {
            databases: NameFilter::lists(self.databases.clone(), self.exclude_databases.clone()),
            tables: NameFilter::lists(self.tables.clone(), self.exclude_tables.clone()),
        }
    }
}

impl ConnectionArgs {
    fn connect(&self) -> Result<HttpQueryClient, Error> {
        let password = match &self.password_file {
            Some(path) => Some(read_secret_file(path, "password")?),
            None => self.password.clone(),
        };
        let client = HttpQueryClient::new(&self.host)?.with_credentials(self.user.clone(), password);
        match &self.tls_ca {
            Some(path) => client.with_tls_ca_file(path),
            None => Ok(client),
        }
    }
}

impl StorageArgs {
    fn to_config(&self) -> Result<StorageConfig, Error> {
        if let Some(path) = &self.storage_config {
            let text = fs::read_to_string(path).map_err(|err| {
                Error::new(ErrorKind::Config)
                    .with_message(format!("failed to read storage config {}", path.display()))
                    .with_source(err)
            })?;
            return StorageConfig::from_json(&text)
                .map_err(|err| err.with_object(path.display().to_string()));
        }
        match self.storage {
            StorageKind::File => {
                let path = self.path.clone().ok_or_else(|| {
                    Error::new(ErrorKind::Config)
                        .with_message("file storage requires --path")
                        .with_hint("Pass --path <dir>.")
                })?;
                Ok(StorageConfig::File { path })
            }
            StorageKind::S3 => {
                let secret_key = match &self.s3_secret_key_file {
                    Some(path) => read_secret_file(path, "s3 secret key")?,
                    None => String::new(),
                };
                Ok(StorageConfig::S3(S3Config {
                    bucket: self.s3_bucket.clone().unwrap_or_default(),
                    region: self.s3_region.clone().unwrap_or_default(),
                    endpoint: self.s3_endpoint.clone(),
                    prefix: self.s3_prefix.clone().unwrap_or_default(),
                    access_key: self.s3_access_key.clone().unwrap_or_default(),
                    secret_key,
                    path_style: self.s3_path_style,
                    part_size: None,
                }))
            }
        }
    }

    fn open(&self) -> Result<Box<dyn Storage>, Error> {
        open_storage(&self.to_config()?)
    }
}

fn read_secret_file(path: &Path, what: &str) -> Result<String, Error> {
    let contents = fs::read_to_string(path).map_err(|err| {
        Error::new(ErrorKind::Config)
            .with_message(format!("failed to read {what} file {}", path.display()))
            .with_source(err)
    })?;
    let secret = contents.trim().to_string();
    if secret.is_empty() {
        return Err(Error::new(ErrorKind::Config)
            .with_message(format!("{what} file {} is empty", path.display())));
    }
    Ok(secret)
}

fn default_backup_name() -> Result<String, Error> {
    time::OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]T[hour][minute][second]Z"))
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to format backup timestamp")
                .with_source(err)
        })
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

const SGR_RED: u8 = 31;
const SGR_YELLOW: u8 = 33;

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    let rendered = if is_tty {
        error_text(err, color_mode.use_color(is_tty))
    } else {
        error_json(err).to_string()
    };
    eprintln!("{rendered}");
}

/// Diagnostic fields of `err` in display order; `kind` and `message` are always present.
fn error_fields(err: &Error) -> Vec<(&'static str, Value)> {
    let mut fields = vec![
        ("kind", json!(format!("{:?}", err.kind()))),
        ("message", json!(error_message(err))),
    ];
    let optional = [
        ("hint", err.hint()),
        ("object", err.object()),
        ("statement", err.statement()),
    ];
    fields.extend(
        optional
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name, json!(value)))),
    );
    if !err.candidates().is_empty() {
        fields.push(("candidates", json!(err.candidates())));
    }
    let causes = std::iter::successors(err.source(), |source| (*source).source())
        .map(|source| source.to_string())
        .collect::<Vec<_>>();
    if !causes.is_empty() {
        fields.push(("causes", json!(causes)));
    }
    fields
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::Config => "configuration error",
        ErrorKind::NotFound => "not found",
        ErrorKind::Io => "i/o error",
        ErrorKind::Execution => "statement rejected",
    }
    .to_string()
}

fn error_json(err: &Error) -> Value {
    let fields = error_fields(err)
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect::<Map<_, _>>();
    json!({ "error": fields })
}

fn error_text(err: &Error, use_color: bool) -> String {
    let paint = |label: &str, sgr: u8| {
        if use_color {
            format!("\u{1b}[{sgr}m{label}\u{1b}[0m")
        } else {
            label.to_string()
        }
    };
    error_fields(err)
        .into_iter()
        .filter(|(name, _)| *name != "kind")
        .map(|(name, value)| {
            let text = match value {
                Value::String(text) => text,
                Value::Array(items) => items
                    .iter()
                    .map(|item| item.as_str().unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join(", "),
                other => other.to_string(),
            };
            match name {
                "message" => format!("{} {text}", paint("error:", SGR_RED)),
                "candidates" => format!("{} {text}", paint("tried:", SGR_YELLOW)),
                "causes" => format!("{} {text}", paint("caused by:", SGR_YELLOW)),
                _ => format!("{} {text}", paint(&format!("{name}:"), SGR_YELLOW)),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
