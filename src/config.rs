//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_ADMIN_PASSWORD: &str = "admin123";
pub const ADMIN_COOKIE_NAME: &str = "SHELF_SESSION";
pub const UNLOCK_COOKIE_NAME: &str = "SHELF_UNLOCK";
pub const CATEGORY_PASSWORD_HEADER: &str = "x-category-password";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;
pub const DEFAULT_UNLOCK_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 10;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "project-shelf", version = VERSION_INFO, about = "Project Shelf server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "SHELF_STORAGE_DIR",
        default_value = ".shelf/uploads",
        help = "Directory for uploaded files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'd',
        long,
        env = "SHELF_DATA_DIR",
        default_value = ".shelf/data",
        help = "Directory for JSON metadata documents"
    )]
    pub data_dir: String,
    #[arg(
        long,
        env = "SHELF_ADMIN_PASSWORD",
        default_value = DEFAULT_ADMIN_PASSWORD,
        help = "Admin password"
    )]
    pub admin_password: String,
    #[arg(
        short = 'b',
        long,
        env = "SHELF_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "SHELF_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "SHELF_HTTPS_PORT",
        help = "HTTPS port (HTTPS is disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "SHELF_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "SHELF_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "SHELF_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "SHELF_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        value_parser = clap::value_parser!(u64).range(..=MAX_TTL_SECS),
        help = "Admin session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "SHELF_UNLOCK_TTL_SECS",
        default_value_t = DEFAULT_UNLOCK_TTL_SECS,
        value_parser = clap::value_parser!(u64).range(..=MAX_TTL_SECS),
        help = "Category unlock expiration in seconds"
    )]
    pub unlock_ttl_secs: u64,
    #[arg(
        long,
        env = "SHELF_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max password attempts before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "SHELF_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        value_parser = clap::value_parser!(u64).range(..=MAX_TTL_SECS),
        help = "Password attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "SHELF_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        value_parser = clap::value_parser!(u64).range(..=MAX_TTL_SECS),
        help = "Lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "SHELF_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "SHELF_READ_ONLY",
        default_value_t = false,
        help = "Reject every modification, even from the admin"
    )]
    pub read_only: bool,
    #[arg(
        long,
        env = "SHELF_TRUST_PROXY",
        default_value_t = false,
        help = "Use x-forwarded-for as the client address (only behind a reverse proxy)"
    )]
    pub trust_proxy: bool,
}
