use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgConnectOptions;
use std::{env, fmt, str::FromStr, time::Duration};

use crate::services::worker_invoker::DEFAULT_TIMEOUT;

/// Roughly 100ms per hash on current hardware.
const DEFAULT_BCRYPT_COST: u32 = 10;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: String,
    pub worker_program: String,
    pub worker_args: Vec<String>,
    pub worker_timeout: Duration,
    /// `None` leaves concurrent worker runs unbounded.
    pub max_concurrent_jobs: Option<usize>,
    pub require_upload_auth: bool,
    pub bcrypt_cost: u32,
    /// Request body cap for uploads. `None` disables the limit.
    pub upload_limit_bytes: Option<usize>,
    /// Full URL override; a `sqlite:` URL selects the SQLite backend.
    pub database_url: Option<String>,
    pub db: DbParams,
    pub db_max_connections: u32,
}

/// Postgres connection parts from `DB_USER`, `DB_HOST`, `DB_NAME`,
/// `DB_PASSWORD` and `DB_PORT`.
#[derive(Clone, Default)]
pub struct DbParams {
    pub user: Option<String>,
    pub host: Option<String>,
    pub name: Option<String>,
    pub password: Option<String>,
    pub port: Option<u16>,
}

impl DbParams {
    /// Unset parts fall back to libpq defaults (including `PG*` variables).
    pub fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new();
        if let Some(host) = &self.host {
            options = options.host(host);
        }
        if let Some(port) = self.port {
            options = options.port(port);
        }
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        if let Some(name) = &self.name {
            options = options.database(name);
        }
        options
    }
}

impl fmt::Debug for DbParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbParams")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("name", &self.name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Image upload and solver service")]
pub struct Args {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded images are stored (overrides UPLOAD_DIR)
    #[arg(long)]
    pub upload_dir: Option<String>,

    /// Worker executable (overrides WORKER_PROGRAM)
    #[arg(long)]
    pub worker_program: Option<String>,

    /// Argument passed to the worker before the image path; repeatable (overrides WORKER_ARGS)
    #[arg(long = "worker-arg")]
    pub worker_args: Vec<String>,

    /// Worker deadline in milliseconds (overrides WORKER_TIMEOUT_MS)
    #[arg(long)]
    pub worker_timeout_ms: Option<u64>,

    /// Maximum concurrent worker runs (overrides MAX_CONCURRENT_JOBS)
    #[arg(long)]
    pub max_concurrent_jobs: Option<usize>,

    /// Reject uploads without valid Basic credentials (or REQUIRE_UPLOAD_AUTH=true)
    #[arg(long)]
    pub require_upload_auth: bool,

    /// Database URL (overrides DATABASE_URL and the DB_* variables)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse `.env`, environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values from `lookup`, then over defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&lookup, "PORT")?.unwrap_or(4000);
        let env_upload = lookup("UPLOAD_DIR").unwrap_or_else(|| "./imgs".into());
        let env_program = lookup("WORKER_PROGRAM").unwrap_or_else(|| "python".into());
        let env_args = lookup("WORKER_ARGS")
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| vec!["public/solver.py".to_string()]);
        let env_timeout_ms = parse_var(&lookup, "WORKER_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_TIMEOUT.as_millis() as u64);
        let env_max_jobs = parse_var::<usize>(&lookup, "MAX_CONCURRENT_JOBS")?;
        let env_require_auth = parse_var::<bool>(&lookup, "REQUIRE_UPLOAD_AUTH")?.unwrap_or(false);
        let bcrypt_cost = parse_var(&lookup, "BCRYPT_COST")?.unwrap_or(DEFAULT_BCRYPT_COST);
        let upload_limit_bytes = parse_var::<usize>(&lookup, "UPLOAD_LIMIT_BYTES")?;
        let db_max_connections = parse_var(&lookup, "DB_MAX_CONNECTIONS")?.unwrap_or(5);

        let db = DbParams {
            user: lookup("DB_USER"),
            host: lookup("DB_HOST"),
            name: lookup("DB_NAME"),
            password: lookup("DB_PASSWORD"),
            port: parse_var(&lookup, "DB_PORT")?,
        };

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            upload_dir: args.upload_dir.unwrap_or(env_upload),
            worker_program: args.worker_program.unwrap_or(env_program),
            worker_args: if args.worker_args.is_empty() {
                env_args
            } else {
                args.worker_args
            },
            worker_timeout: Duration::from_millis(args.worker_timeout_ms.unwrap_or(env_timeout_ms)),
            max_concurrent_jobs: args.max_concurrent_jobs.or(env_max_jobs).filter(|n| *n > 0),
            require_upload_auth: args.require_upload_auth || env_require_auth,
            bcrypt_cost,
            upload_limit_bytes,
            database_url: args.database_url.or_else(|| lookup("DATABASE_URL")),
            db,
            db_max_connections,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_original_service() {
        let cfg = AppConfig::resolve(Args::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:4000");
        assert_eq!(cfg.upload_dir, "./imgs");
        assert_eq!(cfg.worker_program, "python");
        assert_eq!(cfg.worker_args, vec!["public/solver.py"]);
        assert_eq!(cfg.worker_timeout, Duration::from_millis(120_000));
        assert_eq!(cfg.max_concurrent_jobs, None);
        assert!(!cfg.require_upload_auth);
        assert_eq!(cfg.bcrypt_cost, 10);
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn reads_db_parts_from_env() {
        let cfg = AppConfig::resolve(
            Args::default(),
            env_of(&[
                ("DB_USER", "solver"),
                ("DB_HOST", "db.internal"),
                ("DB_NAME", "users"),
                ("DB_PASSWORD", "hunter2"),
                ("DB_PORT", "6543"),
            ]),
        )
        .unwrap();

        assert_eq!(cfg.db.user.as_deref(), Some("solver"));
        assert_eq!(cfg.db.port, Some(6543));
        let options = cfg.db.connect_options();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_username(), "solver");
        assert_eq!(options.get_database(), Some("users"));
        assert!(!format!("{:?}", cfg.db).contains("hunter2"));
    }

    #[test]
    fn args_override_env() {
        let args = Args {
            port: Some(8080),
            worker_args: vec!["--fast".into()],
            max_concurrent_jobs: Some(2),
            ..Args::default()
        };
        let cfg = AppConfig::resolve(
            args,
            env_of(&[
                ("PORT", "9000"),
                ("WORKER_ARGS", "solver.py --slow"),
                ("MAX_CONCURRENT_JOBS", "8"),
                ("REQUIRE_UPLOAD_AUTH", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.worker_args, vec!["--fast"]);
        assert_eq!(cfg.max_concurrent_jobs, Some(2));
        assert!(cfg.require_upload_auth);
    }

    #[test]
    fn worker_args_env_is_split_on_whitespace() {
        let cfg = AppConfig::resolve(
            Args::default(),
            env_of(&[("WORKER_ARGS", "  public/solver.py   --quiet ")]),
        )
        .unwrap();
        assert_eq!(cfg.worker_args, vec!["public/solver.py", "--quiet"]);
    }

    #[test]
    fn bad_numbers_are_reported_with_the_variable_name() {
        let err = AppConfig::resolve(Args::default(), env_of(&[("DB_PORT", "five")])).unwrap_err();
        assert!(err.to_string().contains("DB_PORT"));
    }
}
