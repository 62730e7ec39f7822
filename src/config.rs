use crate::display::Verbosity;
use crate::monitor::WatchTarget;
use crate::Cli;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "sqlwaitfor.toml";

/// Top-level configuration loaded from sqlwaitfor.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WaitConfig {
    pub connection: ConnectionConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub application: String,
    pub trust_cert: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
}

// --- Default implementations ---

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: None,
            username: None,
            password: None,
            application: env!("CARGO_PKG_NAME").to_string(),
            trust_cert: false,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

/// How the connection authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// Windows integrated authentication.
    Integrated,
    /// SQL Server login.
    SqlServer { username: String, password: String },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Integrated => write!(f, "Integrated"),
            Auth::SqlServer { username, .. } => f
                .debug_struct("SqlServer")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Everything needed to open the database session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    /// Named instance (`host\instance`), resolved through SQL Browser when no port is set.
    pub instance: Option<String>,
    pub port: Option<u16>,
    pub auth: Auth,
    pub application: String,
    pub trust_cert: bool,
}

impl ConnectionSettings {
    /// Human-readable server address for messages and logs.
    pub fn display_addr(&self) -> String {
        let mut addr = self.host.clone();
        if let Some(instance) = &self.instance {
            addr.push('\\');
            addr.push_str(instance);
        }
        if let Some(port) = self.port {
            addr.push_str(&format!(",{port}"));
        }
        addr
    }
}

/// Fully resolved run settings: config file, then CLI overrides, validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub target: WatchTarget,
    pub interval: Duration,
    pub verbosity: Verbosity,
}

/// Configuration problems detected before any connection is attempted.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// No server given on the command line or in the config file.
    MissingServer,
    /// Server string could not be split into host, instance and port.
    InvalidServer { server: String },
    /// A username was given without a password.
    MissingPassword,
    /// A password was given without a username.
    MissingUsername,
    /// Polling interval below one second.
    InvalidInterval { secs: u64 },
    /// Neither session IDs nor a login were given.
    MissingTarget,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::MissingServer => {
                write!(f, "no server given (use -S or [connection] server)")
            }
            ConfigError::InvalidServer { server } => {
                write!(f, "invalid server specification: {}", server)
            }
            ConfigError::MissingPassword => {
                write!(f, "SQL authentication needs a password (-p or SQLWAITFOR_PASSWORD)")
            }
            ConfigError::MissingUsername => {
                write!(f, "a password was given without a username (-u)")
            }
            ConfigError::InvalidInterval { secs } => {
                write!(f, "invalid polling interval: {} (minimum 1 second)", secs)
            }
            ConfigError::MissingTarget => {
                write!(f, "nothing to monitor (use -s or -L)")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Load the config file.
///
/// An explicit path must exist. Without one, `sqlwaitfor.toml` in the
/// working directory is used if present, and defaults otherwise.
pub fn load_config(explicit: Option<&Path>) -> Result<WaitConfig, ConfigError> {
    match explicit {
        Some(path) => read_config(path),
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            if path.exists() {
                read_config(path)
            } else {
                Ok(WaitConfig::default())
            }
        }
    }
}

fn read_config(path: &Path) -> Result<WaitConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Merge CLI flags over the config file and validate the result.
pub fn resolve(cli: &Cli, file: WaitConfig) -> Result<Settings, ConfigError> {
    let WaitConfig {
        connection: conn,
        monitor,
    } = file;

    let server = cli
        .server
        .clone()
        .or(conn.server)
        .filter(|s| !s.trim().is_empty())
        .ok_or(ConfigError::MissingServer)?;
    let (host, instance, embedded_port) = parse_server(&server)?;

    let auth = if cli.trusted {
        Auth::Integrated
    } else {
        let username = cli.username.clone().or(conn.username);
        let password = cli.password.clone().or(conn.password);
        match (username, password) {
            (Some(username), Some(password)) => Auth::SqlServer { username, password },
            (Some(_), None) => return Err(ConfigError::MissingPassword),
            (None, Some(_)) => return Err(ConfigError::MissingUsername),
            (None, None) => Auth::Integrated,
        }
    };

    let interval_secs = cli.interval.unwrap_or(monitor.interval_secs);
    if interval_secs < 1 {
        return Err(ConfigError::InvalidInterval {
            secs: interval_secs,
        });
    }

    let target = if !cli.spids.is_empty() {
        WatchTarget::Sessions(cli.spids.iter().copied().collect())
    } else if let Some(login) = &cli.login {
        WatchTarget::Login(login.clone())
    } else {
        return Err(ConfigError::MissingTarget);
    };

    Ok(Settings {
        connection: ConnectionSettings {
            host,
            instance,
            port: cli.port.or(embedded_port).or(conn.port),
            auth,
            application: conn.application,
            trust_cert: cli.trust_cert || conn.trust_cert,
        },
        target,
        interval: Duration::from_secs(interval_secs),
        verbosity: Verbosity::from_flags(cli.verbose, cli.quiet),
    })
}

/// Split `host`, `host\instance`, `host,port` or `host\instance,port`.
pub fn parse_server(server: &str) -> Result<(String, Option<String>, Option<u16>), ConfigError> {
    let invalid = || ConfigError::InvalidServer {
        server: server.to_string(),
    };

    let (name, port) = match server.split_once(',') {
        Some((name, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p > 0)
                .ok_or_else(invalid)?;
            (name, Some(port))
        }
        None => (server, None),
    };

    let (host, instance) = match name.split_once('\\') {
        Some((host, instance)) => (host.trim(), Some(instance.trim())),
        None => (name.trim(), None),
    };
    if host.is_empty() || instance.is_some_and(str::is_empty) {
        return Err(invalid());
    }

    Ok((
        host.to_string(),
        instance.map(str::to_string),
        port,
    ))
}
