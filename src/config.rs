use crate::cli::Cli;
use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default interval between idle checks
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a stopped backend gets between SIGTERM and SIGKILL
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Default pause between backend dial attempts
pub const DEFAULT_DIAL_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Contents of an optional TOML configuration file.
///
/// Every field is optional here; command-line flags fill in or override
/// whatever the file leaves out, and [`Config::resolve`] checks that the
/// merged result is complete.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub proxy: ProxySection,

    #[serde(default)]
    pub backend: BackendSection,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxySection {
    /// Address to accept client connections on (":8080" binds all interfaces)
    pub listen: Option<String>,

    /// Address the backend listens on once started
    pub forward: Option<String>,

    /// Inactivity period after which the backend is stopped
    pub idle_timeout: Option<String>,

    /// How often the idle timeout is checked (default: 5s)
    pub idle_check_interval: Option<String>,

    /// Time a stopped backend gets to exit before it is killed (default: 10s)
    pub stop_grace_period: Option<String>,

    /// What to do when the backend exits on its own (default: terminate)
    pub on_backend_exit: Option<ExitPolicy>,

    #[serde(default)]
    pub dial: DialSection,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DialSection {
    /// Pause between connection attempts to the backend (default: 100ms)
    pub retry_interval: Option<String>,

    /// Give up after this many failed attempts (default: never)
    pub max_attempts: Option<u32>,

    /// Give up after dialing for this long (default: never)
    pub max_wait: Option<String>,
}

/// Backend command settings
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// proxy. Configuration files must only be writable by trusted users.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackendSection {
    /// Executable, or a full shell-style command line when `args` is empty
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    pub working_dir: Option<String>,

    /// Extra environment variables for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Policy applied when the backend exits while it is supposed to be running
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExitPolicy {
    /// Stop the whole proxy with a non-zero status
    #[default]
    Terminate,
    /// Forget the dead backend; the next client connection launches a new one
    Restart,
}

/// How connection handlers dial the backend while it comes up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
    pub retry_interval: Duration,
    pub max_attempts: Option<u32>,
    pub max_wait: Option<Duration>,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_DIAL_RETRY_INTERVAL,
            max_attempts: None,
            max_wait: None,
        }
    }
}

impl DialPolicy {
    /// Whether another attempt is allowed after `attempts` failures spanning `waited`
    pub fn allows_retry(&self, attempts: u32, waited: Duration) -> bool {
        if self.max_attempts.is_some_and(|max| attempts >= max) {
            return false;
        }
        if self.max_wait.is_some_and(|max| waited >= max) {
            return false;
        }
        true
    }

    pub fn is_bounded(&self) -> bool {
        self.max_attempts.is_some() || self.max_wait.is_some()
    }
}

/// The backend to run and the addresses it is proxied between.
/// Fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    /// Address clients connect to
    pub listen: String,
    /// Address the backend accepts connections on
    pub forward: String,
}

impl BackendSpec {
    pub fn new(program: impl Into<String>, listen: impl Into<String>, forward: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            listen: listen.into(),
            forward: forward.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Port of the forward address, passed to the backend as `PORT`
    pub fn forward_port(&self) -> Option<u16> {
        self.forward.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
    }
}

/// Fully resolved runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendSpec,
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    pub stop_grace_period: Duration,
    pub exit_policy: ExitPolicy,
    pub dial: DialPolicy,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Config {
    /// Merge the optional config file with command-line flags and validate the result
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match cli.config {
            Some(ref path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(file, cli)
    }

    /// Flags take precedence over file values
    pub fn merge(file: FileConfig, cli: &Cli) -> Result<Self, ConfigError> {
        let FileConfig { proxy, backend } = file;

        let idle = cli
            .idle
            .clone()
            .or(proxy.idle_timeout)
            .ok_or(ConfigError::Missing("idle timeout (--idle)"))?;
        let listen = cli
            .listen
            .clone()
            .or(proxy.listen)
            .ok_or(ConfigError::Missing("listen address (--listen)"))?;
        let forward = cli
            .forward
            .clone()
            .or(proxy.forward)
            .ok_or(ConfigError::Missing("forward address (--forward)"))?;

        let idle_timeout = parse_duration(&idle)?;

        let idle_check_interval = match cli.check_interval.clone().or(proxy.idle_check_interval) {
            Some(text) => parse_duration(&text)?,
            None => DEFAULT_IDLE_CHECK_INTERVAL,
        };
        if idle_check_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "idle_check_interval",
                reason: "must be greater than zero".to_string(),
            });
        }

        let stop_grace_period = match cli.stop_grace_period.clone().or(proxy.stop_grace_period) {
            Some(text) => parse_duration(&text)?,
            None => DEFAULT_STOP_GRACE_PERIOD,
        };

        let exit_policy = cli.on_backend_exit.or(proxy.on_backend_exit).unwrap_or_default();

        let dial = resolve_dial(proxy.dial, cli)?;

        let (program, args) = if let Some((program, args)) = cli.command.split_first() {
            (program.clone(), args.to_vec())
        } else {
            split_command(backend.command, backend.args)?
        };

        let spec = BackendSpec {
            program,
            args,
            working_dir: backend.working_dir,
            env: backend.env,
            listen: normalize_listen_addr(&listen),
            forward,
        };

        Ok(Self {
            backend: spec,
            idle_timeout,
            idle_check_interval,
            stop_grace_period,
            exit_policy,
            dial,
        })
    }
}

fn resolve_dial(section: DialSection, cli: &Cli) -> Result<DialPolicy, ConfigError> {
    let retry_interval = match section.retry_interval {
        Some(text) => parse_duration(&text)?,
        None => DEFAULT_DIAL_RETRY_INTERVAL,
    };
    if retry_interval.is_zero() {
        return Err(ConfigError::Invalid {
            field: "dial.retry_interval",
            reason: "must be greater than zero".to_string(),
        });
    }

    let max_wait = match cli.dial_max_wait.clone().or(section.max_wait) {
        Some(text) => Some(parse_duration(&text)?),
        None => None,
    };

    Ok(DialPolicy {
        retry_interval,
        max_attempts: cli.dial_max_attempts.or(section.max_attempts),
        max_wait,
    })
}

fn split_command(
    command: Option<String>,
    args: Vec<String>,
) -> Result<(String, Vec<String>), ConfigError> {
    let command = command
        .filter(|c| !c.trim().is_empty())
        .ok_or(ConfigError::Missing("backend command"))?;

    if !args.is_empty() {
        return Ok((command, args));
    }

    let mut words = shell_words::split(&command).map_err(|e| ConfigError::Invalid {
        field: "backend.command",
        reason: e.to_string(),
    })?;
    if words.is_empty() {
        return Err(ConfigError::Missing("backend command"));
    }
    let program = words.remove(0);
    Ok((program, words))
}

/// Expand the ":port" shorthand to an all-interfaces bind address
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Parse a duration such as "300ms", "5s", "1m30s" or "1.5h"
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason| ConfigError::InvalidDuration {
        value: text.to_string(),
        reason,
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty duration"));
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut rest = trimmed;
    let mut total_nanos: f64 = 0.0;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| invalid("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };
        rest = &rest[unit_len..];

        total_nanos += value * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
