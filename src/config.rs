use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `auth.mode`
pub const ENV_MODE: &str = "GATEWAY_MODE";
/// Environment variable overriding `auth.identity_domain`
pub const ENV_IDENTITY_DOMAIN: &str = "ACCESS_TEAM_DOMAIN";
/// Environment variable overriding `auth.policy_audience`
pub const ENV_POLICY_AUDIENCE: &str = "ACCESS_POLICY_AUD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid gateway mode '{0}' (expected 'dev' or 'prod')")]
    InvalidMode(String),
    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Identity verification configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// The single supervised backend
    #[serde(default)]
    pub container: ContainerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum idle connections kept to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle backend connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Whether requests are verified against the identity provider
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// Every request is authenticated as a fixed local identity
    Dev,
    /// Tokens are verified against the provider's key set
    #[default]
    Prod,
}

impl std::str::FromStr for GatewayMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(GatewayMode::Dev),
            "prod" => Ok(GatewayMode::Prod),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayMode::Dev => f.write_str("dev"),
            GatewayMode::Prod => f.write_str("prod"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// `dev` bypasses all verification
    #[serde(default)]
    pub mode: GatewayMode,

    /// Issuer base: a bare team name or a full URL (secret)
    pub identity_domain: Option<String>,

    /// Audience tag the token must carry (secret)
    pub policy_audience: Option<String>,

    /// Request header carrying the signed assertion
    #[serde(default = "default_token_header")]
    pub token_header: String,

    /// Suffix appended to bare team names to form the hosted issuer
    #[serde(default = "default_hosted_domain_suffix")]
    pub hosted_domain_suffix: String,

    /// Key set lifetime when the provider sends no cache directive
    #[serde(default = "default_key_cache_ttl")]
    pub key_cache_ttl_secs: u64,

    /// Minimum spacing between forced refreshes for unknown key ids
    #[serde(default = "default_key_refresh_cooldown")]
    pub key_refresh_cooldown_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::default(),
            identity_domain: None,
            policy_audience: None,
            token_header: default_token_header(),
            hosted_domain_suffix: default_hosted_domain_suffix(),
            key_cache_ttl_secs: default_key_cache_ttl(),
            key_refresh_cooldown_secs: default_key_refresh_cooldown(),
        }
    }
}

impl AuthConfig {
    /// Dev-mode config, used by tests and local runs
    pub fn dev() -> Self {
        Self {
            mode: GatewayMode::Dev,
            ..Self::default()
        }
    }

    /// Prod-mode config with both secrets set
    pub fn prod(identity_domain: &str, policy_audience: &str) -> Self {
        Self {
            mode: GatewayMode::Prod,
            identity_domain: Some(identity_domain.to_string()),
            policy_audience: Some(policy_audience.to_string()),
            ..Self::default()
        }
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_secs)
    }

    pub fn key_refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.key_refresh_cooldown_secs)
    }

    /// Names of the prod secrets that are absent or blank
    pub fn missing_secrets(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if is_blank(&self.identity_domain) {
            missing.push("identity_domain");
        }
        if is_blank(&self.policy_audience) {
            missing.push("policy_audience");
        }
        missing
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).map_or(true, str::is_empty)
}

/// Configuration for the supervised backend
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the gateway's permissions.
/// Configuration files must be readable only by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct ContainerConfig {
    /// Fixed identifier the gateway resolves its backend by
    #[serde(default = "default_binding")]
    pub binding: String,

    /// Command that starts the backend. When absent the backend is attached:
    /// it is managed externally and only polled for readiness.
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Fixed internal port the backend listens on
    #[serde(default = "default_container_port")]
    pub port: u16,

    /// Readiness check path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Idle window before the backend is stopped (default: 5 minutes)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum time a cold start may take
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Readiness poll interval during a cold start
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// How often the idle monitor inspects the handle
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binding: default_binding(),
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            port: default_container_port(),
            health_path: default_health_path(),
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            health_check_interval_ms: default_health_interval(),
            idle_check_interval_ms: default_idle_check_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl ContainerConfig {
    /// Backend spawned by the supervisor
    pub fn local(command: &str, port: u16) -> Self {
        Self {
            command: Some(command.to_string()),
            port,
            ..Self::default()
        }
    }

    /// Externally managed backend on `port`
    pub fn attached(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn is_attached(&self) -> bool {
        self.command.is_none()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.binding.trim().is_empty() {
            errors.push("container: 'binding' must not be empty".to_string());
        }
        if self.port == 0 {
            errors.push("container: 'port' must be greater than 0".to_string());
        }
        if self.idle_timeout_secs == 0 {
            errors.push("container: 'idle_timeout_secs' must be greater than 0".to_string());
        }
        if self.startup_timeout_secs == 0 {
            errors.push("container: 'startup_timeout_secs' must be greater than 0".to_string());
        }
        if !self.health_path.starts_with('/') {
            errors.push("container: 'health_path' must start with '/'".to_string());
        }
        if matches!(self.command.as_deref(), Some(c) if c.trim().is_empty()) {
            errors.push("container: 'command' must not be empty when set".to_string());
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_token_header() -> String {
    "cf-access-jwt-assertion".to_string()
}

fn default_hosted_domain_suffix() -> String {
    "cloudflareaccess.com".to_string()
}

fn default_key_cache_ttl() -> u64 {
    600 // 10 minutes
}

fn default_key_refresh_cooldown() -> u64 {
    30
}

fn default_binding() -> String {
    "BACKEND".to_string()
}

fn default_container_port() -> u16 {
    8080
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    100
}

fn default_idle_check_interval() -> u64 {
    1000
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Config {
    /// Read, apply environment overrides, and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply secret and mode overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup(ENV_MODE) {
            self.auth.mode = mode.parse()?;
        }
        if let Some(domain) = lookup(ENV_IDENTITY_DOMAIN) {
            self.auth.identity_domain = Some(domain);
        }
        if let Some(audience) = lookup(ENV_POLICY_AUDIENCE) {
            self.auth.policy_audience = Some(audience);
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if self.auth.token_header.trim().is_empty() {
            errors.push("auth: 'token_header' must not be empty".to_string());
        }
        if hyper::header::HeaderName::from_bytes(self.auth.token_header.as_bytes()).is_err() {
            errors.push(format!(
                "auth: 'token_header' is not a valid header name: {}",
                self.auth.token_header
            ));
        }
        self.container.validate(&mut errors);

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "127.0.0.1"

[auth]
mode = "prod"
identity_domain = "team"
policy_audience = "policy-123"

[container]
binding = "SITE"
command = "node"
args = ["server.js"]
port = 3000
idle_timeout_secs = 120
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.auth.mode, GatewayMode::Prod);
        assert_eq!(config.auth.identity_domain.as_deref(), Some("team"));
        assert_eq!(config.container.binding, "SITE");
        assert_eq!(config.container.args, vec!["server.js".to_string()]);
        assert_eq!(config.container.idle_timeout(), Duration::from_secs(120));
        assert!(!config.container.is_attached());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.auth.mode, GatewayMode::Prod);
        assert_eq!(config.auth.token_header, "cf-access-jwt-assertion");
        assert_eq!(config.auth.hosted_domain_suffix, "cloudflareaccess.com");
        assert_eq!(config.container.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.container.binding, "BACKEND");
        assert!(config.container.is_attached());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result: Result<Config, _> = toml::from_str("[auth]\nmode = \"staging\"\n");
        assert!(result.is_err());
        assert!(matches!("staging".parse::<GatewayMode>(), Err(ConfigError::InvalidMode(_))));
    }

    #[test]
    fn test_mode_parsing_is_case_insensitive() {
        assert_eq!("DEV".parse::<GatewayMode>().unwrap(), GatewayMode::Dev);
        assert_eq!(" prod ".parse::<GatewayMode>().unwrap(), GatewayMode::Prod);
        assert_eq!(GatewayMode::Dev.to_string(), "dev");
    }

    #[test]
    fn test_env_overrides_secrets() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            (ENV_MODE, "prod"),
            (ENV_IDENTITY_DOMAIN, "team"),
            (ENV_POLICY_AUDIENCE, "aud-1"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.auth.identity_domain.as_deref(), Some("team"));
        assert_eq!(config.auth.policy_audience.as_deref(), Some("aud-1"));
        assert!(config.auth.missing_secrets().is_empty());
    }

    #[test]
    fn test_env_override_rejects_bad_mode() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == ENV_MODE).then(|| "qa".to_string()));
        assert!(matches!(result, Err(ConfigError::InvalidMode(m)) if m == "qa"));
    }

    #[test]
    fn test_missing_secrets() {
        let config = AuthConfig::default();
        assert_eq!(config.missing_secrets(), vec!["identity_domain", "policy_audience"]);

        let config = AuthConfig {
            identity_domain: Some("  ".to_string()),
            policy_audience: Some("aud".to_string()),
            ..AuthConfig::default()
        };
        assert_eq!(config.missing_secrets(), vec!["identity_domain"]);

        assert!(AuthConfig::prod("team", "aud").missing_secrets().is_empty());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.container.port = 0;
        config.container.idle_timeout_secs = 0;
        config.container.health_path = "health".to_string();

        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'port' must be greater than 0"));
        assert!(message.contains("'idle_timeout_secs'"));
        assert!(message.contains("'health_path'"));
    }

    #[test]
    fn test_validate_rejects_bad_header_name() {
        let mut config = Config::default();
        config.auth.token_header = "bad header".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_container_helpers() {
        let local = ContainerConfig::local("node", 3000).with_args(vec!["app.js".to_string()]);
        assert_eq!(local.command.as_deref(), Some("node"));
        assert_eq!(local.port, 3000);
        assert_eq!(local.args.len(), 1);

        let attached = ContainerConfig::attached(4000);
        assert!(attached.is_attached());
        assert_eq!(attached.port, 4000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[auth]\nmode = \"dev\"\n\n[container]\nport = 5000\nstartup_timeout_secs = 5\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.container.port, 5000);
        assert_eq!(config.container.startup_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/accessgate.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
