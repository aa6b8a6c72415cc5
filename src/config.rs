use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub rate_limiting: RateLimitingConfig,
    pub caching: CachingConfig,
    pub proxy: ProxyConfig,
    pub health_check: HealthCheckConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub body_limit_bytes: usize,
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Include internal error detail in response bodies (development only)
    pub expose_error_details: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            allowed_origins: vec!["*".to_string()],
            body_limit_bytes: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            expose_error_details: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub algorithm: String,
    pub exempt_paths: Vec<String>,
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: None,
            algorithm: "HS256".to_string(),
            exempt_paths: vec![
                "/health".to_string(),
                "/documentation".to_string(),
                "/metrics".to_string(),
            ],
            leeway_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub enabled: bool,
    #[serde(with = "duration_serde")]
    pub window: Duration,
    pub max_requests: u64,
    pub exempt_paths: Vec<String>,
    /// Key unauthenticated callers by `x-api-key`. Only enable behind an edge
    /// that validates the header; otherwise the source address is used.
    pub trust_api_key: bool,
    /// Windows untouched for this long are evicted by the sweep
    #[serde(with = "duration_serde")]
    pub idle_ttl: Duration,
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
    pub routes: Vec<RouteRateLimit>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 100,
            exempt_paths: vec!["/health".to_string(), "/documentation".to_string()],
            trust_api_key: true,
            idle_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            routes: Vec::new(),
        }
    }
}

/// Rate-limit override for every path under `prefix`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteRateLimit {
    pub prefix: String,
    #[serde(with = "duration_serde")]
    pub window: Duration,
    pub max_requests: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CachingConfig {
    pub enabled: bool,
    pub max_entries: usize,
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
    pub rules: Vec<CacheRule>,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            sweep_interval: Duration::from_secs(60),
            rules: vec![CacheRule {
                prefix: "/health".to_string(),
                ttl_seconds: 60,
                key_prefix: "health:".to_string(),
                methods: default_cache_methods(),
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheRule {
    pub prefix: String,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default = "default_cache_methods")]
    pub methods: Vec<String>,
}

fn default_cache_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub pool_idle_timeout: Duration,
    pub routes: Vec<RouteConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            pool_idle_timeout: Duration::from_secs(90),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub name: String,
    pub prefix: String,
    pub target: String,
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/health".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Consecutive passing checks before an unhealthy route recovers
    pub healthy_threshold: u32,
    /// Consecutive failing checks before a route is marked unhealthy
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, overlay the process environment, validate.
    ///
    /// A missing file is not an error: every option has a default and the
    /// environment may supply the rest.
    pub async fn load(path: &str) -> Result<Self> {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_yaml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, using defaults", path);
                Config::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file: {}", path));
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment-style key/value settings
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port.parse().with_context(|| format!("Invalid PORT: {}", port))?;
        }
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }
        if let Some(limit) = lookup("BODY_LIMIT_BYTES") {
            self.server.body_limit_bytes = limit
                .parse()
                .with_context(|| format!("Invalid BODY_LIMIT_BYTES: {}", limit))?;
        }
        if let Some(timeout) = lookup("REQUEST_TIMEOUT_MS") {
            let ms: u64 = timeout
                .parse()
                .with_context(|| format!("Invalid REQUEST_TIMEOUT_MS: {}", timeout))?;
            self.server.request_timeout = Duration::from_millis(ms);
        }
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.secret = secret;
        }
        if let Some(issuer) = lookup("JWT_ISSUER") {
            self.auth.issuer = Some(issuer);
        }
        if let Some(window) = lookup("RATE_LIMIT_WINDOW_MS") {
            let ms: u64 = window
                .parse()
                .with_context(|| format!("Invalid RATE_LIMIT_WINDOW_MS: {}", window))?;
            self.rate_limiting.window = Duration::from_millis(ms);
        }
        if let Some(max) = lookup("RATE_LIMIT_MAX") {
            self.rate_limiting.max_requests = max
                .parse()
                .with_context(|| format!("Invalid RATE_LIMIT_MAX: {}", max))?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => anyhow::bail!("Invalid LOG_FORMAT: {}", other),
            };
        }

        for route in &mut self.proxy.routes {
            let key = format!("UPSTREAM_{}_URL", route.name.to_uppercase().replace('-', "_"));
            if let Some(target) = lookup(&key) {
                route.target = target;
            }
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        if self.server.body_limit_bytes == 0 {
            anyhow::bail!("Request body limit cannot be zero");
        }

        if self.auth.secret.is_empty() {
            anyhow::bail!("Token verification secret must be set (auth.secret or JWT_SECRET)");
        }

        if self.rate_limiting.window.is_zero() || self.rate_limiting.max_requests == 0 {
            anyhow::bail!("Rate limit window and max_requests must be positive");
        }

        for limit in &self.rate_limiting.routes {
            if !limit.prefix.starts_with('/') {
                anyhow::bail!("Rate limit prefix must start with '/': {}", limit.prefix);
            }
            if limit.window.is_zero() || limit.max_requests == 0 {
                anyhow::bail!("Rate limit for '{}' must have a positive window and max", limit.prefix);
            }
        }

        for rule in &self.caching.rules {
            if !rule.prefix.starts_with('/') {
                anyhow::bail!("Cache rule prefix must start with '/': {}", rule.prefix);
            }
        }

        if self.health_check.healthy_threshold == 0 || self.health_check.unhealthy_threshold == 0 {
            anyhow::bail!("Health check thresholds must be positive");
        }

        let mut prefixes = HashSet::new();
        for route in &self.proxy.routes {
            if !route.prefix.starts_with('/') {
                anyhow::bail!("Route '{}' prefix must start with '/'", route.name);
            }
            if !prefixes.insert(route.prefix.trim_end_matches('/')) {
                anyhow::bail!("Duplicate route prefix: {}", route.prefix);
            }

            let url = reqwest::Url::parse(&route.target)
                .with_context(|| format!("Route '{}' has an invalid target: {}", route.name, route.target))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                anyhow::bail!("Route '{}' target must be http or https", route.name);
            }
        }

        Ok(())
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = duration.as_millis();
        if ms % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", ms / 1000))
        } else {
            serializer.serialize_str(&format!("{}ms", ms))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(
        s: &str,
    ) -> std::result::Result<Duration, Box<dyn std::error::Error + Send + Sync>> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(num.trim().parse()?))
        } else if let Some(num) = s.strip_suffix('m') {
            Ok(Duration::from_secs(num.trim().parse::<u64>()? * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            Ok(Duration::from_secs(num.trim().parse::<u64>()? * 3600))
        } else {
            Ok(Duration::from_secs(s.parse()?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.auth.secret = "test-secret".to_string();
        config.proxy.routes.push(RouteConfig {
            name: "lead-management".to_string(),
            prefix: "/api/v1/leads".to_string(),
            target: "http://localhost:3002".to_string(),
            strip_prefix: true,
            health_path: "/health".to_string(),
        });
        config
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(duration_serde::parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(duration_serde::parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(duration_serde::parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(duration_serde::parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(duration_serde::parse_duration("15").unwrap(), Duration::from_secs(15));
        assert!(duration_serde::parse_duration("soon").is_err());
    }

    #[test]
    fn test_yaml_with_partial_sections_uses_defaults() {
        let yaml = r#"
server:
  port: 8080
auth:
  secret: abc
rate_limiting:
  window: 250ms
  routes:
    - prefix: /api/v1/auth
      window: 1m
      max_requests: 5
proxy:
  routes:
    - name: users
      prefix: /api/v1/users
      target: http://users:3001
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.body_limit_bytes, 10 * 1024 * 1024);
        assert_eq!(config.rate_limiting.window, Duration::from_millis(250));
        assert_eq!(config.rate_limiting.max_requests, 100);
        assert_eq!(config.rate_limiting.routes[0].window, Duration::from_secs(60));
        assert!(config.proxy.routes[0].strip_prefix);
        assert_eq!(config.caching.rules[0].prefix, "/health");
        assert_eq!(config.caching.rules[0].ttl_seconds, 60);
        config.validate().unwrap();
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config: Config = serde_yaml::from_str(include_str!("../config.yaml")).unwrap();
        assert_eq!(config.proxy.routes.len(), 3);
        assert_eq!(config.rate_limiting.routes[0].window, Duration::from_secs(900));
        assert!(!config.rate_limiting.trust_api_key);
        assert_eq!(config.health_check.unhealthy_threshold, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_health_threshold_is_rejected() {
        let mut config = valid_config();
        config.health_check.healthy_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PORT", "4000"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example"),
            ("JWT_SECRET", "from-env"),
            ("RATE_LIMIT_WINDOW_MS", "1000"),
            ("RATE_LIMIT_MAX", "7"),
            ("LOG_FORMAT", "json"),
            ("UPSTREAM_LEAD_MANAGEMENT_URL", "http://leads.internal:9000"),
        ]);

        let mut config = valid_config();
        config
            .apply_env(|key| env.get(key).map(|value| value.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(
            config.server.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(config.auth.secret, "from-env");
        assert_eq!(config.rate_limiting.window, Duration::from_secs(1));
        assert_eq!(config.rate_limiting.max_requests, 7);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.proxy.routes[0].target, "http://leads.internal:9000");
        config.validate().unwrap();
    }

    #[test]
    fn test_env_rejects_malformed_numbers() {
        let mut config = valid_config();
        let err = config
            .apply_env(|key| (key == "PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut missing_secret = valid_config();
        missing_secret.auth.secret.clear();
        assert!(missing_secret.validate().is_err());

        let mut bad_target = valid_config();
        bad_target.proxy.routes[0].target = "leads:3002".to_string();
        assert!(bad_target.validate().is_err());

        let mut duplicate = valid_config();
        let mut copy = duplicate.proxy.routes[0].clone();
        copy.prefix = "/api/v1/leads/".to_string();
        duplicate.proxy.routes.push(copy);
        assert!(duplicate.validate().is_err());

        let mut zero_window = valid_config();
        zero_window.rate_limiting.window = Duration::ZERO;
        assert!(zero_window.validate().is_err());

        assert!(valid_config().validate().is_ok());
    }
}
