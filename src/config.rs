//! Configuration management

use std::{collections::HashMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::oauth::ClientAuthMethod;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// OAuth provider configuration
    pub oauth: OAuthConfig,
    /// Resource server configuration
    pub resource: ResourceConfig,
    /// Credential storage configuration
    pub storage: StorageConfig,
    /// Stdio bridge configuration
    pub bridge: BridgeConfig,
    /// Request routing configuration
    pub router: RouterConfig,
}

/// OAuth provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Token endpoint URL
    pub token_url: String,
    /// Authorization endpoint URL (only used to print an authorization link)
    pub authorize_url: Option<String>,
    /// Client ID (supports `env:VAR_NAME`)
    pub client_id: String,
    /// Client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Redirect URI registered with the provider
    pub redirect_uri: String,
    /// Scopes to request
    pub scopes: Vec<String>,
    /// Client authentication encodings, in preference order
    pub auth_methods: Vec<ClientAuthMethod>,
    /// Treat the credential as expired this long before `expires_at`
    #[serde(with = "humantime_serde")]
    pub refresh_margin: Duration,
    /// Token endpoint request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retry policy for refresh requests that never reached the provider
    pub retry: RetryConfig,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            authorize_url: None,
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: "urn:ietf:wg:oauth:2.0:oob".to_string(),
            scopes: Vec::new(),
            auth_methods: ClientAuthMethod::default_order(),
            refresh_margin: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl OAuthConfig {
    /// Client ID with `env:` indirection resolved
    #[must_use]
    pub fn resolve_client_id(&self) -> String {
        resolve_secret(&self.client_id)
    }

    /// Client secret with `env:` indirection resolved
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        resolve_secret(&self.client_secret)
    }

    /// Authorization endpoint URL for the code flow.
    ///
    /// The operator opens it in a browser and passes the resulting code to
    /// `authorize` (or `auth/exchange`).
    pub fn authorization_url(&self, state: Option<&str>) -> Result<Url> {
        let base = self
            .authorize_url
            .as_deref()
            .ok_or_else(|| Error::Config("oauth.authorize_url is not set".to_string()))?;
        let mut url = Url::parse(base)
            .map_err(|e| Error::Config(format!("oauth.authorize_url is invalid: {e}")))?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.resolve_client_id())
                .append_pair("redirect_uri", &self.redirect_uri);
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
        Ok(url)
    }
}

/// Resolve `env:VAR_NAME` references, falling back to the literal value
fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries
    pub enabled: bool,
    /// Maximum attempts (including the first)
    pub max_attempts: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Resource server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Endpoint receiving forwarded JSON-RPC requests
    pub url: String,
    /// Extra HTTP headers sent with every request (values support `${VAR}`)
    pub headers: HashMap<String, String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Credential storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Credential file (default: `~/.mcp-oauth-bridge/credential.json`)
    pub token_file: Option<PathBuf>,
}

impl StorageConfig {
    /// Effective credential file path
    pub fn token_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.token_file {
            return Ok(expand_home(&path.to_string_lossy()).into());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(".mcp-oauth-bridge").join("credential.json"))
    }
}

/// Stdio bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Longest accepted input line in bytes
    pub max_line_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: 16 * 1024 * 1024, // 16MB
        }
    }
}

/// Request routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Glob patterns of method names forwarded to the resource server
    pub forward: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            forward: vec!["*".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // OAUTH_BRIDGE_OAUTH__CLIENT_ID -> oauth.client_id
        figment = figment.merge(Env::prefixed("OAUTH_BRIDGE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Check that the values needed to talk to the provider and resource
    /// server are present and well-formed
    pub fn validate(&self) -> Result<()> {
        if self.oauth.resolve_client_id().trim().is_empty() {
            return Err(Error::Config("oauth.client_id is required".to_string()));
        }
        if self.oauth.resolve_client_secret().trim().is_empty() {
            return Err(Error::Config("oauth.client_secret is required".to_string()));
        }
        Url::parse(&self.oauth.token_url)
            .map_err(|e| Error::Config(format!("oauth.token_url is invalid: {e}")))?;
        Url::parse(&self.resource.url)
            .map_err(|e| Error::Config(format!("resource.url is invalid: {e}")))?;
        if self.oauth.auth_methods.is_empty() {
            return Err(Error::Config(
                "oauth.auth_methods must list at least one method".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in self.resource.headers.values_mut() {
            *value = Self::expand_string(&re, value);
        }
        self.resource.url = Self::expand_string(&re, &self.resource.url);
        self.oauth.token_url = Self::expand_string(&re, &self.oauth.token_url);
        self.oauth.client_id = Self::expand_string(&re, &self.oauth.client_id);
        self.oauth.client_secret = Self::expand_string(&re, &self.oauth.client_secret);
        self.oauth.redirect_uri = Self::expand_string(&re, &self.oauth.redirect_uri);
        if let Some(ref authorize_url) = self.oauth.authorize_url {
            self.oauth.authorize_url = Some(Self::expand_string(&re, authorize_url));
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

fn expand_home(path_str: &str) -> String {
    if path_str.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path_str.replacen('~', &home.display().to_string(), 1);
        }
    }
    path_str.to_string()
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s" or "500ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.oauth.token_url = "https://auth.example.com/oauth/token".to_string();
        config.oauth.client_id = "client".to_string();
        config.oauth.client_secret = "secret".to_string();
        config.resource.url = "https://api.example.com/mcp".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.oauth.refresh_margin, Duration::from_secs(60));
        assert_eq!(config.oauth.timeout, Duration::from_secs(30));
        assert_eq!(config.resource.timeout, Duration::from_secs(30));
        assert_eq!(config.router.forward, vec!["*".to_string()]);
        assert_eq!(config.oauth.auth_methods, ClientAuthMethod::default_order());
    }

    #[test]
    fn test_validate_requires_client_identity() {
        assert!(valid_config().validate().is_ok());

        let mut missing_secret = valid_config();
        missing_secret.oauth.client_secret = String::new();
        let err = missing_secret.validate().unwrap_err();
        assert!(err.to_string().contains("client_secret"));

        let mut missing_id = valid_config();
        missing_id.oauth.client_id = "  ".to_string();
        assert!(missing_id.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let mut config = valid_config();
        config.resource.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "OAUTH_BRIDGE_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(
            env::var("OAUTH_BRIDGE_TEST_KEY_A").unwrap(),
            "hello_from_env_file"
        );
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn test_expand_string_uses_default() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        let out = Config::expand_string(&re, "Bearer ${OAUTH_BRIDGE_TEST_UNSET_VAR:-fallback}");
        assert_eq!(out, "Bearer fallback");
    }

    #[test]
    fn test_yaml_sections_deserialize() {
        let yaml = r#"
oauth:
  token_url: "https://auth.example.com/token"
  client_id: "abc"
  client_secret: "env:OUTREACH_CLIENT_SECRET"
  scopes: ["prospects.read", "sequences.all"]
  auth_methods: [basic, json_body]
  refresh_margin: 2m
  retry:
    initial_backoff: 250ms
resource:
  url: "https://mcp.example.com/mcp"
  timeout: 45s
router:
  forward: ["tools/*", "initialize"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.oauth.scopes.len(), 2);
        assert_eq!(
            config.oauth.auth_methods,
            vec![ClientAuthMethod::Basic, ClientAuthMethod::JsonBody]
        );
        assert_eq!(config.oauth.refresh_margin, Duration::from_secs(120));
        assert_eq!(config.oauth.retry.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.oauth.retry.max_attempts, 3);
        assert_eq!(config.resource.timeout, Duration::from_secs(45));
        assert_eq!(config.router.forward.len(), 2);
    }

    #[test]
    fn test_token_path_override() {
        let config = StorageConfig {
            token_file: Some(PathBuf::from("/tmp/bridge/cred.json")),
        };
        assert_eq!(
            config.token_path().unwrap(),
            PathBuf::from("/tmp/bridge/cred.json")
        );
    }

    #[test]
    fn test_authorization_url() {
        let mut config = valid_config();
        assert!(config.oauth.authorization_url(None).is_err());

        config.oauth.authorize_url = Some("https://auth.example.com/oauth/authorize".to_string());
        config.oauth.redirect_uri = "https://localhost/callback".to_string();
        config.oauth.scopes = vec!["read".to_string(), "write".to_string()];
        let url = config.oauth.authorization_url(Some("xyz")).unwrap();

        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "client");
        assert_eq!(pairs["redirect_uri"], "https://localhost/callback");
        assert_eq!(pairs["scope"], "read write");
        assert_eq!(pairs["state"], "xyz");
    }
}
