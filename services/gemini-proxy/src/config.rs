//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys come from the `GEMINI_API_KEYS` / `GEMINI_API_KEY` env vars or
//! from `keys_file`, never from the TOML itself, so the config file can be
//! committed without leaking secrets.

use common::{Secret, split_key_list};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var holding a comma-separated key list. Takes precedence.
pub const KEYS_ENV: &str = "GEMINI_API_KEYS";

/// Env var holding a single key (a comma-separated list is accepted too).
pub const KEY_ENV: &str = "GEMINI_API_KEY";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Model used when a request does not name one
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Largest accepted request body; inline images travel base64-encoded
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Key pool settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// File with keys, one per line or comma-separated
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Resolved keys, filled in by `Config::load`
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keys_file: None,
            sweep_interval_ms: default_sweep_interval_ms(),
            keys: Vec::new(),
        }
    }
}

impl PoolConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_upstream_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_model() -> String {
    "gemini-1.5-flash".into()
}

fn default_max_body_bytes() -> usize {
    4_500_000
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then resolve API keys.
    ///
    /// Key resolution order:
    /// 1. GEMINI_API_KEYS env var
    /// 2. GEMINI_API_KEY env var
    /// 3. keys_file path from config
    ///
    /// Ending up with no keys is not an error here; the pool reports it on
    /// every request instead.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.proxy.upstream_url.starts_with("http://")
            && !config.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                config.proxy.upstream_url
            )));
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.proxy.max_body_bytes == 0 {
            return Err(common::Error::Config(
                "max_body_bytes must be greater than 0".into(),
            ));
        }

        if config.pool.sweep_interval_ms == 0 {
            return Err(common::Error::Config(
                "sweep_interval_ms must be greater than 0".into(),
            ));
        }

        config.pool.keys = resolve_keys(config.pool.keys_file.as_deref())?;
        validate_keys(&config.pool.keys)?;
        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-proxy.toml")
    }
}

/// Reject keys that cannot be sent as a header value. The error names the
/// key's position, never its value.
fn validate_keys(keys: &[Secret<String>]) -> common::Result<()> {
    for (idx, key) in keys.iter().enumerate() {
        if !key.expose().bytes().all(|b| b.is_ascii_graphic()) {
            return Err(common::Error::Config(format!(
                "API key #{idx} contains whitespace or non-printable characters"
            )));
        }
    }
    Ok(())
}

/// Resolve the key list from env vars, falling back to `keys_file`.
///
/// An env var that holds only separators (e.g. `" , "`) counts as unset.
fn resolve_keys(keys_file: Option<&Path>) -> common::Result<Vec<Secret<String>>> {
    for var in [KEYS_ENV, KEY_ENV] {
        if let Ok(raw) = std::env::var(var) {
            let keys = split_key_list(&raw);
            if !keys.is_empty() {
                return Ok(keys);
            }
        }
    }

    match keys_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                common::Error::Config(format!("failed to read keys_file {}: {e}", path.display()))
            })?;
            Ok(split_key_list(&raw))
        }
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    /// SAFETY: Callers must hold ENV_MUTEX.
    unsafe fn clear_key_env() {
        unsafe {
            remove_env(KEYS_ENV);
            remove_env(KEY_ENV);
        }
    }

    fn exposed(keys: &[Secret<String>]) -> Vec<&str> {
        keys.iter().map(|k| k.expose().as_str()).collect()
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    const MINIMAL_TOML: &str = r#"
[proxy]
listen_addr = "127.0.0.1:8080"
"#;

    #[test]
    fn load_minimal_config_applies_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL_TOML);
        unsafe { clear_key_env() };

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.proxy.upstream_url,
            "https://generativelanguage.googleapis.com"
        );
        assert_eq!(config.proxy.timeout_secs, 60);
        assert_eq!(config.proxy.max_connections, 1000);
        assert_eq!(config.proxy.default_model, "gemini-1.5-flash");
        assert_eq!(config.proxy.max_body_bytes, 4_500_000);
        assert_eq!(config.pool.sweep_interval(), Duration::from_secs(1));
        assert!(config.pool.keys.is_empty());
    }

    #[test]
    fn load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "0.0.0.0:3000"
upstream_url = "http://localhost:9999"
timeout_secs = 30
max_connections = 64
default_model = "gemini-2.0-flash"
max_body_bytes = 1048576

[pool]
sweep_interval_ms = 250
"#,
        );
        unsafe { clear_key_env() };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.listen_addr.port(), 3000);
        assert_eq!(config.proxy.upstream_url, "http://localhost:9999");
        assert_eq!(config.proxy.timeout_secs, 30);
        assert_eq!(config.proxy.max_connections, 64);
        assert_eq!(config.proxy.default_model, "gemini-2.0-flash");
        assert_eq!(config.proxy.max_body_bytes, 1_048_576);
        assert_eq!(config.pool.sweep_interval(), Duration::from_millis(250));
    }

    #[test]
    fn load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn keys_from_multi_key_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL_TOML);

        unsafe {
            clear_key_env();
            set_env(KEYS_ENV, "key-a, key-b,,key-a");
        }
        let config = Config::load(&path).unwrap();
        unsafe { clear_key_env() };

        assert_eq!(exposed(&config.pool.keys), vec!["key-a", "key-b", "key-a"]);
        assert_eq!(key_pool::KeyPool::new(config.pool.keys).len(), 2);
    }

    #[test]
    fn multi_key_env_overrides_single_key_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL_TOML);

        unsafe {
            set_env(KEYS_ENV, "multi-1,multi-2");
            set_env(KEY_ENV, "single");
        }
        let config = Config::load(&path).unwrap();
        unsafe { clear_key_env() };

        assert_eq!(exposed(&config.pool.keys), vec!["multi-1", "multi-2"]);
    }

    #[test]
    fn single_key_env_used_when_multi_is_blank() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL_TOML);

        unsafe {
            set_env(KEYS_ENV, " , ");
            set_env(KEY_ENV, "single");
        }
        let config = Config::load(&path).unwrap();
        unsafe { clear_key_env() };

        assert_eq!(exposed(&config.pool.keys), vec!["single"]);
    }

    #[test]
    fn keys_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("keys.txt");
        std::fs::write(&keys_path, "file-a\nfile-b\n\nfile-c,file-d\n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"
[proxy]
listen_addr = "127.0.0.1:8080"

[pool]
keys_file = "{}"
"#,
                keys_path.display()
            ),
        );
        unsafe { clear_key_env() };

        let config = Config::load(&path).unwrap();
        assert_eq!(
            exposed(&config.pool.keys),
            vec!["file-a", "file-b", "file-c", "file-d"]
        );
    }

    #[test]
    fn env_overrides_nonexistent_keys_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"

[pool]
keys_file = "/nonexistent/path/keys.txt"
"#,
        );

        unsafe {
            clear_key_env();
            set_env(KEY_ENV, "env-wins");
        }
        let config = Config::load(&path).unwrap();
        unsafe { clear_key_env() };

        assert_eq!(exposed(&config.pool.keys), vec!["env-wins"]);
    }

    #[test]
    fn nonexistent_keys_file_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"

[pool]
keys_file = "/nonexistent/path/keys.txt"
"#,
        );
        unsafe { clear_key_env() };

        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("failed to read keys_file"),
            "got: {err}"
        );
    }

    #[test]
    fn debug_output_redacts_keys() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL_TOML);

        unsafe {
            clear_key_env();
            set_env(KEY_ENV, "AIza-super-secret");
        }
        let config = Config::load(&path).unwrap();
        unsafe { clear_key_env() };

        let debug = format!("{config:?}");
        assert!(!debug.contains("AIza-super-secret"), "got: {debug}");
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn keys_that_are_not_header_safe_are_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL_TOML);

        for bad in ["good-key,bad key", "good-key,bad\tkey", "good-key,kéy", "good-key,key\u{7f}"] {
            unsafe {
                clear_key_env();
                set_env(KEYS_ENV, bad);
            }
            let err = Config::load(&path).unwrap_err();
            let msg = err.to_string();
            assert!(msg.contains("API key #1"), "{bad:?}: got {msg}");
            assert!(!msg.contains("good-key"), "error must not echo keys: {msg}");
        }
        unsafe { clear_key_env() };
    }

    #[test]
    fn invalid_upstream_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "generativelanguage.googleapis.com"
"#,
        );
        unsafe { clear_key_env() };

        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("upstream_url must start with http"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn zero_values_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_key_env() };
        let cases = [
            ("timeout_secs = 0", "", "timeout_secs"),
            ("max_connections = 0", "", "max_connections"),
            ("max_body_bytes = 0", "", "max_body_bytes"),
            ("", "sweep_interval_ms = 0", "sweep_interval_ms"),
        ];
        for (proxy_line, pool_line, field) in cases {
            let dir = tempfile::tempdir().unwrap();
            let path = write_config(
                &dir,
                &format!(
                    "[proxy]\nlisten_addr = \"127.0.0.1:8080\"\n{proxy_line}\n\n[pool]\n{pool_line}\n"
                ),
            );
            let err = Config::load(&path).unwrap_err();
            assert!(err.to_string().contains(field), "{field}: got {err}");
        }
    }

    #[test]
    fn resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("gemini-proxy.toml"));
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}
