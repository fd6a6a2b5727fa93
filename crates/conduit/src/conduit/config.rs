use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::conduit::{
    credential::Credential,
    session::{DEFAULT_BUFFER_SIZE, DEFAULT_DIAL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, SessionOptions},
};

pub const CONFIG_ENV: &str = "CONDUIT_CONFIG";

const CONFIG_CANDIDATES: [&str; 3] = ["conduit.toml", "conduit.yaml", "conduit.yml"];
const CREDENTIAL_MARKER: &str = "@CREDENTIAL@";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps CONDUIT_CONFIG into the flag already; this covers callers that skip the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join(CONFIG_CANDIDATES[0])));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in CONFIG_CANDIDATES {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no conduit.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/conduit/conduit.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "conduit", "conduit")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("conduit.toml"))
    }
}

/// Creates a default config at `path` unless a file is already there.
///
/// The generated file carries a freshly generated credential, so a server started
/// from it never runs on the development placeholder. Returns whether a file was written.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!(
            "config: {} exists but is not a regular file",
            path.display()
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?
        .replace(CREDENTIAL_MARKER, &Credential::generate().to_string());

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension_of(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        ext => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub ws_path: String,
    pub credential: Credential,
    pub credential_source: CredentialSource,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub buffer_size: usize,
    pub metrics: bool,
    pub share: ShareConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            dial_timeout: self.dial_timeout,
            handshake_timeout: self.handshake_timeout,
            buffer_size: self.buffer_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Configured,
    /// No credential set; the well-known development value is in use.
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct ShareConfig {
    pub enabled: bool,
    /// Host advertised in the share link; empty means "use the request's Host header".
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,

    #[serde(default)]
    ws_path: String,

    credential: Option<String>,

    dial_timeout_ms: Option<i64>,

    handshake_timeout_ms: Option<i64>,

    #[serde(default)]
    buffer_size: i64,

    metrics: Option<bool>,

    share: Option<FileShare>,

    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileShare {
    #[serde(default)]
    enabled: bool,
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn millis_or(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => default,
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let (credential, credential_source) = match non_empty(&fc.credential) {
            Some(s) => (
                s.parse::<Credential>().context("config: credential")?,
                CredentialSource::Configured,
            ),
            None => (Credential::dev_placeholder(), CredentialSource::Placeholder),
        };

        let mut cfg = Config {
            listen_addr: fc.listen_addr.trim().to_string(),
            ws_path: fc.ws_path.trim().to_string(),
            credential,
            credential_source,
            dial_timeout: millis_or(fc.dial_timeout_ms, DEFAULT_DIAL_TIMEOUT),
            handshake_timeout: millis_or(fc.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT),
            buffer_size: fc.buffer_size.max(0) as usize,
            metrics: fc.metrics.unwrap_or(true),
            share: ShareConfig {
                enabled: false,
                host: String::new(),
                port: 443,
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        if cfg.listen_addr.is_empty() {
            cfg.listen_addr = ":8080".into();
        }
        if cfg.ws_path.is_empty() {
            cfg.ws_path = "/".into();
        }
        if !cfg.ws_path.starts_with('/') {
            anyhow::bail!("config: ws_path must start with '/' (got {:?})", cfg.ws_path);
        }
        if matches!(cfg.ws_path.as_str(), "/health" | "/metrics") {
            anyhow::bail!("config: ws_path {:?} is reserved", cfg.ws_path);
        }
        if cfg.dial_timeout.is_zero() {
            cfg.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if cfg.buffer_size == 0 {
            cfg.buffer_size = DEFAULT_BUFFER_SIZE;
        }

        // --- Share link ---
        if let Some(s) = &fc.share {
            cfg.share.enabled = s.enabled;
            if let Some(h) = non_empty(&s.host) {
                cfg.share.host = h;
            }
            if let Some(p) = s.port {
                cfg.share.port = p;
            }
        }

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(&l.level) {
                cfg.logging.level = level;
            }
            if let Some(fmt) = non_empty(&l.format) {
                cfg.logging.format = fmt;
            }
            if let Some(out) = non_empty(&l.output) {
                cfg.logging.output = out;
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Conduit configuration (auto-generated)
#
# This file was created because Conduit could not find a configuration file at the
# resolved config path. The credential below was generated for this server; clients
# must present the same UUID to open a tunnel.

listen_addr = ":8080"
ws_path = "/"
credential = "@CREDENTIAL@"

dial_timeout_ms = 5000
handshake_timeout_ms = 10000
buffer_size = 32768
metrics = true

[share]
# Serves a plain-text vless:// share link on GET / (reveals the credential).
enabled = false
host = ""
port = 443

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Conduit configuration (auto-generated)
#
# This file was created because Conduit could not find a configuration file at the
# resolved config path. The credential below was generated for this server; clients
# must present the same UUID to open a tunnel.

listen_addr: ":8080"
ws_path: "/"
credential: "@CREDENTIAL@"

dial_timeout_ms: 5000
handshake_timeout_ms: 10000
buffer_size: 32768
metrics: true

share:
  # Serves a plain-text vless:// share link on GET / (reveals the credential).
  enabled: false
  host: ""
  port: 443

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
