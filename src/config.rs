use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 5000;
const BIND_HOST: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub download_dir: PathBuf,

    pub ytdlp_bin: PathBuf,
    pub ytdlp_path: String,
    pub ffmpeg_bin: PathBuf,
    // Explicit yt-dlp proxy (e.g. socks5://127.0.0.1:7890).
    pub ytdlp_proxy: Option<String>,
    // Whether child processes inherit http_proxy/https_proxy from the service environment.
    pub inherit_proxy_env: bool,

    pub resolve_timeout: Duration,
    pub transcode_timeout: Duration,
    pub download_timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AppConfigFile {
    port: Option<u16>,
    download_dir: Option<String>,

    ytdlp_bin: Option<String>,
    ytdlp_path: Option<String>,
    ffmpeg_bin: Option<String>,
    ytdlp_proxy: Option<String>,
    inherit_proxy_env: Option<bool>,

    resolve_timeout_secs: Option<u64>,
    transcode_timeout_secs: Option<u64>,
    download_timeout_secs: Option<u64>,
}

fn default_ytdlp_path() -> String {
    // Inherit PATH from the service process; override via config.toml when the
    // tools live somewhere else.
    std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string())
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.and_then(|s| {
        let s = s.trim().to_string();
        if s.is_empty() { None } else { Some(s) }
    })
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_file(AppConfigFile::default())
    }
}

impl AppConfig {
    /// Loads configuration from an optional TOML file, then applies the `PORT`
    /// environment override.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).with_context(|| {
                    format!("Failed to read config file: {}", path.to_string_lossy())
                })?;
                Self::parse(&raw)?
            }
            None => AppConfigFile::default(),
        };

        let mut cfg = Self::from_file(file);
        cfg.apply_port_env(std::env::var("PORT").ok().as_deref())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse(raw: &str) -> Result<AppConfigFile> {
        toml::from_str(raw).context("Failed to parse config.toml")
    }

    fn from_file(file: AppConfigFile) -> Self {
        Self {
            port: file.port.unwrap_or(DEFAULT_PORT),
            download_dir: PathBuf::from(
                non_empty(file.download_dir).unwrap_or_else(|| "downloads".to_string()),
            ),

            ytdlp_bin: PathBuf::from(non_empty(file.ytdlp_bin).unwrap_or_else(|| "yt-dlp".to_string())),
            ytdlp_path: non_empty(file.ytdlp_path).unwrap_or_else(default_ytdlp_path),
            ffmpeg_bin: PathBuf::from(non_empty(file.ffmpeg_bin).unwrap_or_else(|| "ffmpeg".to_string())),
            ytdlp_proxy: non_empty(file.ytdlp_proxy),
            inherit_proxy_env: file.inherit_proxy_env.unwrap_or(true),

            resolve_timeout: Duration::from_secs(file.resolve_timeout_secs.unwrap_or(60)),
            transcode_timeout: Duration::from_secs(file.transcode_timeout_secs.unwrap_or(3600)),
            download_timeout: Duration::from_secs(file.download_timeout_secs.unwrap_or(900)),
        }
    }

    fn apply_port_env(&mut self, value: Option<&str>) -> Result<()> {
        if let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) {
            self.port = raw
                .parse()
                .with_context(|| format!("Invalid PORT value: {}", raw))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("Invalid port: 0"));
        }
        for (name, value) in [
            ("resolve_timeout_secs", self.resolve_timeout),
            ("transcode_timeout_secs", self.transcode_timeout),
            ("download_timeout_secs", self.download_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("Invalid {}: must be greater than zero", name));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((BIND_HOST, self.port))
    }
}
