use std::path::{Path, PathBuf};

use serde::Deserialize;
use tempfile::TempDir;

use crate::config::AppConfig;
use crate::error::{MediaError, MediaResult};
use crate::process::{self, YTDLP};
use crate::util;

/// Direct media location for one video. Never cached: the URL expires on the provider's schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub direct_url: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    url: Option<String>,
    title: Option<String>,
}

/// Asks yt-dlp for the best audio format of `video_id` without downloading anything.
pub async fn resolve(cfg: &AppConfig, video_id: &str) -> MediaResult<ResolvedMedia> {
    let mut cmd = process::ytdlp_command(cfg);
    cmd.arg("-J").arg(util::watch_url(video_id));

    let out = process::run_to_completion(YTDLP, cmd, cfg.resolve_timeout).await?;
    let info: InfoJson =
        serde_json::from_slice(&out).map_err(|source| MediaError::Json { tool: YTDLP, source })?;

    let direct_url = info
        .url
        .filter(|u| !u.is_empty())
        .ok_or(MediaError::MissingField { tool: YTDLP, field: "url" })?;
    let title = info
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| video_id.to_string());

    Ok(ResolvedMedia { direct_url, title })
}

/// A finished download still sitting in its per-request staging directory.
///
/// Dropping it deletes the staging directory and anything left in it.
#[derive(Debug)]
pub struct StagedDownload {
    staging: TempDir,
    file: PathBuf,
    title: String,
}

/// Audio file persisted in the download directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub bytes_on_disk: u64,
}

/// Downloads and extracts the audio of `video_id` as mp3 into a fresh staging
/// directory under the configured download directory.
pub async fn download(cfg: &AppConfig, video_id: &str) -> MediaResult<StagedDownload> {
    tokio::fs::create_dir_all(&cfg.download_dir)
        .await
        .map_err(|e| MediaError::io("create download dir", e))?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(&cfg.download_dir)
        .map_err(|e| MediaError::io("create staging dir", e))?;

    let template = staging.path().join("%(id)s.%(ext)s");
    let mut cmd = process::ytdlp_command(cfg);
    // Audio extraction shells out to ffmpeg; point yt-dlp at the configured one.
    cmd.arg("--ffmpeg-location")
        .arg(&cfg.ffmpeg_bin)
        .arg("-x")
        .arg("--audio-format")
        .arg("mp3")
        .arg("--no-simulate")
        .arg("-o")
        .arg(template.as_os_str())
        .arg("--print")
        .arg("after_move:filepath")
        .arg("--print")
        .arg("after_move:title")
        .arg(util::watch_url(video_id));

    let out = process::run_to_completion(YTDLP, cmd, cfg.download_timeout).await?;
    let out = String::from_utf8_lossy(&out);
    let mut lines = out.lines().map(str::trim).filter(|l| !l.is_empty());

    let file = lines
        .next()
        .map(PathBuf::from)
        .ok_or(MediaError::MissingField { tool: YTDLP, field: "filepath" })?;
    let title = lines
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| video_id.to_string());

    Ok(StagedDownload { staging, file, title })
}

impl StagedDownload {
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Moves the file into `dir` under its sanitized title and returns the absolute path.
    ///
    /// An existing file with the same name is replaced.
    pub async fn persist(self, dir: &Path) -> MediaResult<DownloadedFile> {
        if !self.file.starts_with(self.staging.path()) {
            return Err(MediaError::BadOutput { path: self.file });
        }
        let meta = match tokio::fs::metadata(&self.file).await {
            Ok(m) if m.is_file() && m.len() > 0 => m,
            _ => return Err(MediaError::BadOutput { path: self.file }),
        };

        let ext = self
            .file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp3");
        let name = util::sanitize_filename(&format!("{}.{}", self.title, ext));
        let dest = dir.join(name);

        tokio::fs::rename(&self.file, &dest)
            .await
            .map_err(|e| MediaError::io("move download", e))?;
        let path = tokio::fs::canonicalize(&dest)
            .await
            .map_err(|e| MediaError::io("canonicalize download", e))?;

        Ok(DownloadedFile {
            path,
            bytes_on_disk: meta.len(),
        })
    }
}
