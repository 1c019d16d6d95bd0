use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::error::{MediaError, MediaResult};

pub const YTDLP: &str = "yt-dlp";
pub const FFMPEG: &str = "ffmpeg";

const TAIL_LINES: usize = 50;

/// Last lines a child wrote to stderr, shared with the task draining it.
#[derive(Clone, Default)]
pub struct StderrTail {
    lines: Arc<AsyncMutex<VecDeque<String>>>,
}

impl StderrTail {
    /// Drains `stderr` in the background so the child never blocks on a full pipe.
    pub fn capture(tool: &'static str, stderr: ChildStderr) -> (Self, JoinHandle<()>) {
        let tail = Self::default();
        let task = tokio::spawn(tail.clone().drain(tool, stderr));
        (tail, task)
    }

    async fn drain(self, tool: &'static str, stderr: ChildStderr) {
        // ffmpeg and yt-dlp may write non-UTF-8 bytes (titles, paths).
        let mut segments = BufReader::new(stderr).split(b'\n');
        while let Ok(Some(segment)) = segments.next_segment().await {
            let line = String::from_utf8_lossy(&segment);
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            log::debug!("[{}] {}", tool, line);
            self.push(line.to_string()).await;
        }
    }

    async fn push(&self, line: String) {
        let mut lines = self.lines.lock().await;
        if lines.len() == TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub async fn render(&self) -> String {
        let lines = self.lines.lock().await;
        if lines.is_empty() {
            return "no stderr output captured".to_string();
        }
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

const PROXY_VARS: [&str; 6] = [
    "http_proxy",
    "https_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "no_proxy",
    "NO_PROXY",
];

fn apply_environment(cmd: &mut Command, cfg: &AppConfig) {
    cmd.env("PATH", &cfg.ytdlp_path);
    if !cfg.inherit_proxy_env {
        for var in PROXY_VARS {
            cmd.env_remove(var);
        }
    }
}

/// yt-dlp with the flags every invocation shares.
pub fn ytdlp_command(cfg: &AppConfig) -> Command {
    let mut cmd = Command::new(&cfg.ytdlp_bin);
    apply_environment(&mut cmd, cfg);

    if let Some(p) = &cfg.ytdlp_proxy {
        cmd.arg("--proxy").arg(p);
    }

    cmd.arg("--no-playlist")
        .arg("--no-cache-dir")
        .arg("--no-part")
        .arg("--no-warnings")
        .arg("-f")
        .arg("bestaudio/best");

    cmd.stdin(Stdio::null());

    cmd
}

pub fn ffmpeg_command(cfg: &AppConfig) -> Command {
    let mut cmd = Command::new(&cfg.ffmpeg_bin);
    apply_environment(&mut cmd, cfg);

    cmd.arg("-nostdin").arg("-hide_banner").arg("-loglevel").arg("error");

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd
}

/// Runs `cmd` to completion and returns its stdout.
///
/// The child is killed if it outlives `limit` or if the returned future is dropped.
pub async fn run_to_completion(
    tool: &'static str,
    mut cmd: Command,
    limit: Duration,
) -> MediaResult<Vec<u8>> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .map_err(|source| MediaError::Spawn { tool, source })?;
    if let Some(pid) = child.id() {
        log::debug!("{} started (pid={})", tool, pid);
    }

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| MediaError::io("capture stderr", std::io::ErrorKind::BrokenPipe.into()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| MediaError::io("capture stdout", std::io::ErrorKind::BrokenPipe.into()))?;
    let (tail, stderr_task) = StderrTail::capture(tool, stderr);

    let run = async {
        let mut out = Vec::new();
        stdout
            .read_to_end(&mut out)
            .await
            .map_err(|e| MediaError::io("read stdout", e))?;
        let status = child.wait().await.map_err(|e| MediaError::io("wait", e))?;
        Ok::<_, MediaError>((out, status))
    };

    let (out, status) = match tokio::time::timeout(limit, run).await {
        Ok(res) => res?,
        Err(_) => {
            // kill_on_drop reaps the child once `child` goes out of scope.
            return Err(MediaError::Timeout { tool, limit });
        }
    };
    let _ = stderr_task.await;

    if !status.success() {
        return Err(MediaError::Exit {
            tool,
            status,
            stderr_tail: tail.render().await,
        });
    }

    Ok(out)
}
