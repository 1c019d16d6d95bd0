use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use crate::config::AppConfig;
use crate::error::{MediaError, MediaResult};
use crate::process::{self, StderrTail, FFMPEG};
use crate::resolver;

pub const CHUNK_SIZE: usize = 1024;
pub const AUDIO_BITRATE: &str = "192k";

/// Sent in place of (or after) audio when the stream cannot be produced.
pub const STREAM_ERROR_MESSAGE: &str = "Error: Could not stream audio";

type Chunk = Result<Bytes, Infallible>;

/// One running ffmpeg transcode owned by a single response.
///
/// Dropping the session kills the child, so a client that goes away mid-stream
/// does not leave ffmpeg running.
pub struct TranscodeSession {
    child: Child,
    stdout: ChildStdout,
    tail: StderrTail,
    stderr_task: JoinHandle<()>,
    deadline: Instant,
    limit: Duration,
    buffer: Vec<u8>,
}

impl TranscodeSession {
    /// Starts ffmpeg reading `direct_url` and writing mp3 to its stdout.
    pub fn start(cfg: &AppConfig, direct_url: &str) -> MediaResult<Self> {
        let mut cmd = process::ffmpeg_command(cfg);
        cmd.arg("-i")
            .arg(direct_url)
            .arg("-f")
            .arg("mp3")
            .arg("-acodec")
            .arg("mp3")
            .arg("-ab")
            .arg(AUDIO_BITRATE)
            .arg("-");

        let mut child = cmd
            .spawn()
            .map_err(|source| MediaError::Spawn { tool: FFMPEG, source })?;
        if let Some(pid) = child.id() {
            log::info!("[STREAM] ffmpeg started (pid={})", pid);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::io("capture ffmpeg stdout", std::io::ErrorKind::BrokenPipe.into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::io("capture ffmpeg stderr", std::io::ErrorKind::BrokenPipe.into()))?;
        let (tail, stderr_task) = StderrTail::capture(FFMPEG, stderr);

        Ok(Self {
            child,
            stdout,
            tail,
            stderr_task,
            deadline: Instant::now() + cfg.transcode_timeout,
            limit: cfg.transcode_timeout,
            buffer: vec![0u8; CHUNK_SIZE],
        })
    }

    /// Next piece of encoded audio, at most [`CHUNK_SIZE`] bytes; `None` at end of stream.
    pub async fn next_chunk(&mut self) -> MediaResult<Option<Bytes>> {
        let read = timeout_at(self.deadline, self.stdout.read(&mut self.buffer))
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| MediaError::io("read ffmpeg stdout", e))?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(&self.buffer[..read])))
    }

    /// Waits for ffmpeg to exit once its output is drained.
    pub async fn finish(mut self) -> MediaResult<()> {
        let status = timeout_at(self.deadline, self.child.wait())
            .await
            .map_err(|_| self.timed_out())?
            .map_err(|e| MediaError::io("wait for ffmpeg", e))?;
        let _ = self.stderr_task.await;

        if !status.success() {
            return Err(MediaError::Exit {
                tool: FFMPEG,
                status,
                stderr_tail: self.tail.render().await,
            });
        }
        Ok(())
    }

    fn timed_out(&self) -> MediaError {
        MediaError::Timeout {
            tool: FFMPEG,
            limit: self.limit,
        }
    }
}

async fn open_session(cfg: &AppConfig, video_id: &str) -> MediaResult<TranscodeSession> {
    let media = resolver::resolve(cfg, video_id).await?;
    log::info!("[STREAM] Resolved {} ({})", video_id, media.title);
    TranscodeSession::start(cfg, &media.direct_url)
}

/// Lazily resolves `video_id` and relays ffmpeg's mp3 output chunk by chunk.
///
/// Nothing runs until the body is polled, so the response head is already
/// committed when resolution happens. Failures are therefore reported in-band:
/// the stream ends with [`STREAM_ERROR_MESSAGE`] instead of an error status.
pub fn audio_stream(cfg: Arc<AppConfig>, video_id: String) -> impl Stream<Item = Chunk> {
    stream! {
        let mut session = match open_session(&cfg, &video_id).await {
            Ok(s) => s,
            Err(e) => {
                log::error!("[STREAM] Could not start stream for {}: {}", video_id, e);
                yield Chunk::Ok(Bytes::from_static(STREAM_ERROR_MESSAGE.as_bytes()));
                return;
            }
        };

        let mut relayed: u64 = 0;
        loop {
            match session.next_chunk().await {
                Ok(Some(chunk)) => {
                    relayed += chunk.len() as u64;
                    yield Chunk::Ok(chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("[STREAM] Relay for {} failed after {} bytes: {}", video_id, relayed, e);
                    yield Chunk::Ok(Bytes::from_static(STREAM_ERROR_MESSAGE.as_bytes()));
                    return;
                }
            }
        }

        match session.finish().await {
            Ok(()) => log::info!("[STREAM] Finished {} ({} bytes)", video_id, relayed),
            Err(e) => {
                log::error!("[STREAM] ffmpeg failed for {} after {} bytes: {}", video_id, relayed, e);
                yield Chunk::Ok(Bytes::from_static(STREAM_ERROR_MESSAGE.as_bytes()));
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use futures_util::StreamExt;

    use super::*;
    use crate::process::testing::fake_tool;

    fn config(dir: &Path, ytdlp: &str, ffmpeg: &str) -> Arc<AppConfig> {
        Arc::new(AppConfig {
            ytdlp_bin: fake_tool(dir, "yt-dlp", ytdlp),
            ffmpeg_bin: fake_tool(dir, "ffmpeg", ffmpeg),
            download_dir: dir.join("downloads"),
            ..AppConfig::default()
        })
    }

    const RESOLVES: &str = r#"echo '{"title":"t","url":"https://media.example/a.webm"}'"#;

    async fn collect(cfg: Arc<AppConfig>, id: &str) -> (Vec<Bytes>, Vec<u8>) {
        let chunks: Vec<Bytes> = audio_stream(cfg, id.to_string())
            .map(|c| match c {
                Ok(b) => b,
                Err(never) => match never {},
            })
            .collect()
            .await;
        let body = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        (chunks, body)
    }

    #[tokio::test]
    async fn relays_output_byte_exact_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            RESOLVES,
            "i=0; while [ $i -lt 300 ]; do printf 'frame-%04d;' $i; i=$((i+1)); done",
        );

        let (chunks, body) = collect(cfg, "abc").await;

        let expected: String = (0..300).map(|i| format!("frame-{:04};", i)).collect();
        assert_eq!(body, expected.as_bytes());
        assert!(chunks.len() >= expected.len() / CHUNK_SIZE);
        assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= CHUNK_SIZE));
    }

    #[tokio::test]
    async fn passes_resolved_url_and_fixed_encoding_to_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), RESOLVES, r#"printf '%s ' "$@""#);

        let (_, body) = collect(cfg, "abc").await;
        let args = String::from_utf8(body).unwrap();
        assert!(
            args.contains("-i https://media.example/a.webm -f mp3 -acodec mp3 -ab 192k - "),
            "{args}"
        );
    }

    #[tokio::test]
    async fn resolution_failure_yields_single_error_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), "exit 1", "printf 'should not run'");

        let (chunks, body) = collect(cfg, "missing").await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(body, STREAM_ERROR_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn missing_ffmpeg_yields_error_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = (*config(dir.path(), RESOLVES, "")).clone();
        cfg.ffmpeg_bin = dir.path().join("no-such-ffmpeg");

        let (_, body) = collect(Arc::new(cfg), "abc").await;
        assert_eq!(body, STREAM_ERROR_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn failed_exit_appends_error_after_audio() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), RESOLVES, "printf 'partial'; echo 'boom' >&2; exit 1");

        let (_, body) = collect(cfg, "abc").await;
        assert_eq!(body, format!("partial{}", STREAM_ERROR_MESSAGE).as_bytes());
    }

    #[tokio::test]
    async fn stuck_ffmpeg_is_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = (*config(dir.path(), RESOLVES, "printf 'abc'; exec sleep 30")).clone();
        cfg.transcode_timeout = Duration::from_millis(300);

        let started = std::time::Instant::now();
        let (_, body) = collect(Arc::new(cfg), "abc").await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(body, format!("abc{}", STREAM_ERROR_MESSAGE).as_bytes());
    }

    /// Alive and not yet a zombie. A killed child stays a zombie until tokio reaps it.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            // Field 3, after the parenthesised command name, is the state.
            Ok(stat) => stat
                .rsplit_once(") ")
                .and_then(|(_, rest)| rest.chars().next())
                .is_some_and(|state| state != 'Z' && state != 'X'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_the_stream_kills_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("ffmpeg.pid");
        let ffmpeg = format!(
            "echo $$ > '{}'\nprintf 'first'\nexec sleep 30",
            pid_file.display()
        );
        let cfg = config(dir.path(), RESOLVES, &ffmpeg);

        let mut stream = Box::pin(audio_stream(cfg, "abc".to_string()));
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(is_running(pid));

        drop(stream);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while is_running(pid) {
            assert!(
                std::time::Instant::now() < deadline,
                "ffmpeg (pid {pid}) still running after the stream was dropped"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn concurrent_streams_stay_independent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            dir.path(),
            r#"for a in "$@"; do last="$a"; done
printf '{"url":"%s"}' "${last##*=}""#,
            // Echo the -i argument (the video id here) many times.
            r#"while [ $# -gt 0 ]; do [ "$1" = "-i" ] && src="$2"; shift; done
i=0; while [ $i -lt 500 ]; do printf '%s.' "$src"; i=$((i+1)); done"#,
        );

        let (a, b) = tokio::join!(collect(cfg.clone(), "first"), collect(cfg, "second"));
        assert_eq!(a.1, "first.".repeat(500).as_bytes());
        assert_eq!(b.1, "second.".repeat(500).as_bytes());
    }
}
