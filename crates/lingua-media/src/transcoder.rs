//! Transcoder adapter: one external `ffmpeg` process per session.
//!
//! Client container audio (webm/ogg/mp4/wav) goes in on stdin; raw PCM
//! s16le mono 16 kHz comes out on stdout. stderr is watched for failure
//! markers and the process exit is reported on the same diagnostic stream.

use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot, watch};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, warn};

use lingua_core::config::TranscoderConfig;
use lingua_core::error::{RelayError, Result};
use lingua_core::session::AudioFormat;

/// PCM output: chunks of whole s16le samples, at most `chunk_bytes` each.
pub type PcmStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub type DiagnosticStream = Pin<Box<dyn Stream<Item = TranscoderEvent> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscoderEvent {
    /// A diagnostic line containing a failure marker.
    Failure(String),
    /// Terminal event. `expected` is true only if we closed the input and
    /// the process exited with code 0.
    Exited { code: Option<i32>, expected: bool },
}

/// A running transcoder owned by one session.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Write and flush one chunk of container audio. Suspends while the
    /// process is not draining its input.
    async fn write(&self, chunk: &[u8]) -> Result<()>;

    /// Close input so the process can flush and exit on its own. Later
    /// writes fail with `TranscoderWrite`.
    fn finish_input(&self);

    /// Take the PCM output stream. Fails on a second call.
    fn read(&self) -> Result<PcmStream>;

    /// Take the diagnostic stream. Fails on a second call.
    fn diagnostics(&self) -> Result<DiagnosticStream>;

    /// Close input, wait for the grace period, then kill. Idempotent.
    async fn stop(&self);
}

/// Starts a transcoder for a client audio format.
pub trait TranscoderLauncher: Send + Sync {
    fn start(&self, format: AudioFormat) -> Result<Arc<dyn Transcoder>>;
}

/// Launches `ffmpeg` (or whatever `program` points at) per session.
pub struct FfmpegLauncher {
    settings: TranscoderConfig,
}

impl FfmpegLauncher {
    pub fn new(settings: TranscoderConfig) -> Self {
        Self { settings }
    }
}

impl TranscoderLauncher for FfmpegLauncher {
    fn start(&self, format: AudioFormat) -> Result<Arc<dyn Transcoder>> {
        let args = ffmpeg_args(format);
        let transcoder = FfmpegTranscoder::spawn(&self.settings.program, &args, &self.settings)?;
        Ok(Arc::new(transcoder))
    }
}

/// Fixed ffmpeg arguments. `-f <container>` is omitted for `auto` so ffmpeg
/// probes the input itself.
pub fn ffmpeg_args(format: AudioFormat) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string()];
    if let Some(container) = format.container() {
        args.push("-f".into());
        args.push(container.into());
    }
    args.extend(
        [
            "-i", "pipe:0", "-f", "s16le", "-acodec", "pcm_s16le", "-ac", "1", "-ar", "16000",
            "pipe:1",
        ]
        .map(String::from),
    );
    args
}

/// Whether a diagnostic line signals a fatal transcoding failure.
pub fn is_failure_line(line: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| !m.is_empty() && line.contains(m.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    Exited(Option<i32>),
}

impl ProcessState {
    fn is_exited(&self) -> bool {
        matches!(self, Self::Exited(_))
    }

    fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => *code,
            Self::Running => None,
        }
    }
}

pub struct FfmpegTranscoder {
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: StdMutex<Option<ChildStdout>>,
    stderr: StdMutex<Option<ChildStderr>>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<ProcessState>,
    input_closed: Arc<AtomicBool>,
    stopped: AtomicBool,
    failure_markers: Vec<String>,
    chunk_bytes: usize,
    stop_grace: Duration,
}

impl FfmpegTranscoder {
    /// Spawn `program` with `args` and piped stdio.
    ///
    /// The child is owned by a reaper task that publishes its exit code and
    /// kills it on request (or when this handle is dropped).
    pub fn spawn(program: &str, args: &[String], settings: &TranscoderConfig) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RelayError::ProcessSpawn(format!("{program}: {e}")))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::ProcessSpawn("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::ProcessSpawn("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RelayError::ProcessSpawn("failed to capture stderr".into()))?;

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(ProcessState::Running);

        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    if let Err(e) = child.start_kill() {
                        warn!(?pid, error = %e, "Failed to kill transcoder");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(?pid, error = %e, "Failed to reap transcoder");
                    None
                }
            };
            debug!(?pid, ?code, "Transcoder exited");
            let _ = exit_tx.send(ProcessState::Exited(code));
        });

        info!(?pid, program, ?args, "Transcoder started");

        Ok(Self {
            pid,
            stdin: Mutex::new(Some(stdin)),
            stdout: StdMutex::new(Some(stdout)),
            stderr: StdMutex::new(Some(stderr)),
            kill_tx: StdMutex::new(Some(kill_tx)),
            exit_rx,
            input_closed: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            failure_markers: settings.failure_markers.clone(),
            chunk_bytes: settings.chunk_bytes.max(2),
            stop_grace: settings.stop_grace(),
        })
    }

    fn kill(&self) {
        let sender = self.kill_tx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

fn take_once<T>(slot: &StdMutex<Option<T>>, what: &str) -> Result<T> {
    slot.lock()
        .ok()
        .and_then(|mut slot| slot.take())
        .ok_or_else(|| RelayError::TranscoderFailure(format!("{what} stream already taken")))
}

async fn wait_exit(rx: &mut watch::Receiver<ProcessState>) -> Option<i32> {
    match rx.wait_for(ProcessState::is_exited).await {
        Ok(state) => state.code(),
        Err(_) => None,
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn write(&self, chunk: &[u8]) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| RelayError::TranscoderWrite("input closed".into()))?;
        stdin
            .write_all(chunk)
            .await
            .map_err(|e| RelayError::TranscoderWrite(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| RelayError::TranscoderWrite(e.to_string()))
    }

    fn finish_input(&self) {
        // A writer blocked on a full pipe holds the lock; a later kill unblocks it.
        match self.stdin.try_lock() {
            Ok(mut guard) => {
                self.input_closed.store(true, Ordering::SeqCst);
                if guard.take().is_some() {
                    debug!(pid = ?self.pid, "Transcoder input closed");
                }
            }
            Err(_) => debug!(pid = ?self.pid, "Transcoder input busy, skipping graceful close"),
        }
    }

    fn read(&self) -> Result<PcmStream> {
        let stdout = take_once(&self.stdout, "PCM output")?;
        let frames = FramedRead::with_capacity(
            stdout,
            PcmChunker::new(self.chunk_bytes),
            self.chunk_bytes,
        );
        Ok(Box::pin(frames.map(|frame| frame.map_err(RelayError::from))))
    }

    fn diagnostics(&self) -> Result<DiagnosticStream> {
        let stderr = take_once(&self.stderr, "diagnostic")?;
        let state = DiagnosticReader {
            pid: self.pid,
            reader: BufReader::new(stderr),
            markers: self.failure_markers.clone(),
            exit_rx: self.exit_rx.clone(),
            input_closed: self.input_closed.clone(),
            finished: false,
        };
        Ok(Box::pin(futures::stream::unfold(state, |mut state| async move {
            let event = state.next_event().await?;
            Some((event, state))
        })))
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.finish_input();

        let mut exit_rx = self.exit_rx.clone();
        let exited = tokio::time::timeout(self.stop_grace, wait_exit(&mut exit_rx))
            .await
            .is_ok();
        if !exited {
            warn!(pid = ?self.pid, "Transcoder did not exit within grace period, killing");
            self.kill();
            wait_exit(&mut exit_rx).await;
        }

        // Release pipes nobody took.
        if let Ok(mut slot) = self.stdout.lock() {
            slot.take();
        }
        if let Ok(mut slot) = self.stderr.lock() {
            slot.take();
        }
        debug!(pid = ?self.pid, "Transcoder stopped");
    }
}

struct DiagnosticReader {
    pid: Option<u32>,
    reader: BufReader<ChildStderr>,
    markers: Vec<String>,
    exit_rx: watch::Receiver<ProcessState>,
    input_closed: Arc<AtomicBool>,
    finished: bool,
}

impl DiagnosticReader {
    async fn next_event(&mut self) -> Option<TranscoderEvent> {
        if self.finished {
            return None;
        }

        let mut buf = Vec::new();
        loop {
            buf.clear();
            match self.reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if is_failure_line(line, &self.markers) {
                        warn!(pid = ?self.pid, line, "Transcoder reported failure");
                        return Some(TranscoderEvent::Failure(line.to_string()));
                    }
                    debug!(pid = ?self.pid, line, "transcoder");
                }
                Err(e) => {
                    warn!(pid = ?self.pid, error = %e, "Failed to read transcoder diagnostics");
                    break;
                }
            }
        }

        self.finished = true;
        let code = wait_exit(&mut self.exit_rx).await;
        let expected = self.input_closed.load(Ordering::SeqCst) && code == Some(0);
        Some(TranscoderEvent::Exited { code, expected })
    }
}

/// Splits PCM output into chunks of whole samples, at most `max_bytes` each.
///
/// Yields whatever is buffered rather than waiting for a full chunk, so
/// latency stays at one pipe read.
#[derive(Debug, Clone)]
pub struct PcmChunker {
    max_bytes: usize,
}

impl PcmChunker {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(2),
        }
    }
}

impl Decoder for PcmChunker {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Bytes>> {
        let take = src.len().min(self.max_bytes) & !1;
        if take == 0 {
            return Ok(None);
        }
        Ok(Some(src.split_to(take).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Bytes>> {
        if let Some(chunk) = self.decode(src)? {
            return Ok(Some(chunk));
        }
        if src.is_empty() {
            Ok(None)
        } else {
            // Trailing odd byte from a truncated stream.
            Ok(Some(src.split().freeze()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_args_with_container() {
        let args = ffmpeg_args(AudioFormat::Webm);
        assert_eq!(
            args,
            vec![
                "-hide_banner", "-f", "webm", "-i", "pipe:0", "-f", "s16le", "-acodec",
                "pcm_s16le", "-ac", "1", "-ar", "16000", "pipe:1",
            ]
        );
    }

    #[test]
    fn test_ffmpeg_args_auto_probes() {
        let args = ffmpeg_args(AudioFormat::Auto);
        assert_eq!(args[0], "-hide_banner");
        assert_eq!(args[1], "-i");
        assert_eq!(args.iter().filter(|a| *a == "-f").count(), 1);
    }

    #[test]
    fn test_failure_markers() {
        let markers = TranscoderConfig::default().failure_markers;
        assert!(is_failure_line(
            "pipe:0: Invalid data found when processing input",
            &markers
        ));
        assert!(is_failure_line("Conversion failed!", &markers));
        assert!(is_failure_line("Error while decoding stream #0:0", &markers));
        assert!(!is_failure_line(
            "size=     128kB time=00:00:04.09 bitrate= 256.0kbits/s",
            &markers
        ));
        assert!(!is_failure_line("Input #0, matroska,webm, from 'pipe:0':", &markers));
    }

    #[test]
    fn test_chunker_caps_and_aligns() {
        let mut chunker = PcmChunker::new(4096);
        let mut buf = BytesMut::from(&vec![7u8; 5001][..]);

        assert_eq!(chunker.decode(&mut buf).unwrap().unwrap().len(), 4096);
        assert_eq!(chunker.decode(&mut buf).unwrap().unwrap().len(), 904);
        assert!(chunker.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 1);

        assert_eq!(chunker.decode_eof(&mut buf).unwrap().unwrap().len(), 1);
        assert!(chunker.decode_eof(&mut buf).unwrap().is_none());
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn settings(grace_ms: u64) -> TranscoderConfig {
            TranscoderConfig {
                stop_grace_ms: grace_ms,
                ..TranscoderConfig::default()
            }
        }

        fn sh(script: &str) -> Vec<String> {
            vec!["-c".to_string(), script.to_string()]
        }

        #[tokio::test]
        async fn test_passthrough_preserves_bytes_and_exits_cleanly() {
            let transcoder = FfmpegTranscoder::spawn("cat", &[], &settings(2000)).unwrap();
            let pcm = transcoder.read().unwrap();
            let diagnostics = transcoder.diagnostics().unwrap();

            let input: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
            transcoder.write(&input[..3000]).await.unwrap();
            transcoder.write(&input[3000..]).await.unwrap();
            transcoder.stop().await;

            let chunks: Vec<Bytes> = pcm.map(|c| c.unwrap()).collect().await;
            assert!(chunks.iter().all(|c| c.len() <= 4096 && c.len() % 2 == 0));
            assert_eq!(chunks.concat(), input);

            let events: Vec<TranscoderEvent> = diagnostics.collect().await;
            assert_eq!(
                events,
                vec![TranscoderEvent::Exited {
                    code: Some(0),
                    expected: true
                }]
            );
        }

        #[tokio::test]
        async fn test_finish_input_lets_process_exit() {
            let transcoder = FfmpegTranscoder::spawn("cat", &[], &settings(2000)).unwrap();
            let diagnostics = transcoder.diagnostics().unwrap();
            transcoder.write(b"\x01\x02").await.unwrap();
            transcoder.finish_input();

            let err = transcoder.write(b"\x03\x04").await.unwrap_err();
            assert!(matches!(err, RelayError::TranscoderWrite(_)));

            let events: Vec<TranscoderEvent> = diagnostics.collect().await;
            assert_eq!(
                events,
                vec![TranscoderEvent::Exited {
                    code: Some(0),
                    expected: true
                }]
            );
            transcoder.stop().await;
        }

        #[tokio::test]
        async fn test_missing_program_is_spawn_error() {
            let result = FfmpegTranscoder::spawn(
                "/nonexistent/lingua/ffmpeg",
                &ffmpeg_args(AudioFormat::Webm),
                &settings(100),
            );
            assert!(matches!(result, Err(RelayError::ProcessSpawn(_))));
        }

        #[tokio::test]
        async fn test_stop_is_idempotent_and_closes_input() {
            let transcoder = FfmpegTranscoder::spawn("cat", &[], &settings(2000)).unwrap();
            transcoder.stop().await;
            transcoder.stop().await;

            let err = transcoder.write(b"late").await.unwrap_err();
            assert!(matches!(err, RelayError::TranscoderWrite(_)));
        }

        #[tokio::test]
        async fn test_streams_are_take_once() {
            let transcoder = FfmpegTranscoder::spawn("cat", &[], &settings(2000)).unwrap();
            let _pcm = transcoder.read().unwrap();
            assert!(transcoder.read().is_err());
            let _diag = transcoder.diagnostics().unwrap();
            assert!(transcoder.diagnostics().is_err());
            transcoder.stop().await;
        }

        #[tokio::test]
        async fn test_failure_line_then_unexpected_exit() {
            let transcoder = FfmpegTranscoder::spawn(
                "sh",
                &sh("echo 'Input #0, probing' >&2; \
                     echo 'pipe:0: Invalid data found when processing input' >&2; exit 1"),
                &settings(2000),
            )
            .unwrap();
            let events: Vec<TranscoderEvent> = transcoder.diagnostics().unwrap().collect().await;
            assert_eq!(
                events,
                vec![
                    TranscoderEvent::Failure(
                        "pipe:0: Invalid data found when processing input".into()
                    ),
                    TranscoderEvent::Exited {
                        code: Some(1),
                        expected: false
                    },
                ]
            );
        }

        #[tokio::test]
        async fn test_stop_kills_after_grace() {
            let transcoder =
                FfmpegTranscoder::spawn("sh", &sh("exec sleep 30"), &settings(100)).unwrap();
            let diagnostics = transcoder.diagnostics().unwrap();

            tokio::time::timeout(Duration::from_secs(5), transcoder.stop())
                .await
                .expect("stop should kill within the grace period");

            let events: Vec<TranscoderEvent> = diagnostics.collect().await;
            assert!(matches!(
                events.last(),
                Some(TranscoderEvent::Exited {
                    expected: false,
                    ..
                })
            ));
        }
    }
}
