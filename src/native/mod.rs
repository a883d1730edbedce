use std::{ffi::OsString, io, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::Command,
    time,
};
use tracing::{debug, warn};

use crate::protocol::NativePayload;

/// Largest reply a host may send back, as enforced by browsers.
pub const MAX_HOST_MESSAGE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum NativeHostError {
    #[error("Specified native messaging host not found.")]
    NotFound,
    #[error("Native host has exited.")]
    Exited,
    #[error("Error when communicating with the native messaging host.")]
    Protocol(#[source] FrameError),
    #[error("Native host did not respond within {0:?}.")]
    Timeout(Duration),
    #[error("Failed to start native messaging host: {0}")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("message of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error("invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),
}

/// The process that receives assembled records.
#[async_trait]
pub trait NativeHost: Send + Sync {
    async fn send(&self, payload: &NativePayload) -> Result<Value, NativeHostError>;
}

/// Writes one native-messaging frame: native-endian `u32` length, then UTF-8 JSON.
pub async fn write_frame<W>(writer: &mut W, message: &impl serde::Serialize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = serde_json::to_vec(message)?;
    let length = u32::try_from(encoded.len()).map_err(|_| FrameError::TooLarge(encoded.len()))?;
    writer.write_all(&length.to_ne_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream before a length prefix.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Option<Value>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0_u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let length = u32::from_ne_bytes(prefix) as usize;
    if length > limit {
        return Err(FrameError::TooLarge(length));
    }

    let mut buffer = vec![0_u8; length];
    reader.read_exact(&mut buffer).await?;
    Ok(Some(serde_json::from_slice(&buffer)?))
}

#[derive(Debug, Clone)]
pub struct ProcessHostConfig {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub timeout: Duration,
}

/// Spawns the host program for every send, like a browser does for
/// `runtime.sendNativeMessage`.
#[derive(Debug, Clone)]
pub struct ProcessHost {
    config: ProcessHostConfig,
}

impl ProcessHost {
    pub fn new(config: ProcessHostConfig) -> Self {
        Self { config }
    }

    async fn exchange(&self, payload: &NativePayload) -> Result<Value, NativeHostError> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => NativeHostError::NotFound,
                _ => NativeHostError::Spawn(err),
            })?;

        let mut stdin = child.stdin.take().ok_or(NativeHostError::Exited)?;
        let mut stdout = child.stdout.take().ok_or(NativeHostError::Exited)?;

        match write_frame(&mut stdin, payload).await {
            Ok(()) => {}
            Err(FrameError::Io(err)) if err.kind() == io::ErrorKind::BrokenPipe => {
                return Err(NativeHostError::Exited);
            }
            Err(err) => return Err(NativeHostError::Protocol(err)),
        }
        drop(stdin);

        let reply = read_frame(&mut stdout, MAX_HOST_MESSAGE)
            .await
            .map_err(NativeHostError::Protocol)?
            .ok_or(NativeHostError::Exited)?;

        // One reply ends the exchange; stop a host that is still running.
        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                debug!(%status, "native host exited after replying");
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(err) = child.start_kill() {
                    warn!(?err, "failed to stop native host after its reply");
                }
                tokio::spawn(async move {
                    if let Err(err) = child.wait().await {
                        warn!(?err, "failed to reap native host");
                    }
                });
            }
            Err(err) => warn!(?err, "failed to poll native host status"),
        }

        Ok(reply)
    }
}

#[async_trait]
impl NativeHost for ProcessHost {
    async fn send(&self, payload: &NativePayload) -> Result<Value, NativeHostError> {
        match time::timeout(self.config.timeout, self.exchange(payload)).await {
            Ok(result) => result,
            Err(_) => Err(NativeHostError::Timeout(self.config.timeout)),
        }
    }
}

/// Stand-in used when no host program is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct MissingHost;

#[async_trait]
impl NativeHost for MissingHost {
    async fn send(&self, _payload: &NativePayload) -> Result<Value, NativeHostError> {
        Err(NativeHostError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HeaderList;
    use serde_json::json;

    fn payload() -> NativePayload {
        NativePayload {
            manifest_url: "https://x/manifest.json".into(),
            license_url: "https://x/license".into(),
            body_base64: Some("AQI=".into()),
            body_escaped: Some(r"\x01\x02".into()),
            headers: HeaderList::default(),
            title: "video".into(),
            delete_me: false,
        }
    }

    #[tokio::test]
    async fn frames_round_trip_through_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, &payload()).await.unwrap();
        let received = read_frame(&mut server, MAX_HOST_MESSAGE)
            .await
            .unwrap()
            .expect("one frame");

        assert_eq!(received["licenseUrl"], json!("https://x/license"));
        assert_eq!(received["bodyEscaped"], json!(r"\x01\x02"));
    }

    #[tokio::test]
    async fn length_prefix_is_native_endian() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &json!({ "status": "success" }))
            .await
            .unwrap();

        let body = br#"{"status":"success"}"#;
        assert_eq!(&buffer[..4], &(body.len() as u32).to_ne_bytes());
        assert_eq!(&buffer[4..], body);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(64_u32).to_ne_bytes());
        bytes.extend_from_slice(&[b' '; 64]);

        let result = read_frame(&mut bytes.as_slice(), 16).await;
        assert!(matches!(result, Err(FrameError::TooLarge(64))));
    }

    #[tokio::test]
    async fn closed_stream_reads_as_none() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, MAX_HOST_MESSAGE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_program_reports_host_not_found() {
        let host = ProcessHost::new(ProcessHostConfig {
            program: PathBuf::from("/nonexistent/licensetap-native-host"),
            args: Vec::new(),
            timeout: Duration::from_secs(5),
        });

        let error = host.send(&payload()).await.unwrap_err();
        assert!(matches!(error, NativeHostError::NotFound));
        assert_eq!(
            error.to_string(),
            "Specified native messaging host not found."
        );
    }

    fn shell_host(script: &str, timeout: Duration) -> ProcessHost {
        ProcessHost::new(ProcessHostConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
            timeout,
        })
    }

    #[cfg(all(unix, target_endian = "little"))]
    #[tokio::test]
    async fn relays_the_host_reply() {
        let host = shell_host(
            r#"cat > /dev/null; printf '\024\000\000\000{"status":"success"}'"#,
            Duration::from_secs(5),
        );

        let reply = host.send(&payload()).await.expect("host replies");
        assert_eq!(reply, json!({ "status": "success" }));
    }

    #[cfg(all(unix, target_endian = "little"))]
    #[tokio::test]
    async fn reply_is_kept_when_host_keeps_running() {
        let host = shell_host(
            r#"cat > /dev/null; printf '\024\000\000\000{"status":"success"}'; sleep 3"#,
            Duration::from_secs(1),
        );

        let reply = host.send(&payload()).await.expect("reply arrives before the timeout");
        assert_eq!(reply, json!({ "status": "success" }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_host_exit_is_a_channel_failure() {
        let host = shell_host("cat > /dev/null", Duration::from_secs(5));
        let error = host.send(&payload()).await.unwrap_err();
        assert!(matches!(error, NativeHostError::Exited));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_host_times_out() {
        let host = shell_host("sleep 5", Duration::from_millis(100));
        let error = host.send(&payload()).await.unwrap_err();
        assert!(matches!(error, NativeHostError::Timeout(_)));
    }

    #[tokio::test]
    async fn unconfigured_host_fails_like_a_missing_one() {
        let error = MissingHost.send(&payload()).await.unwrap_err();
        assert!(matches!(error, NativeHostError::NotFound));
    }
}
