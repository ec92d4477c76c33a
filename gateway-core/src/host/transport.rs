//! Framed Unix-domain-socket transport to the printer host (spec §4.2).
//!
//! Outbound frames are a JSON object followed by a single `\x03` byte.
//! Inbound frames are read until `\x03`, trimmed, then JSON-decoded. A
//! malformed frame is logged and skipped — the connection survives a
//! single bad frame, matching `moonraker.py::KlippyConnection._read_stream`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Delimiter the printer host uses to frame both directions.
pub const FRAME_DELIMITER: u8 = 0x03;

/// How long to wait between connection attempts (spec §4.2).
pub const RECONNECT_DELAY: Duration = Duration::from_millis(250);

pub struct HostReader {
    inner: BufReader<OwnedReadHalf>,
}

impl HostReader {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            inner: BufReader::new(half),
        }
    }

    /// Reads one complete frame, decoding it as JSON. Returns `Ok(None)`
    /// on clean EOF (peer closed the socket). A single malformed frame is
    /// reported via `Err` to the caller, which logs and continues reading
    /// rather than tearing down the connection.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<ReadOutcome>> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = self.inner.read(&mut byte).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                // Peer closed mid-frame; treat as a malformed frame, not EOF.
                return Ok(Some(ReadOutcome::Malformed(
                    String::from_utf8_lossy(&buf).into_owned(),
                )));
            }
            if byte[0] == FRAME_DELIMITER {
                break;
            }
            buf.push(byte[0]);
        }
        let text = String::from_utf8_lossy(&buf);
        match serde_json::from_str::<Value>(text.trim()) {
            Ok(value) => Ok(Some(ReadOutcome::Value(value))),
            Err(_) => Ok(Some(ReadOutcome::Malformed(text.into_owned()))),
        }
    }
}

pub enum ReadOutcome {
    Value(Value),
    Malformed(String),
}

pub struct HostWriter {
    inner: OwnedWriteHalf,
}

impl HostWriter {
    fn new(half: OwnedWriteHalf) -> Self {
        Self { inner: half }
    }

    pub async fn write_frame(&mut self, value: &Value) -> std::io::Result<()> {
        let mut bytes = serde_json::to_vec(value).expect("Value always serializes");
        bytes.push(FRAME_DELIMITER);
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await
    }
}

/// Opens a stream socket to `path`. Callers implement the retry-forever
/// policy themselves (see `host::connection`); this just performs one
/// attempt so it composes with cancellation.
pub async fn connect_once(path: &Path) -> std::io::Result<(HostReader, HostWriter)> {
    let stream = UnixStream::connect(path).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((HostReader::new(read_half), HostWriter::new(write_half)))
}

/// Default socket path when the configuration does not override it,
/// matching `/tmp/<host>_uds` from spec §6.
pub fn default_socket_path(program_name: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/{program_name}_uds"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut reader = HostReader::new(read_half);
            let mut writer = HostWriter::new(write_half);
            let frame = reader.read_frame().await.unwrap().unwrap();
            let ReadOutcome::Value(v) = frame else {
                panic!("expected value");
            };
            writer.write_frame(&v).await.unwrap();
        });

        let (mut reader, mut writer) = connect_once(&path).await.unwrap();
        writer
            .write_frame(&serde_json::json!({"id": 1, "method": "info"}))
            .await
            .unwrap();
        let echoed = reader.read_frame().await.unwrap().unwrap();
        let ReadOutcome::Value(v) = echoed else {
            panic!("expected value");
        };
        assert_eq!(v["method"], "info");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_frame_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut reader = HostReader::new(read_half);
            let mut _writer = HostWriter::new(write_half);
            let bad = reader.read_frame().await.unwrap().unwrap();
            assert!(matches!(bad, ReadOutcome::Malformed(_)));
            let good = reader.read_frame().await.unwrap().unwrap();
            assert!(matches!(good, ReadOutcome::Value(_)));
        });

        let (_reader, mut writer) = connect_once(&path).await.unwrap();
        writer.inner.write_all(b"not json\x03").await.unwrap();
        writer
            .write_frame(&serde_json::json!({"id": 2}))
            .await
            .unwrap();
        server.await.unwrap();
    }
}
