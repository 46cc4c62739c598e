//! Broker wire protocol and message framing.
//!
//! Transport format: 4-byte big-endian length prefix followed by a JSON
//! payload. Messages addressed to a given child id are delivered to that
//! child in send order (single relay queue per id); there is no ordering
//! guarantee across different ids. Privileged command responses may arrive
//! out of request order; correlation is solely by `cmdid`.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload. Frames beyond this are treated
/// as a protocol error rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Message from the main process to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerRequest {
    /// Fork a worker child process impersonating the given OS identity.
    ///
    /// No explicit ack is produced; subsequent [`BrokerRequest::Relay`]
    /// messages for `id` queue against the new relay.
    SpawnChild {
        /// Worker id the child will be keyed by.
        id: String,
        /// Target OS user id.
        uid: u32,
        /// Target OS group id.
        gid: u32,
        /// Home-directory/working-directory override.
        home_dir: PathBuf,
    },

    /// Opaque payload forwarded verbatim to the child identified by `id`.
    Relay {
        /// Target child id.
        id: String,
        /// Opaque payload.
        content: serde_json::Value,
    },

    /// Execute a privileged command under the broker's elevated identity.
    ///
    /// Always answered with [`BrokerEvent::ExecCmdResponse`] carrying the
    /// same `cmdid`, success or failure.
    ExecCmd {
        /// Caller-generated correlation id, unique among in-flight
        /// requests.
        cmdid: String,
        /// Command name; the broker expands known composite names into
        /// multi-step sequences.
        cmd: String,
        /// Command parameters.
        params: Vec<String>,
    },

    /// Force-kill the child identified by `id`.
    KillChild {
        /// Target child id.
        id: String,
    },

    /// Drop the broker's handle for `id`, if any.
    Forget {
        /// Session or worker id to forget.
        id: String,
    },

    /// Ask the broker to terminate its remaining children and exit.
    Shutdown,
}

/// Message from the broker to the main process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    /// Child-originated payload, tagged with the child's id.
    Relay {
        /// Originating child id.
        id: String,
        /// Opaque payload.
        content: serde_json::Value,
    },

    /// Correlated result of an [`BrokerRequest::ExecCmd`].
    ExecCmdResponse {
        /// Correlation id from the request.
        cmdid: String,
        /// First error of the executed command/sequence, if any.
        err: Option<String>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },

    /// Broker- or child-originated log record, forwarded untagged so the
    /// main process can fold it into its own logging stream. Not
    /// correlated to any request.
    Log {
        /// Log level name (`error`, `warn`, `info`, `debug`).
        level: String,
        /// Log message.
        message: String,
    },

    /// Completion signal for the child identified by `id`.
    ///
    /// Emitted when the child reports completion itself, and synthesized
    /// by the broker when a child dies without a prior graceful
    /// disconnect, so owners can unwind instead of hanging.
    SessionCompleted {
        /// Completed child id.
        id: String,
    },
}

/// Write one length-prefixed frame.
///
/// # Errors
///
/// Returns any transport I/O error, or `InvalidData` if `payload` exceeds
/// [`MAX_FRAME_LEN`].
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds maximum", payload.len()),
        ));
    }
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_LEN
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream before a length prefix.
///
/// # Errors
///
/// Returns any transport I/O error, `UnexpectedEof` for a stream that ends
/// mid-frame, or `InvalidData` for a frame exceeding [`MAX_FRAME_LEN`].
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds maximum"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, b"second").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"second");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        // Length prefix promising 8 bytes, stream ends after 3.
        use tokio::io::AsyncWriteExt;
        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading() {
        let (mut a, mut b) = tokio::io::duplex(64);

        use tokio::io::AsyncWriteExt;
        #[allow(clippy::cast_possible_truncation)]
        let bad_len = (MAX_FRAME_LEN as u32) + 1;
        a.write_all(&bad_len.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn requests_serialize_with_snake_case_tags() {
        let request = BrokerRequest::SpawnChild {
            id: "w-1".to_string(),
            uid: 1000,
            gid: 1000,
            home_dir: PathBuf::from("/home/acme"),
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"spawn_child\""));
        assert!(json.contains("\"home_dir\":\"/home/acme\""));

        let parsed: BrokerRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn exec_response_round_trips_err_field() {
        let event = BrokerEvent::ExecCmdResponse {
            cmdid: "42".to_string(),
            err: None,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"err\":null"));

        let parsed: BrokerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
