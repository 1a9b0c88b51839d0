//! Client-side call dispatch: the control round-trip, the background stream
//! printer, and the direct (already-remote) invocation path.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::client::{ClientInner, RemoteValue};
use crate::codec::{self, CallRecord, Reply};
use crate::error::{Error, RemoteException, Result};
use crate::function::RegisteredFn;
use crate::shm::SharedArray;
use crate::worker;

const CLOSED_MSG: &str = "Daemon closed RPC connection unexpectedly";

/// Runs one call against the sandbox's worker, printing stream frames to
/// the caller's stdout while the control reply is awaited.
pub(crate) async fn dispatch(
    client: &ClientInner,
    sandbox_id: &str,
    members: &[Arc<RegisteredFn>],
    record: CallRecord,
) -> Result<RemoteValue> {
    let handle = worker::ensure_worker(client, sandbox_id, members).await?;
    debug!("dispatching {} into sandbox {sandbox_id}", record.function);
    call_worker(
        &handle.rpc_path,
        &handle.stream_path,
        record,
        tokio::io::stdout(),
    )
    .await
}

/// The two-channel exchange with a running worker. The control connection
/// is opened first, then the stream connection; the worker accepts in this
/// order.
pub(crate) async fn call_worker<W>(
    rpc_path: &Path,
    stream_path: &Path,
    record: CallRecord,
    sink: W,
) -> Result<RemoteValue>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut control = connect(rpc_path).await?;
    let stream = connect(stream_path).await?;

    // Detached: dies quietly on the first stream error or EOF, and never
    // blocks client shutdown.
    tokio::spawn(pump_stream(stream, sink));

    let payload = record.to_bytes()?;
    codec::write_frame(&mut control, &payload).await?;

    let reply = match codec::read_frame(&mut control).await {
        Ok(Some(bytes)) => Reply::from_bytes(&bytes)?,
        Ok(None) => return Err(Error::Transport(CLOSED_MSG.to_string())),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(Error::Transport(CLOSED_MSG.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    decode_reply(reply)
}

/// Copies stream frames into `sink` as they arrive, decoding UTF-8 with
/// replacement and adding nothing.
async fn pump_stream<R, W>(mut stream: R, mut sink: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Ok(Some(frame)) = codec::read_frame(&mut stream).await {
        let text = String::from_utf8_lossy(&frame).into_owned();
        if sink.write_all(text.as_bytes()).await.is_err() {
            break;
        }
        let _ = sink.flush().await;
    }
}

fn decode_reply(reply: Reply) -> Result<RemoteValue> {
    match reply {
        Reply::Ok(value) => Ok(RemoteValue::Json(value)),
        Reply::Shm { name, shape, dtype } => {
            let dtype = dtype.parse()?;
            Ok(RemoteValue::Array(SharedArray::attach(&name, shape, dtype)?))
        }
        Reply::Err {
            kind,
            message,
            traceback,
        } => Err(Error::Remote {
            traceback,
            cause: RemoteException { kind, message },
        }),
    }
}

#[cfg(unix)]
async fn connect(path: &Path) -> io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn connect(path: &Path) -> io::Result<tokio::net::TcpStream> {
    // The locator file holds the loopback port the worker bound.
    let port: u16 = tokio::fs::read_to_string(path)
        .await?
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed port file"))?;
    tokio::net::TcpStream::connect(("127.0.0.1", port)).await
}

/// Already-remote degradation: run the function synchronously under the
/// ambient interpreter with inherited stdio. No sandbox, no worker, no
/// sockets.
pub(crate) async fn run_direct(
    client: &ClientInner,
    members: &[Arc<RegisteredFn>],
    record: CallRecord,
) -> Result<RemoteValue> {
    let scratch = tempfile::tempdir()?;
    let driver = scratch.path().join("ml3_direct.py");
    let call_path = scratch.path().join("call.json");
    let result_path = scratch.path().join("result.json");

    std::fs::write(&driver, worker::render_direct_driver(members))?;
    std::fs::write(&call_path, record.to_bytes()?)?;
    debug!("direct invocation of {}", record.function);

    let status = tokio::process::Command::new(&client.python)
        .arg(&driver)
        .arg(&call_path)
        .arg(&result_path)
        .env("ML3_IN_DAEMON", "1")
        .status()
        .await?;
    if !status.success() {
        return Err(Error::Fatal(format!(
            "direct invocation of {} exited with {status}",
            record.function
        )));
    }
    decode_reply(Reply::from_bytes(&std::fs::read(&result_path)?)?)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn record(function: &str) -> CallRecord {
        CallRecord {
            function: function.to_string(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
        }
    }

    struct MockWorker {
        rpc_path: PathBuf,
        stream_path: PathBuf,
    }

    /// Binds both endpoints and serves exactly one call with `behavior`.
    fn mock_worker<F, Fut>(dir: &TempDir, behavior: F) -> MockWorker
    where
        F: FnOnce(tokio::net::UnixStream, tokio::net::UnixStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let rpc_path = dir.path().join("w.rpc.sock");
        let stream_path = dir.path().join("w.stream.sock");
        let rpc_srv = UnixListener::bind(&rpc_path).unwrap();
        let stream_srv = UnixListener::bind(&stream_path).unwrap();
        tokio::spawn(async move {
            let (rpc_conn, _) = rpc_srv.accept().await.unwrap();
            let (stream_conn, _) = stream_srv.accept().await.unwrap();
            behavior(rpc_conn, stream_conn).await;
        });
        MockWorker {
            rpc_path,
            stream_path,
        }
    }

    async fn call(worker: &MockWorker, rec: CallRecord) -> (Result<RemoteValue>, String) {
        let (sink, mut sink_far) = tokio::io::duplex(4096);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            call_worker(&worker.rpc_path, &worker.stream_path, rec, sink),
        )
        .await
        .expect("call timed out");
        let mut printed = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), sink_far.read_to_end(&mut printed))
            .await
            .expect("stream pump did not finish")
            .unwrap();
        (result, String::from_utf8(printed).unwrap())
    }

    #[tokio::test]
    async fn test_ok_reply_with_stream_order() {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let worker = mock_worker(&dir, |mut rpc, mut stream| async move {
            let request = codec::read_frame(&mut rpc).await.unwrap().unwrap();
            let decoded: serde_json::Value = serde_json::from_slice(&request).unwrap();
            assert_eq!(decoded, json!(["emit", [], {}]));

            codec::write_frame(&mut stream, b"A").await.unwrap();
            codec::write_frame(&mut stream, b"B").await.unwrap();
            codec::write_frame(&mut rpc, br#"["OK", 0]"#).await.unwrap();
        });

        let (result, printed) = call(&worker, record("emit")).await;
        match result.unwrap() {
            RemoteValue::Json(value) => assert_eq!(value, json!(0)),
            other => panic!("expected Json, got {other:?}"),
        }
        assert_eq!(printed, "AB");
    }

    #[tokio::test]
    async fn test_err_reply_raises_remote() {
        let dir = TempDir::new().unwrap();
        let worker = mock_worker(&dir, |mut rpc, _stream| async move {
            codec::read_frame(&mut rpc).await.unwrap();
            let reply = br#"["ERR", {"type": "ValueError", "message": "boom"}, "Traceback:\n  in explode\nValueError: boom\n"]"#;
            codec::write_frame(&mut rpc, reply).await.unwrap();
        });

        let (result, _) = call(&worker, record("explode")).await;
        match result.unwrap_err() {
            Error::Remote { traceback, cause } => {
                assert!(traceback.contains("boom"));
                assert!(traceback.contains("explode"));
                assert_eq!(cause.kind, "ValueError");
                assert_eq!(cause.message, "boom");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_error_message_carries_traceback() {
        let err = decode_reply(Reply::Err {
            kind: "ValueError".to_string(),
            message: "boom".to_string(),
            traceback: "Traceback (most recent call last):\nValueError: boom\n".to_string(),
        })
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Traceback"));
        assert!(message.contains("boom"));
        let source = std::error::Error::source(&err).expect("cause attached");
        assert_eq!(source.to_string(), "ValueError: boom");
    }

    #[tokio::test]
    async fn test_early_close_is_transport_error() {
        let dir = TempDir::new().unwrap();
        let worker = mock_worker(&dir, |mut rpc, _stream| async move {
            codec::read_frame(&mut rpc).await.unwrap();
            // Close without replying.
        });

        let (result, _) = call(&worker, record("f")).await;
        match result.unwrap_err() {
            Error::Transport(msg) => {
                assert_eq!(msg, "Daemon closed RPC connection unexpectedly");
            }
            other => panic!("expected Transport, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_reply_is_transport_error() {
        let dir = TempDir::new().unwrap();
        let worker = mock_worker(&dir, |mut rpc, _stream| async move {
            codec::read_frame(&mut rpc).await.unwrap();
            rpc.write_all(&32u32.to_be_bytes()).await.unwrap();
            rpc.write_all(b"[\"OK\"").await.unwrap();
            // Close mid-payload.
        });

        let (result, _) = call(&worker, record("f")).await;
        assert!(matches!(result.unwrap_err(), Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_protocol_drift() {
        let dir = TempDir::new().unwrap();
        let worker = mock_worker(&dir, |mut rpc, _stream| async move {
            codec::read_frame(&mut rpc).await.unwrap();
            codec::write_frame(&mut rpc, br#"["SURPRISE", 1]"#).await.unwrap();
        });

        let (result, _) = call(&worker, record("f")).await;
        match result.unwrap_err() {
            Error::Protocol(msg) => assert_eq!(msg, "Unknown response from daemon"),
            other => panic!("expected Protocol, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lossy_stream_decoding() {
        let dir = TempDir::new().unwrap();
        let worker = mock_worker(&dir, |mut rpc, mut stream| async move {
            codec::read_frame(&mut rpc).await.unwrap();
            codec::write_frame(&mut stream, &[0xFF, 0xFE, b'x']).await.unwrap();
            codec::write_frame(&mut rpc, br#"["OK", null]"#).await.unwrap();
        });

        let (result, printed) = call(&worker, record("f")).await;
        assert!(result.is_ok());
        assert_eq!(printed, "\u{FFFD}\u{FFFD}x");
    }
}
