//! Full-duplex forwarding between a session's source and destination.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use super::boundary::BoxedStream;

const CHUNK_SIZE: usize = 8192;

/// How long the destination may keep answering after the source finished.
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The source side of a session, split once and kept across destination
/// reconnections.
pub(crate) struct SourceHalves {
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
}

impl SourceHalves {
    pub(crate) fn new(stream: BoxedStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self { reader, writer }
    }
}

/// Why a pipe stopped.
#[derive(Debug)]
pub(crate) enum PipeEnd {
    /// The source finished or failed. The destination was drained first
    /// when the source finished cleanly.
    Source(String),
    /// The destination closed or failed while the source was still open.
    Destination(String),
}

/// Byte counters, `ingress` is source to destination.
#[derive(Debug, Default)]
pub struct Traffic {
    pub ingress: AtomicU64,
    pub egress: AtomicU64,
}

enum Fault {
    Read(io::Error),
    Write(io::Error),
}

/// Forwards bytes both ways until one side ends.
///
/// The destination stream is consumed: when this returns it has been
/// dropped, so nothing buffered for it survives into a later connection.
pub(crate) async fn pipe(source: &mut SourceHalves, destination: BoxedStream, traffic: &Traffic) -> PipeEnd {
    pipe_with_drain(source, destination, traffic, DRAIN_TIMEOUT).await
}

async fn pipe_with_drain(
    source: &mut SourceHalves,
    destination: BoxedStream,
    traffic: &Traffic,
    drain: Duration,
) -> PipeEnd {
    let (mut dest_reader, mut dest_writer) = tokio::io::split(destination);

    let ingress = copy_half(&mut source.reader, &mut dest_writer, true, &traffic.ingress);
    let egress = copy_half(&mut dest_reader, &mut source.writer, false, &traffic.egress);
    tokio::pin!(ingress);
    tokio::pin!(egress);

    tokio::select! {
        result = &mut ingress => match result {
            // Source finished: let the destination flush its response.
            Ok(()) => {
                if tokio::time::timeout(drain, egress).await.is_err() {
                    debug!(drain_ms = u64::try_from(drain.as_millis()).unwrap_or(u64::MAX), "Drain timed out");
                }
                PipeEnd::Source("source closed".to_string())
            }
            Err(Fault::Read(e)) => PipeEnd::Source(format!("source read failed: {e}")),
            Err(Fault::Write(e)) => PipeEnd::Destination(format!("destination write failed: {e}")),
        },
        result = &mut egress => match result {
            Ok(()) => PipeEnd::Destination("destination closed".to_string()),
            Err(Fault::Read(e)) => PipeEnd::Destination(format!("destination read failed: {e}")),
            Err(Fault::Write(e)) => PipeEnd::Source(format!("source write failed: {e}")),
        },
    }
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    shutdown_on_eof: bool,
    counter: &AtomicU64,
) -> Result<(), Fault>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await.map_err(Fault::Read)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await.map_err(Fault::Write)?;
        writer.flush().await.map_err(Fault::Write)?;
        counter.fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
    if shutdown_on_eof {
        writer.shutdown().await.map_err(Fault::Write)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_destination_close_keeps_source_usable() {
        let (client, source_end) = duplex(1024);
        let mut source = SourceHalves::new(Box::new(source_end));
        let (mut client_reader, mut client_writer) = tokio::io::split(client);
        let traffic = Traffic::default();

        // destination that answers once and hangs up
        let (dest, mut backend) = duplex(1024);
        let backend_task = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            backend.read_exact(&mut buf).await.unwrap();
            backend.write_all(b"pong").await.unwrap();
        });

        client_writer.write_all(b"ping").await.unwrap();
        let end = pipe(&mut source, Box::new(dest), &traffic).await;
        backend_task.await.unwrap();

        assert!(matches!(end, PipeEnd::Destination(_)));
        let mut reply = [0u8; 4];
        client_reader.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        assert_eq!(traffic.ingress.load(Ordering::Relaxed), 4);
        assert_eq!(traffic.egress.load(Ordering::Relaxed), 4);

        // a second destination reuses the same source halves
        let (dest, mut backend) = duplex(1024);
        let backend_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            backend.read_to_end(&mut buf).await.unwrap();
            buf
        });
        client_writer.write_all(b"again").await.unwrap();
        client_writer.shutdown().await.unwrap();

        let end = pipe(&mut source, Box::new(dest), &traffic).await;
        assert!(matches!(end, PipeEnd::Source(_)));
        assert_eq!(backend_task.await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn test_silent_destination_does_not_hold_a_finished_source() {
        let (mut client, source_end) = duplex(1024);
        let mut source = SourceHalves::new(Box::new(source_end));
        let traffic = Traffic::default();

        // destination that never answers and never closes
        let (dest, _backend) = duplex(1024);
        client.shutdown().await.unwrap();

        let end = tokio::time::timeout(
            Duration::from_secs(5),
            pipe_with_drain(&mut source, Box::new(dest), &traffic, Duration::from_millis(50)),
        )
        .await
        .expect("drain was not bounded");
        assert!(matches!(end, PipeEnd::Source(_)));
    }
}
