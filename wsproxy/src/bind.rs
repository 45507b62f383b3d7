//! Full-duplex byte-stream bridging.
//!
//! A [`Leg`] is one side of a bridge: a stream of inbound chunks plus a sink
//! accepting outbound chunks. [`bind`] pumps bytes between two legs until one
//! side ends or fails, then stops both exactly once.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub struct Leg<R, W> {
    name: &'static str,
    reader: R,
    writer: W,
    stopped: bool,
}

impl<R, W> Leg<R, W>
where
    R: Stream<Item = io::Result<Bytes>> + Unpin,
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    pub fn new(name: &'static str, reader: R, writer: W) -> Self {
        Self {
            name,
            reader,
            writer,
            stopped: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Closes the outbound side. Returns `false` if the leg was already stopped.
    pub async fn stop(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        if let Err(e) = self.writer.close().await {
            trace!("{}: close failed: {}", self.name, e);
        }
        true
    }
}

/// Wraps any tokio byte stream (TCP socket, duplex pipe) as a [`Leg`].
pub fn io_leg<T>(
    name: &'static str,
    io: T,
) -> Leg<
    impl Stream<Item = io::Result<Bytes>> + Unpin,
    impl Sink<Bytes, Error = io::Error> + Unpin,
>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(io);
    let reader = FramedRead::new(read_half, BytesCodec::new()).map_ok(BytesMut::freeze);
    let writer = FramedWrite::new(write_half, BytesCodec::new());
    Leg::new(name, reader, writer)
}

#[derive(Debug, Clone, Default)]
pub struct BindOptions {
    pub idle_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The named leg reached end of stream.
    Closed(&'static str),
    /// Reading from or writing to the named leg failed.
    Failed(&'static str),
    Idle,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct BindReport {
    pub reason: StopReason,
    pub a_to_b: u64,
    pub b_to_a: u64,
}

enum PumpEnd {
    Eof,
    ReadFailed,
    WriteFailed,
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Notify,
    counter: &mut u64,
) -> PumpEnd
where
    R: Stream<Item = io::Result<Bytes>> + Unpin,
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(chunk)) => {
                activity.notify_one();
                *counter += chunk.len() as u64;
                // `send` waits for the sink to accept and flush the chunk.
                if writer.send(chunk).await.is_err() {
                    return PumpEnd::WriteFailed;
                }
            }
            Some(Err(e)) => {
                trace!("read failed: {}", e);
                return PumpEnd::ReadFailed;
            }
            None => return PumpEnd::Eof,
        }
    }
}

async fn watch_idle(activity: &Notify, idle_timeout: Option<Duration>) {
    let Some(idle_timeout) = idle_timeout else {
        return std::future::pending().await;
    };
    while tokio::time::timeout(idle_timeout, activity.notified())
        .await
        .is_ok()
    {}
}

/// Bridges `a` and `b` until either side finishes, then stops both legs.
pub async fn bind<RA, WA, RB, WB>(
    mut a: Leg<RA, WA>,
    mut b: Leg<RB, WB>,
    options: BindOptions,
) -> BindReport
where
    RA: Stream<Item = io::Result<Bytes>> + Unpin,
    WA: Sink<Bytes, Error = io::Error> + Unpin,
    RB: Stream<Item = io::Result<Bytes>> + Unpin,
    WB: Sink<Bytes, Error = io::Error> + Unpin,
{
    let activity = Notify::new();
    let (mut a_to_b, mut b_to_a) = (0u64, 0u64);
    let (a_name, b_name) = (a.name, b.name);

    let reason = {
        let forward = pump(&mut a.reader, &mut b.writer, &activity, &mut a_to_b);
        let backward = pump(&mut b.reader, &mut a.writer, &activity, &mut b_to_a);

        tokio::select! {
            end = forward => match end {
                PumpEnd::Eof => StopReason::Closed(a_name),
                PumpEnd::ReadFailed => StopReason::Failed(a_name),
                PumpEnd::WriteFailed => StopReason::Failed(b_name),
            },
            end = backward => match end {
                PumpEnd::Eof => StopReason::Closed(b_name),
                PumpEnd::ReadFailed => StopReason::Failed(b_name),
                PumpEnd::WriteFailed => StopReason::Failed(a_name),
            },
            _ = watch_idle(&activity, options.idle_timeout) => StopReason::Idle,
            _ = options.cancel.cancelled() => StopReason::Cancelled,
        }
    };

    // A failed writer cannot be closed gracefully, so only mark it.
    match reason {
        StopReason::Failed(name) if name == a_name => a.stopped = true,
        StopReason::Failed(_) => b.stopped = true,
        _ => {}
    }
    a.stop().await;
    b.stop().await;

    debug!(
        "Bridge {} <-> {} stopped ({:?}, {} bytes -> {} bytes <-)",
        a_name, b_name, reason, a_to_b, b_to_a
    );
    BindReport {
        reason,
        a_to_b,
        b_to_a,
    }
}
