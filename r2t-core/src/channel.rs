//! The channel codec (spec.md §4.1): frames one `AsyncRead + AsyncWrite` transport into the
//! `Frame` stream both peers speak. A writer task drains an unbounded queue of outgoing frames —
//! giving the FIFO ordering guarantee of spec.md §5 for free, since one task alone ever touches
//! the wire — while a reader task slices complete frames out of a `GrowBuffer` and hands them to
//! a per-peer dispatch closure, stamping the liveness clock on every successful read.

use std::{
    cell::Cell,
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};

use r2t_proto::{try_parse_frame, Frame};

use crate::iobuf::GrowBuffer;

/// Timestamp of the most recent successfully-read byte, shared between the reader task and
/// whoever needs to answer "is the channel still alive" (spec.md §3 invariant 3).
#[derive(Clone)]
pub struct LivenessClock(Rc<Cell<Instant>>);

impl LivenessClock {
    fn new() -> Self {
        Self(Rc::new(Cell::new(Instant::now())))
    }

    fn touch(&self) {
        self.0.set(Instant::now());
    }

    pub fn elapsed(&self) -> Duration {
        self.0.get().elapsed()
    }
}

/// A cheap-to-clone handle to the channel's write side.
#[derive(Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<Frame>,
    liveness: LivenessClock,
}

impl ChannelHandle {
    /// Queues a frame for the writer task. If the writer task has already exited (the transport
    /// is gone), the frame is silently dropped — the caller is about to notice the same disconnect
    /// from its own side.
    pub fn send(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.liveness.elapsed() < timeout
    }
}

/// Spawns the reader and writer tasks for one channel transport on the current `LocalSet` and
/// returns a handle to the write side. `on_frame` runs inline on every complete inbound frame.
pub fn spawn<R, W, F>(read_half: R, write_half: W, on_frame: F) -> ChannelHandle
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
    F: FnMut(Frame) + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let liveness = LivenessClock::new();

    tokio::task::spawn_local(writer_task(write_half, rx));
    tokio::task::spawn_local(reader_task(read_half, liveness.clone(), on_frame));

    ChannelHandle { tx, liveness }
}

async fn writer_task<W: AsyncWrite + Unpin>(mut write_half: W, mut rx: mpsc::UnboundedReceiver<Frame>) {
    let mut out = BytesMut::new();
    while let Some(frame) = rx.recv().await {
        out.clear();
        frame.encode(&mut out);
        if let Err(error) = write_half.write_all(&out).await {
            tracing::warn!("channel write failed, closing writer task: {error}");
            return;
        }
    }
    tracing::debug!("channel writer task exiting: no remaining senders");
}

async fn reader_task<R, F>(mut read_half: R, liveness: LivenessClock, mut dispatch: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(Frame),
{
    let mut buf = GrowBuffer::new();
    loop {
        let reserved = buf.reserve_for_read();
        let n = match read_half.read_buf(buf.as_bytes_mut()).await {
            Ok(0) => {
                tracing::info!("channel closed (EOF)");
                return;
            }
            Ok(n) => n,
            Err(error) => {
                tracing::warn!("channel read failed: {error}");
                return;
            }
        };
        buf.note_read(n, reserved);
        liveness.touch();

        loop {
            match try_parse_frame(buf.as_bytes_mut()) {
                Ok(Some(frame)) => dispatch(frame),
                Ok(None) => break,
                Err(error) => {
                    tracing::error!("fatal channel protocol error, tearing down: {error}");
                    return;
                }
            }
        }
    }
}
