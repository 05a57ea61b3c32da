//! Per-endpoint packet parsing
//!
//! Every remote endpoint gets its own [`ParserTask`]. The task owns that
//! endpoint's frame buffer and parses its packets strictly in arrival order,
//! independently of every other endpoint.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use super::packet::{MessageSink, TcpPacket};
use crate::protocol::{decode_frame, FrameDecoder};

/// Parser task errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Parser task for {endpoint} is {state} and no longer accepts packets")]
    NotAccepting {
        endpoint: SocketAddr,
        state: TaskState,
    },

    #[error("Packet for {packet} enqueued on the task of {endpoint}")]
    WrongEndpoint {
        endpoint: SocketAddr,
        packet: SocketAddr,
    },
}

pub type TaskResult<T> = Result<T, TaskError>;

/// Lifecycle of a parser task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Exists and queues packets, but is not consuming yet
    Created = 0,
    /// Consuming and parsing packets
    Running = 1,
    /// Finishing the packets already queued; new packets are refused
    Stopping = 2,
    /// Terminal
    Stopped = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Created,
            1 => TaskState::Running,
            2 => TaskState::Stopping,
            _ => TaskState::Stopped,
        }
    }

    pub fn accepts_packets(self) -> bool {
        matches!(self, TaskState::Created | TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Stopping => "stopping",
            TaskState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Receiver before start, join handle after
struct Lifecycle {
    queue_rx: Option<mpsc::UnboundedReceiver<TcpPacket>>,
    handle: Option<JoinHandle<()>>,
}

/// Ordered parsing pipeline for a single endpoint
pub struct ParserTask {
    endpoint: SocketAddr,
    state: Arc<AtomicU8>,
    queue_tx: mpsc::UnboundedSender<TcpPacket>,
    lifecycle: Mutex<Lifecycle>,
    stop_signal: Arc<Notify>,
    sink: Arc<dyn MessageSink>,
    max_frame_size: usize,
}

impl ParserTask {
    /// Create a task in the `Created` state
    pub fn new(endpoint: SocketAddr, sink: Arc<dyn MessageSink>, max_frame_size: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        Self {
            endpoint,
            state: Arc::new(AtomicU8::new(TaskState::Created as u8)),
            queue_tx,
            lifecycle: Mutex::new(Lifecycle {
                queue_rx: Some(queue_rx),
                handle: None,
            }),
            stop_signal: Arc::new(Notify::new()),
            sink,
            max_frame_size,
        }
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Start consuming queued packets (Created -> Running)
    ///
    /// Has no effect once the task has been started or asked to stop.
    pub async fn start(&self) {
        // Held until the handle is stored so `stop` always finds it
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(queue_rx) = lifecycle.queue_rx.take() else {
            return;
        };

        if self
            .state
            .compare_exchange(
                TaskState::Created as u8,
                TaskState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // Stopped before ever running
            self.state.store(TaskState::Stopped as u8, Ordering::SeqCst);
            return;
        }

        let run = run_parser(
            self.endpoint,
            queue_rx,
            FrameDecoder::with_max_frame_size(self.max_frame_size),
            self.sink.clone(),
            self.stop_signal.clone(),
            self.state.clone(),
        );
        lifecycle.handle = Some(tokio::spawn(run));

        tracing::debug!("Parser task for {} started", self.endpoint);
    }

    /// Queue a packet for parsing
    pub fn enqueue(&self, packet: TcpPacket) -> TaskResult<()> {
        if packet.remote() != self.endpoint {
            return Err(TaskError::WrongEndpoint {
                endpoint: self.endpoint,
                packet: packet.remote(),
            });
        }

        let state = self.state();
        if !state.accepts_packets() {
            return Err(TaskError::NotAccepting {
                endpoint: self.endpoint,
                state,
            });
        }

        self.queue_tx.send(packet).map_err(|_| TaskError::NotAccepting {
            endpoint: self.endpoint,
            state: self.state(),
        })
    }

    /// Ask the task to finish without waiting for it
    pub fn begin_stop(&self) {
        let advanced = [TaskState::Created, TaskState::Running].into_iter().any(|from| {
            self.state
                .compare_exchange(
                    from as u8,
                    TaskState::Stopping as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        });

        if advanced {
            self.stop_signal.notify_one();
        }
    }

    /// Stop the task and wait until its consuming loop has exited
    pub async fn stop(&self) {
        self.begin_stop();

        let handle = {
            let mut lifecycle = self.lifecycle.lock().await;
            let handle = lifecycle.handle.take();
            if handle.is_none() {
                // Never started: drop whatever was queued
                lifecycle.queue_rx.take();
            }
            handle
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Parser task for {} failed: {}", self.endpoint, e);
            }
        }

        self.state.store(TaskState::Stopped as u8, Ordering::SeqCst);
    }
}

impl fmt::Debug for ParserTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserTask")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_parser(
    endpoint: SocketAddr,
    mut queue_rx: mpsc::UnboundedReceiver<TcpPacket>,
    mut decoder: FrameDecoder,
    sink: Arc<dyn MessageSink>,
    stop_signal: Arc<Notify>,
    state: Arc<AtomicU8>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop_signal.notified() => {
                queue_rx.close();
                break;
            }
            packet = queue_rx.recv() => {
                match packet {
                    Some(packet) => parse_packet(endpoint, &mut decoder, &packet, sink.as_ref()),
                    None => break,
                }
            }
        }
    }

    // Packets queued before the stop request still belong to the stream
    while let Some(packet) = queue_rx.recv().await {
        parse_packet(endpoint, &mut decoder, &packet, sink.as_ref());
    }

    if decoder.buffered() > 0 {
        tracing::debug!(
            "Discarding {} buffered bytes of incomplete frame from {}",
            decoder.buffered(),
            endpoint
        );
    }

    state.store(TaskState::Stopped as u8, Ordering::SeqCst);
    tracing::debug!("Parser task for {} stopped", endpoint);
}

fn parse_packet(
    endpoint: SocketAddr,
    decoder: &mut FrameDecoder,
    packet: &TcpPacket,
    sink: &dyn MessageSink,
) {
    decoder.extend(packet.data());

    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => match decode_frame(&frame) {
                Ok(message) => sink.deliver(endpoint, message),
                Err(e) => {
                    tracing::warn!("Discarding malformed frame from {}: {}", endpoint, e);
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Discarding data from {}: {}", endpoint, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame, Command, Message, Response};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn channel_sink() -> (
        Arc<dyn MessageSink>,
        mpsc::UnboundedReceiver<(SocketAddr, Message)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel::<(SocketAddr, Message)>();
        (Arc::new(tx), rx)
    }

    #[tokio::test]
    async fn test_parses_in_arrival_order_across_packet_boundaries() {
        let (sink, mut rx) = channel_sink();
        let task = ParserTask::new(addr(5000), sink, 1024);
        task.start().await;
        assert_eq!(task.state(), TaskState::Running);

        let mut stream = Vec::new();
        for id in 0..20u32 {
            stream.extend_from_slice(&encode_frame(&Command::new("m", "step", "", id).into()));
        }
        // Packet boundaries deliberately cut through frames
        for chunk in stream.chunks(5) {
            assert_ok!(task.enqueue(TcpPacket::new(addr(5000), chunk.to_vec())));
        }

        for expected in 0..20u32 {
            let (from, msg) = rx.recv().await.unwrap();
            assert_eq!(from, addr(5000));
            assert_eq!(msg.id(), expected);
        }

        task.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_kill_task() {
        let (sink, mut rx) = channel_sink();
        let task = ParserTask::new(addr(5001), sink, 1024);
        task.start().await;

        assert_ok!(task.enqueue(TcpPacket::new(addr(5001), &b"not a message\0"[..])));
        assert_ok!(task.enqueue(TcpPacket::new(addr(5001), vec![0xff, 0xfe, 0x00])));
        let good = encode_frame(&Response::new("b", "ok", "", true, 1).into());
        assert_ok!(task.enqueue(TcpPacket::new(addr(5001), good)));

        let (_, msg) = rx.recv().await.unwrap();
        assert_eq!(msg.name(), "ok");
        assert_eq!(task.state(), TaskState::Running);

        task.stop().await;
    }

    #[tokio::test]
    async fn test_packets_queued_before_stop_are_parsed() {
        let (sink, mut rx) = channel_sink();
        let task = ParserTask::new(addr(5002), sink, 1024);

        // Queued while still Created
        for id in 0..3u32 {
            let frame = encode_frame(&Command::new("m", "c", "", id).into());
            assert_ok!(task.enqueue(TcpPacket::new(addr(5002), frame)));
        }
        task.start().await;
        task.stop().await;

        let mut ids = Vec::new();
        while let Ok((_, msg)) = rx.try_recv() {
            ids.push(msg.id());
        }
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_rejected() {
        let (sink, _rx) = channel_sink();
        let task = ParserTask::new(addr(5003), sink, 1024);
        task.start().await;

        task.begin_stop();
        let err = assert_err!(task.enqueue(TcpPacket::new(addr(5003), &b"m c @1\0"[..])));
        assert!(matches!(err, TaskError::NotAccepting { .. }));

        task.stop().await;
        assert_eq!(task.state(), TaskState::Stopped);
        assert_err!(task.enqueue(TcpPacket::new(addr(5003), &b"m c @1\0"[..])));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (sink, _rx) = channel_sink();
        let task = ParserTask::new(addr(5004), sink, 1024);
        task.start().await;

        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .unwrap();
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (sink, _rx) = channel_sink();
        let task = ParserTask::new(addr(5005), sink, 1024);

        task.stop().await;
        assert_eq!(task.state(), TaskState::Stopped);

        // Starting a stopped task does nothing
        task.start().await;
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_and_stop() {
        for port in 0..200u16 {
            let (sink, _rx) = channel_sink();
            let task = Arc::new(ParserTask::new(addr(6000 + port), sink.clone(), 1024));

            let starter = tokio::spawn({
                let task = task.clone();
                async move { task.start().await }
            });
            let stopper = tokio::spawn({
                let task = task.clone();
                async move { task.stop().await }
            });
            starter.await.unwrap();
            stopper.await.unwrap();

            // Whichever won, no consuming loop outlives stop()
            assert_eq!(task.state(), TaskState::Stopped);
            assert!(task.lifecycle.lock().await.handle.is_none());
            assert_eq!(Arc::strong_count(&sink), 2);
            assert_err!(task.enqueue(TcpPacket::new(addr(6000 + port), &b"m c @1\0"[..])));
        }
    }

    #[tokio::test]
    async fn test_rejects_packet_for_other_endpoint() {
        let (sink, _rx) = channel_sink();
        let task = ParserTask::new(addr(5006), sink, 1024);

        let err = assert_err!(task.enqueue(TcpPacket::new(addr(5007), &b"x"[..])));
        assert_eq!(
            err,
            TaskError::WrongEndpoint {
                endpoint: addr(5006),
                packet: addr(5007),
            }
        );
    }
}
