//! Packet dispatcher
//!
//! Routes raw packets to the parser task of the endpoint they came from,
//! creating tasks on the first packet and tearing them down on disconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::packet::{MessageSink, TcpPacket};
use super::parser::ParserTask;

/// Demultiplexes packets onto per-endpoint parser tasks
pub struct PacketDispatcher {
    tasks: Mutex<HashMap<SocketAddr, Arc<ParserTask>>>,
    sink: Arc<dyn MessageSink>,
    running: AtomicBool,
    max_frame_size: usize,
}

impl PacketDispatcher {
    pub fn new(sink: Arc<dyn MessageSink>, max_frame_size: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            sink,
            running: AtomicBool::new(false),
            max_frame_size,
        }
    }

    /// Accept packets from now on
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Hand a packet to its endpoint's parser task, creating the task if needed
    pub async fn enqueue(&self, packet: TcpPacket) {
        if !self.is_running() || packet.is_empty() {
            return;
        }

        let endpoint = packet.remote();
        let task = {
            let mut tasks = self.tasks.lock().await;
            match tasks.get(&endpoint) {
                Some(task) => task.clone(),
                None => {
                    let task = Arc::new(ParserTask::new(
                        endpoint,
                        self.sink.clone(),
                        self.max_frame_size,
                    ));
                    task.start().await;
                    tasks.insert(endpoint, task.clone());
                    tracing::debug!("Created parser task for {}", endpoint);
                    task
                }
            }
        };

        if let Err(e) = task.enqueue(packet) {
            tracing::warn!("Dropping packet: {}", e);
        }
    }

    /// Stop and remove the parser task of one endpoint
    pub async fn stop_endpoint(&self, endpoint: SocketAddr) {
        let task = self.tasks.lock().await.remove(&endpoint);
        if let Some(task) = task {
            task.stop().await;
            tracing::debug!("Removed parser task for {}", endpoint);
        }
    }

    /// Stop every parser task
    ///
    /// All tasks are asked to stop before any of them is waited on, so the
    /// total time is that of the slowest task.
    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::SeqCst);

        let tasks: Vec<Arc<ParserTask>> = {
            let mut table = self.tasks.lock().await;
            table.drain().map(|(_, task)| task).collect()
        };

        for task in &tasks {
            task.begin_stop();
        }
        for task in &tasks {
            task.stop().await;
        }

        if !tasks.is_empty() {
            tracing::debug!("Stopped {} parser tasks", tasks.len());
        }
    }

    /// The parser task currently assigned to an endpoint
    pub async fn task(&self, endpoint: SocketAddr) -> Option<Arc<ParserTask>> {
        self.tasks.lock().await.get(&endpoint).cloned()
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::parser::TaskState;
    use crate::protocol::{encode_frame, Command, Message};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn frame(id: u32) -> bytes::Bytes {
        encode_frame(&Command::new("m", "c", "", id).into())
    }

    fn dispatcher() -> (
        Arc<PacketDispatcher>,
        mpsc::UnboundedReceiver<(SocketAddr, Message)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel::<(SocketAddr, Message)>();
        let dispatcher = Arc::new(PacketDispatcher::new(Arc::new(tx), 1024));
        dispatcher.start();
        (dispatcher, rx)
    }

    /// Sleeps while delivering anything from `slow`
    struct SlowSink {
        slow: SocketAddr,
        tx: mpsc::UnboundedSender<(SocketAddr, Message)>,
    }

    impl MessageSink for SlowSink {
        fn deliver(&self, from: SocketAddr, message: Message) {
            if from == self.slow {
                std::thread::sleep(Duration::from_millis(300));
            }
            let _ = self.tx.send((from, message));
        }
    }

    #[tokio::test]
    async fn test_enqueue_is_noop_when_not_running() {
        let (tx, _rx) = mpsc::unbounded_channel::<(SocketAddr, Message)>();
        let dispatcher = PacketDispatcher::new(Arc::new(tx), 1024);

        dispatcher.enqueue(TcpPacket::new(addr(1), frame(1))).await;
        assert_eq!(dispatcher.task_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_packet_creates_no_task() {
        let (dispatcher, _rx) = dispatcher();
        dispatcher.enqueue(TcpPacket::new(addr(1), Vec::new())).await;
        assert_eq!(dispatcher.task_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_first_packets_create_one_task() {
        let (dispatcher, mut rx) = dispatcher();

        let mut handles = Vec::new();
        for id in 0..16u32 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.enqueue(TcpPacket::new(addr(7), frame(id))).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(dispatcher.task_count().await, 1);
        for _ in 0..16 {
            let (from, _) = rx.recv().await.unwrap();
            assert_eq!(from, addr(7));
        }

        dispatcher.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_endpoint_does_not_block_others() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = PacketDispatcher::new(
            Arc::new(SlowSink {
                slow: addr(2),
                tx,
            }),
            1024,
        );
        dispatcher.start();

        let started = Instant::now();
        for id in 0..3 {
            dispatcher.enqueue(TcpPacket::new(addr(2), frame(id))).await;
        }
        // Garbage on the slow endpoint as well
        dispatcher
            .enqueue(TcpPacket::new(addr(2), &b"\xff\xff garbage\0"[..]))
            .await;
        dispatcher.enqueue(TcpPacket::new(addr(3), frame(100))).await;

        let (from, msg) = rx.recv().await.unwrap();
        assert_eq!(from, addr(3));
        assert_eq!(msg.id(), 100);
        assert!(started.elapsed() < Duration::from_millis(300));

        dispatcher.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_endpoint_removes_only_that_task() {
        let (dispatcher, _rx) = dispatcher();
        dispatcher.enqueue(TcpPacket::new(addr(1), frame(1))).await;
        dispatcher.enqueue(TcpPacket::new(addr(2), frame(2))).await;

        let task = dispatcher.task(addr(1)).await.unwrap();
        dispatcher.stop_endpoint(addr(1)).await;

        assert_eq!(task.state(), TaskState::Stopped);
        assert!(dispatcher.task(addr(1)).await.is_none());
        assert_eq!(dispatcher.task_count().await, 1);

        // Unknown endpoint
        dispatcher.stop_endpoint(addr(9)).await;
        assert_eq!(dispatcher.task_count().await, 1);

        dispatcher.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_all_leaves_no_running_task() {
        let (dispatcher, _rx) = dispatcher();
        for port in 1..=5 {
            dispatcher.enqueue(TcpPacket::new(addr(port), frame(port as u32))).await;
        }

        let mut tasks = Vec::new();
        for port in 1..=5 {
            tasks.push(dispatcher.task(addr(port)).await.unwrap());
        }

        dispatcher.stop_all().await;

        assert_eq!(dispatcher.task_count().await, 0);
        assert!(!dispatcher.is_running());
        assert!(tasks.iter().all(|t| t.state() == TaskState::Stopped));

        // Packets after shutdown are ignored
        dispatcher.enqueue(TcpPacket::new(addr(1), frame(1))).await;
        assert_eq!(dispatcher.task_count().await, 0);

        // Second stop is a no-op
        dispatcher.stop_all().await;
    }
}
