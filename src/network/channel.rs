//! `NetworkDataChannel`: the single authenticated TCP server a run's
//! remote compute workers connect to (spec §4.9).
//!
//! One instance per run. Each accepted connection is authenticated, sent
//! the init payload, and then drives a loop feeding it work blocks and
//! collecting results into the same [`crate::buffer::BlockBuffer`] a
//! thread-based compute worker would populate directly, so the rest of
//! the engine cannot tell workers apart by transport.

use super::protocol::{self, InitMessage, Message, WorkBlockMessage};
use crate::assoc::{BlockArray, BlockAssociations, SlotKey};
use crate::block::BlockDefn;
use crate::buffer::BlockBuffer;
use crate::control::Control;
use crate::error::{RiosError, WorkerErrorRecord, WorkerKind};
use crate::timers::TimerMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Barrier;

/// Shared state for one run's remote channel: pending work, completed
/// results, an exception queue, and a start barrier so no worker begins
/// processing before every expected worker has connected and
/// authenticated (spec §4.9).
pub struct NetworkDataChannel {
    auth_key: String,
    control: Arc<Control>,
    expected_workers: usize,
    outbound: Arc<BlockBuffer>,
    inbound: Arc<BlockBuffer>,
    timers: Arc<TimerMap>,
    exceptions: Mutex<Vec<WorkerErrorRecord>>,
    force_exit: AtomicBool,
    start_barrier: Arc<Barrier>,
}

impl NetworkDataChannel {
    pub fn new(auth_key: String, control: Arc<Control>, expected_workers: usize, outbound: Arc<BlockBuffer>, inbound: Arc<BlockBuffer>) -> Self {
        Self {
            auth_key,
            control,
            expected_workers,
            outbound,
            inbound,
            timers: Arc::new(TimerMap::new()),
            exceptions: Mutex::new(Vec::new()),
            force_exit: AtomicBool::new(false),
            // +1 for the driver's own slot: it joins the same barrier in
            // `wait_for_workers` once it has launched every worker (spec §4.9).
            start_barrier: Arc::new(Barrier::new(expected_workers.max(1) + 1)),
        }
    }

    pub fn timers(&self) -> &TimerMap {
        &self.timers
    }

    pub fn exceptions(&self) -> Vec<WorkerErrorRecord> {
        self.exceptions.lock().unwrap().clone()
    }

    pub fn request_force_exit(&self) {
        self.force_exit.store(true, Ordering::SeqCst);
    }

    pub fn is_force_exit(&self) -> bool {
        self.force_exit.load(Ordering::SeqCst)
    }

    /// Join the start barrier from the driver side, meeting every worker
    /// connection once it has authenticated and received its `Init`
    /// message (spec §4.9 "meet at the barrier with the driver before
    /// block processing begins"). Times out rather than hanging forever
    /// if fewer than `expected_workers` ever connect.
    pub async fn wait_for_workers(&self, timeout: Duration) -> Result<(), RiosError> {
        tokio::time::timeout(timeout, self.start_barrier.wait())
            .await
            .map(|_| ())
            .map_err(|_| RiosError::Timeout {
                what: "compute workers reaching the start barrier".to_string(),
                seconds: timeout.as_secs_f64(),
                config_key: "barrierTimeout".to_string(),
            })
    }

    /// Bind and serve connections until `force_exit` is requested.
    pub async fn serve(self: Arc<Self>, bind_addr: &str) -> Result<(), RiosError> {
        let listener = TcpListener::bind(bind_addr).await.map_err(RiosError::from)?;
        loop {
            if self.is_force_exit() {
                return Ok(());
            }
            let (stream, _peer) = listener.accept().await.map_err(RiosError::from)?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    this.exceptions.lock().unwrap().push(WorkerErrorRecord {
                        exception_type: "NetworkError".to_string(),
                        message: e.to_string(),
                        traceback: String::new(),
                        worker_kind: WorkerKind::Compute,
                        worker_id: 0,
                    });
                    this.request_force_exit();
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), RiosError> {
        protocol::read_and_check_auth_key(&mut stream, &self.auth_key).await?;

        let worker_id = 0; // assigned by caller via InitMessage in a fuller deployment
        protocol::write_message(
            &mut stream,
            &Message::Init(InitMessage {
                control: (*self.control).clone(),
                worker_id,
                total_workers: self.expected_workers,
            }),
        )
        .await?;

        self.start_barrier.wait().await;

        loop {
            if self.is_force_exit() {
                protocol::write_message(&mut stream, &Message::Shutdown).await?;
                return Ok(());
            }

            let (block, value) = match self.outbound.pop_next_block(Duration::from_secs(3600)) {
                Ok(v) => v,
                Err(RiosError::Timeout { .. }) => continue,
                Err(e) => return Err(e),
            };

            let inputs: Vec<(SlotKey, BlockArray)> = value.iter_populated().map(|(k, v)| (k.clone(), v.clone())).collect();
            protocol::write_message(&mut stream, &Message::WorkBlock(WorkBlockMessage { block, inputs })).await?;

            match protocol::read_message(&mut stream).await? {
                Message::BlockResult(result) => {
                    self.timers.merge(&TimerMap::from_snapshot(result.timer_snapshot));
                    let mut out_value = BlockAssociations::default();
                    for (key, array) in result.outputs {
                        out_value.fill(key, array);
                    }
                    self.inbound.insert_complete_block(block, out_value, Duration::from_secs(60))?;
                }
                Message::WorkerError(err) => {
                    self.exceptions.lock().unwrap().push(WorkerErrorRecord {
                        exception_type: err.exception_type,
                        message: err.message,
                        traceback: err.traceback,
                        worker_kind: WorkerKind::Compute,
                        worker_id,
                    });
                    self.request_force_exit();
                    return Ok(());
                }
                Message::Shutdown => return Ok(()),
                other => {
                    return Err(RiosError::Ecs(format!("unexpected message from remote worker: {other:?}")));
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn driver_and_worker_meet_at_the_same_barrier() {
        let control = Arc::new(Control::default());
        let channel = Arc::new(NetworkDataChannel::new(
            "0".repeat(protocol::AUTH_KEY_LEN),
            control,
            1,
            Arc::new(BlockBuffer::new(1)),
            Arc::new(BlockBuffer::new(1)),
        ));

        let worker_barrier = channel.start_barrier.clone();
        let worker = tokio::spawn(async move {
            worker_barrier.wait().await;
        });

        channel.wait_for_workers(Duration::from_secs(5)).await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_workers_times_out_if_a_worker_never_connects() {
        let control = Arc::new(Control::default());
        let channel = NetworkDataChannel::new(
            "0".repeat(protocol::AUTH_KEY_LEN),
            control,
            1,
            Arc::new(BlockBuffer::new(1)),
            Arc::new(BlockBuffer::new(1)),
        );
        let err = channel.wait_for_workers(Duration::from_millis(20)).await;
        assert!(matches!(err, Err(RiosError::Timeout { .. })));
    }

    #[test]
    fn force_exit_flag_round_trips() {
        let control = Arc::new(Control::default());
        let channel = NetworkDataChannel::new(
            "0".repeat(protocol::AUTH_KEY_LEN),
            control,
            1,
            Arc::new(BlockBuffer::new(1)),
            Arc::new(BlockBuffer::new(1)),
        );
        assert!(!channel.is_force_exit());
        channel.request_force_exit();
        assert!(channel.is_force_exit());
    }
}
