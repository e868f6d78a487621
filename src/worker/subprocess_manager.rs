//! Subprocess compute-worker manager (spec §4.7): the driver starts a
//! [`crate::network::channel::NetworkDataChannel`] and launches child
//! processes that connect back to it, authenticate, and pull work over
//! the wire. Co-located on the same host but in separate address
//! spaces, unlike [`super::thread_manager::ThreadComputeManager`].

use super::compute::{ComputeWorkerManager, ComputeWorkerOutcome, ExceptionQueue};
use crate::buffer::BlockBuffer;
use crate::control::Control;
use crate::error::RiosError;
use crate::network::channel::NetworkDataChannel;
use crate::network::protocol::AUTH_KEY_LEN;
use crate::timers::TimerMap;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

fn generate_auth_key() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    let mut key = String::with_capacity(AUTH_KEY_LEN);
    let alphabet = b"0123456789abcdef";
    let mut x = seed | 1;
    while key.len() < AUTH_KEY_LEN {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        key.push(alphabet[(x % 16) as usize] as char);
    }
    key
}

/// Address a spawned worker process is told to connect back to:
/// `host,port,authkey-hex` (spec §4.9 wire address format).
pub fn worker_connect_address(host: &str, port: u16, auth_key: &str) -> String {
    format!("{host},{port},{auth_key}")
}

/// Spawns `num_workers` child processes running `worker_command`, each
/// given the network address to dial back to via an environment
/// variable, and drives them through a [`NetworkDataChannel`].
pub struct SubprocessComputeManager {
    channel: Arc<NetworkDataChannel>,
    auth_key: String,
    worker_command: Vec<String>,
    connect_env_var: String,
    num_workers: usize,
    bind_host: String,
    bind_port: u16,
    rt: tokio::runtime::Runtime,
    serve_handle: Option<tokio::task::JoinHandle<Result<(), RiosError>>>,
    children: Vec<Child>,
    exceptions: ExceptionQueue,
}

impl SubprocessComputeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<Control>,
        num_workers: usize,
        outbound: Arc<BlockBuffer>,
        inbound: Arc<BlockBuffer>,
        worker_command: Vec<String>,
        connect_env_var: impl Into<String>,
        bind_host: impl Into<String>,
        bind_port: u16,
    ) -> Result<Self, RiosError> {
        let auth_key = generate_auth_key();
        let channel = Arc::new(NetworkDataChannel::new(auth_key.clone(), control, num_workers, outbound, inbound));
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(RiosError::from)?;
        Ok(Self {
            channel,
            auth_key,
            worker_command,
            connect_env_var: connect_env_var.into(),
            num_workers,
            bind_host: bind_host.into(),
            bind_port,
            rt,
            serve_handle: None,
            children: Vec::new(),
            exceptions: ExceptionQueue::new(),
        })
    }
}

impl ComputeWorkerManager for SubprocessComputeManager {
    fn start_workers(&mut self, barrier_timeout: Duration) -> Result<(), RiosError> {
        let bind_addr = format!("{}:{}", self.bind_host, self.bind_port);
        let channel = self.channel.clone();
        let handle = self.rt.spawn(async move { channel.serve(&bind_addr).await });
        self.serve_handle = Some(handle);

        let connect_addr = worker_connect_address(&self.bind_host, self.bind_port, &self.auth_key);
        for _ in 0..self.num_workers {
            let mut cmd = Command::new(&self.worker_command[0]);
            cmd.args(&self.worker_command[1..]);
            cmd.env(&self.connect_env_var, &connect_addr);
            let child = cmd.spawn().map_err(RiosError::from)?;
            self.children.push(child);
        }

        let channel = self.channel.clone();
        self.rt.block_on(channel.wait_for_workers(barrier_timeout))
    }

    fn shutdown(&mut self) -> Result<ComputeWorkerOutcome, RiosError> {
        for child in &mut self.children {
            let _ = child.wait();
        }
        self.channel.request_force_exit();
        if let Some(handle) = self.serve_handle.take() {
            let _ = self.rt.block_on(handle);
        }

        for record in self.channel.exceptions() {
            self.exceptions.push(record);
        }
        if let Some(record) = self.exceptions.first() {
            return Err(RiosError::from(record));
        }
        Ok(ComputeWorkerOutcome {
            timers: TimerMap::from_snapshot(self.channel.timers().snapshot()),
            // Aux-state round-tripping across a process boundary isn't wired
            // into the wire protocol yet (see DESIGN.md).
            other_args: None,
        })
    }

    fn exceptions(&self) -> &ExceptionQueue {
        &self.exceptions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_connect_address_formats_host_port_key() {
        let addr = worker_connect_address("127.0.0.1", 9000, "deadbeef");
        assert_eq!(addr, "127.0.0.1,9000,deadbeef");
    }

    #[test]
    fn generated_auth_keys_are_fixed_length_hex() {
        let key = generate_auth_key();
        assert_eq!(key.len(), AUTH_KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
