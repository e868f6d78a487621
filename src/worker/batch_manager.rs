//! Batch compute-worker manager (spec §4.7, §4.8): workers run as jobs
//! submitted to an external scheduler (PBS/SLURM) or cloud batch service
//! (AWS Batch, AWS ECS) rather than as local threads or subprocesses.
//! The driver still serves a [`NetworkDataChannel`] for them to dial
//! back into; this module is responsible only for getting the jobs
//! running and for noticing when they finish or fail.

use super::compute::{ComputeWorkerManager, ComputeWorkerOutcome, ExceptionQueue};
use crate::error::RiosError;
use crate::network::channel::NetworkDataChannel;
use crate::timers::TimerMap;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Log markers a generated job script writes around the worker's
/// stdout, so the job's log file can be scraped for worker lifetime
/// without parsing scheduler-specific formats.
pub const BEGIN_WORKER_MARKER: &str = "Begin-rios-worker";
pub const END_WORKER_MARKER: &str = "End-rios-worker";

/// Which external scheduler a batch job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Pbs,
    Slurm,
    AwsBatch,
    AwsEcs,
}

/// One submitted batch job and the id the scheduler gave it.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job_id: String,
}

/// Render the job script body a worker runs under, wrapped in the begin/end
/// log markers and the scheduler's directive block.
pub fn render_job_script(kind: BatchKind, job_name: &str, connect_addr: &str, worker_command: &[String]) -> String {
    let directives = match kind {
        BatchKind::Pbs => format!("#PBS -N {job_name}\n#PBS -j oe\n"),
        BatchKind::Slurm => format!("#SBATCH --job-name={job_name}\n#SBATCH --output={job_name}.log\n"),
        BatchKind::AwsBatch | BatchKind::AwsEcs => String::new(),
    };
    let command_line = worker_command.join(" ");
    format!(
        "#!/bin/sh\n{directives}echo {BEGIN_WORKER_MARKER}\nRIOS_WORKER_ADDRESS=\"{connect_addr}\" {command_line}\necho {END_WORKER_MARKER}\n"
    )
}

/// Parse the job id a scheduler's submit command printed to stdout.
/// PBS's `qsub` prints the id alone; SLURM's `sbatch` prints
/// `Submitted batch job <id>`.
pub fn parse_submit_output(kind: BatchKind, stdout: &str) -> Result<String, RiosError> {
    let trimmed = stdout.trim();
    match kind {
        BatchKind::Pbs => {
            if trimmed.is_empty() {
                Err(RiosError::BatchQueue("qsub produced no job id".into()))
            } else {
                Ok(trimmed.to_string())
            }
        }
        BatchKind::Slurm => trimmed
            .rsplit(' ')
            .next()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| RiosError::BatchQueue("sbatch output did not contain a job id".into())),
        BatchKind::AwsBatch | BatchKind::AwsEcs => Ok(trimmed.to_string()),
    }
}

/// Guess the maximum number of vCPUs available from a discovered
/// CloudFormation stack output, enforcing spec §4.8's
/// `numWorkers <= maxVCPUs / vCPUsPerJob` guard.
pub fn max_workers_for_vcpus(max_vcpus: u32, vcpus_per_job: u32) -> usize {
    if vcpus_per_job == 0 {
        0
    } else {
        (max_vcpus / vcpus_per_job) as usize
    }
}

/// Single-block compute mode (spec §4.8): one job per block regardless
/// of any configured worker count, restricted to the batch-kind
/// managers since it relies on a scheduler to run an unbounded number
/// of short-lived jobs concurrently; no start barrier is used.
pub fn single_block_job_count(block_count: usize) -> usize {
    block_count
}

/// Submits and polls batch jobs via an external scheduler CLI
/// (`qsub`/`sbatch`) or a cloud batch API command, and drives the
/// resulting workers through a [`NetworkDataChannel`].
pub struct BatchComputeManager {
    kind: BatchKind,
    channel: Arc<NetworkDataChannel>,
    job_name_prefix: String,
    submit_command: String,
    connect_addr: String,
    worker_command: Vec<String>,
    num_workers: usize,
    poll_interval: Duration,
    bind_host: String,
    bind_port: u16,
    rt: tokio::runtime::Runtime,
    serve_handle: Option<tokio::task::JoinHandle<Result<(), RiosError>>>,
    jobs: Vec<SubmittedJob>,
    exceptions: ExceptionQueue,
}

impl BatchComputeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: BatchKind,
        channel: Arc<NetworkDataChannel>,
        job_name_prefix: impl Into<String>,
        submit_command: impl Into<String>,
        worker_command: Vec<String>,
        num_workers: usize,
        bind_host: impl Into<String>,
        bind_port: u16,
        auth_key: String,
    ) -> Result<Self, RiosError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(RiosError::from)?;
        let bind_host = bind_host.into();
        let connect_addr = super::subprocess_manager::worker_connect_address(&bind_host, bind_port, &auth_key);
        Ok(Self {
            kind,
            channel,
            job_name_prefix: job_name_prefix.into(),
            submit_command: submit_command.into(),
            connect_addr,
            worker_command,
            num_workers,
            poll_interval: Duration::from_secs(60),
            bind_host,
            bind_port,
            rt,
            serve_handle: None,
            jobs: Vec::new(),
            exceptions: ExceptionQueue::new(),
        })
    }

    fn submit_one(&self, index: usize) -> Result<SubmittedJob, RiosError> {
        let job_name = format!("{}-{index}", self.job_name_prefix);
        let script = render_job_script(self.kind, &job_name, &self.connect_addr, &self.worker_command);

        let output = Command::new(&self.submit_command)
            .arg(&script)
            .output()
            .map_err(RiosError::from)?;
        if !output.status.success() {
            return Err(RiosError::BatchQueue(format!(
                "{} failed for job {job_name}: {}",
                self.submit_command,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = parse_submit_output(self.kind, &stdout)?;
        Ok(SubmittedJob { job_id })
    }

    /// Block, polling every `poll_interval`, until every submitted job
    /// has left the scheduler's queue (spec §4.8 `waitOnJobs`).
    fn wait_on_jobs(&self, still_queued: impl Fn(&str) -> Result<bool, RiosError>) -> Result<(), RiosError> {
        let deadline_check_every = self.poll_interval;
        loop {
            let mut any_queued = false;
            for job in &self.jobs {
                if still_queued(&job.job_id)? {
                    any_queued = true;
                }
            }
            if !any_queued {
                return Ok(());
            }
            std::thread::sleep(deadline_check_every);
        }
    }
}

impl ComputeWorkerManager for BatchComputeManager {
    fn start_workers(&mut self, barrier_timeout: Duration) -> Result<(), RiosError> {
        let bind_addr = format!("{}:{}", self.bind_host, self.bind_port);
        let channel = self.channel.clone();
        let handle = self.rt.spawn(async move { channel.serve(&bind_addr).await });
        self.serve_handle = Some(handle);

        for i in 0..self.num_workers {
            let job = self.submit_one(i)?;
            self.jobs.push(job);
        }

        let channel = self.channel.clone();
        self.rt.block_on(channel.wait_for_workers(barrier_timeout))
    }

    fn shutdown(&mut self) -> Result<ComputeWorkerOutcome, RiosError> {
        match self.kind {
            BatchKind::Pbs | BatchKind::Slurm => {
                let poll_command = match self.kind {
                    BatchKind::Pbs => "qstat",
                    BatchKind::Slurm => "squeue",
                    _ => unreachable!(),
                };
                self.wait_on_jobs(|job_id| {
                    let output = Command::new(poll_command).arg(job_id).output().map_err(RiosError::from)?;
                    Ok(output.status.success())
                })?;
            }
            BatchKind::AwsBatch | BatchKind::AwsEcs => {
                // Jobs run until they connect back and are driven to
                // completion by the channel itself, so wait on that
                // signal instead of polling a scheduler.
                let start = Instant::now();
                while !self.channel.is_force_exit() && start.elapsed() < Duration::from_secs(3600) {
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
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
