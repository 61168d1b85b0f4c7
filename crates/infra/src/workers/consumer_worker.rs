use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use requeue_broker::Broker;
use requeue_engine::{Destination, FlowOutcome, MainFlow, Processor};

use super::lock;

/// Handle to control and join the primary-topic consumer.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A record already polled is finished before the thread exits.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub polls: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &FlowOutcome) {
        match outcome {
            FlowOutcome::Succeeded => self.succeeded += 1,
            FlowOutcome::Routed(d) => match d.destination {
                Destination::RetryTopic => self.retried += 1,
                Destination::DlqTopic => self.dead_lettered += 1,
            },
        }
    }
}

/// Main-flow consumer loop.
///
/// Each iteration polls the primary topic once (bounded by the configured poll
/// timeout) so shutdown is noticed within one poll.
#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Spawn the consumer thread.
    ///
    /// - `error_pause`: back-off after a broker error before polling again
    pub fn spawn<B, P>(
        name: &'static str,
        flow: Arc<MainFlow<B, P>>,
        error_pause: Duration,
    ) -> WorkerHandle
    where
        B: Broker + 'static,
        P: Processor + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, &flow, error_pause, shutdown_rx, &stats_clone))
            .expect("failed to spawn consumer worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn worker_loop<B, P>(
    name: &'static str,
    flow: &MainFlow<B, P>,
    error_pause: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<WorkerStats>,
) where
    B: Broker,
    P: Processor,
{
    info!(worker = name, topic = flow.topic(), "consumer worker started");
    let started = Instant::now();

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        let result = flow.consume_next();

        let mut s = lock(stats);
        s.polls += 1;
        s.uptime_secs = started.elapsed().as_secs();
        match result {
            Ok(Some(outcome)) => s.record(&outcome),
            Ok(None) => {}
            Err(err) => {
                s.errors += 1;
                drop(s);
                error!(worker = name, error = %err, "main flow step failed");
                // Wakes early on shutdown.
                match shutdown_rx.recv_timeout(error_pause) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }

    info!(worker = name, "consumer worker stopped");
}
