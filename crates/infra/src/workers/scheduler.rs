use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use requeue_broker::Broker;
use requeue_engine::{Processor, Reprocessor, TickOutcome, TickReport};

use super::lock;

/// Handle to control and join the scheduler thread.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request graceful shutdown and wait for the scheduler to stop.
    ///
    /// A tick in progress runs to completion first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        lock(&self.stats).clone()
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    /// Ticks that found another tick of the same reprocessor running.
    pub overlapped: u64,
    pub failed: u64,
    /// Slots dropped because a tick outlasted the frequency.
    pub missed: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_report: Option<TickReport>,
}

/// Fixed-rate trigger for [`Reprocessor::run_tick`].
///
/// The first tick fires on start, then one per `frequency` slot. A tick that
/// outlasts its slot makes the scheduler skip the slots it covered instead of
/// firing them back to back.
#[derive(Debug)]
pub struct Scheduler;

impl Scheduler {
    pub fn spawn<B, P>(
        name: &'static str,
        reprocessor: Arc<Reprocessor<B, P>>,
        frequency: Duration,
    ) -> SchedulerHandle
    where
        B: Broker + 'static,
        P: Processor + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || scheduler_loop(name, &reprocessor, frequency, shutdown_rx, &stats_clone))
            .expect("failed to spawn scheduler thread");

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn scheduler_loop<B, P>(
    name: &'static str,
    reprocessor: &Reprocessor<B, P>,
    frequency: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: &Mutex<SchedulerStats>,
) where
    B: Broker,
    P: Processor,
{
    info!(
        scheduler = name,
        topic = reprocessor.topic(),
        frequency_ms = frequency.as_millis() as u64,
        "scheduler started"
    );
    let mut next = Instant::now();

    loop {
        let wait = next.saturating_duration_since(Instant::now());
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        let result = reprocessor.run_tick();

        {
            let mut s = lock(stats);
            s.ticks += 1;
            s.last_tick_at = Some(Utc::now());
            match result {
                Ok(TickOutcome::Completed(report)) => s.last_report = Some(report),
                Ok(TickOutcome::Overlapped) => s.overlapped += 1,
                Err(err) => {
                    s.failed += 1;
                    error!(scheduler = name, error = %err, "reprocessor tick failed");
                }
            }
        }

        let (following, missed) = next_slot(next + frequency, Instant::now(), frequency);
        next = following;
        if missed > 0 {
            let mut s = lock(stats);
            s.missed = s.missed.saturating_add(missed);
            drop(s);
            warn!(scheduler = name, missed, "tick outlasted its slot; skipping missed slots");
        }
    }

    info!(scheduler = name, "scheduler stopped");
}

/// Slot to wait for after a tick, and how many slots were passed over.
///
/// `due` is the slot that followed the tick's own. Slots at or before `now`
/// are dropped; the next one keeps the original phase.
fn next_slot(due: Instant, now: Instant, frequency: Duration) -> (Instant, u64) {
    if due > now || frequency.is_zero() {
        return (due, 0);
    }

    let late = now.duration_since(due).as_nanos();
    let period = frequency.as_nanos();
    let missed = u64::try_from(late / period)
        .unwrap_or(u64::MAX)
        .saturating_add(1);
    // Remainder is below `period`, which fits a Duration.
    let into_slot = Duration::from_nanos(u64::try_from(late % period).unwrap_or(u64::MAX));

    (now + frequency.saturating_sub(into_slot), missed)
}
