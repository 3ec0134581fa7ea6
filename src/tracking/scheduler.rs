use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::core::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// End this user's job; the scheduler forgets it.
    Stop,
}

/// Work performed on every trigger of a user's job.
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn on_tick(&self, user_id: UserId) -> TickOutcome;
}

struct Job {
    generation: u64,
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

type JobMap = Arc<Mutex<HashMap<UserId, Job>>>;
type LockMap = Arc<Mutex<HashMap<UserId, Arc<Mutex<()>>>>>;

/// One recurring job per tracked user.
///
/// Jobs for different users run independently. Ticks of the same user are
/// serialised through a per-user lock that outlives job replacement, so a
/// re-enabled job never runs alongside a tick of the job it replaced.
/// Cancelling a job stops its future triggers; a tick already running is
/// allowed to finish. A user's lock is dropped once no job holds it.
pub struct TrackingScheduler {
    handler: Arc<dyn TickHandler>,
    period: Duration,
    jobs: JobMap,
    tick_locks: LockMap,
    next_generation: AtomicU64,
}

impl TrackingScheduler {
    pub fn new(handler: Arc<dyn TickHandler>, period: Duration) -> Self {
        Self {
            handler,
            period,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            tick_locks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the user's job, replacing any existing one. The first tick
    /// fires one period from now.
    pub async fn enable(&self, user_id: UserId) {
        let tick_lock = self.tick_lock(user_id).await;
        let mut jobs = self.jobs.lock().await;

        if let Some(previous) = jobs.remove(&user_id) {
            let _ = previous.cancel.send(());
            tracing::debug!(
                "Replacing tracking job #{} for user {}",
                previous.generation,
                user_id
            );
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(run_job(
            user_id,
            generation,
            self.period,
            self.handler.clone(),
            tick_lock,
            cancel_rx,
            self.jobs.clone(),
            self.tick_locks.clone(),
        ));

        jobs.insert(
            user_id,
            Job {
                generation,
                cancel: cancel_tx,
                handle,
            },
        );
        tracing::info!(
            "▶️ Tracking job #{} scheduled for user {} every {:?}",
            generation,
            user_id,
            self.period
        );
    }

    /// Cancel the user's job. Returns whether one was running.
    pub async fn disable(&self, user_id: UserId) -> bool {
        match self.jobs.lock().await.remove(&user_id) {
            Some(job) => {
                let _ = job.cancel.send(());
                tracing::info!("⏹️ Tracking job #{} cancelled for user {}", job.generation, user_id);
                true
            }
            None => false,
        }
    }

    pub async fn is_enabled(&self, user_id: UserId) -> bool {
        self.jobs.lock().await.contains_key(&user_id)
    }

    pub async fn active_jobs(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Cancel every job and wait for in-flight ticks to finish.
    pub async fn shutdown(&self) {
        let jobs: Vec<(UserId, Job)> = self.jobs.lock().await.drain().collect();
        tracing::info!("🛑 Stopping {} tracking job(s)", jobs.len());

        let handles: Vec<JoinHandle<()>> = jobs
            .into_iter()
            .map(|(_, job)| {
                let _ = job.cancel.send(());
                job.handle
            })
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                tracing::error!("Tracking job ended abnormally: {}", e);
            }
        }
    }

    async fn tick_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.tick_locks
            .lock()
            .await
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    async fn tick_lock_count(&self) -> usize {
        self.tick_locks.lock().await.len()
    }
}

async fn run_job(
    user_id: UserId,
    generation: u64,
    period: Duration,
    handler: Arc<dyn TickHandler>,
    tick_lock: Arc<Mutex<()>>,
    mut cancel: oneshot::Receiver<()>,
    jobs: JobMap,
    tick_locks: LockMap,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    // A tick that overruns swallows the triggers it covered.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let stopped_itself = loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break false,
            _ = ticker.tick() => {}
        }

        let _guard = tick_lock.lock().await;
        // Cancellation may have arrived while waiting for the lock.
        if !matches!(cancel.try_recv(), Err(TryRecvError::Empty)) {
            break false;
        }

        tracing::debug!("⏱️ Tick for user {} (job #{})", user_id, generation);
        if handler.on_tick(user_id).await == TickOutcome::Stop {
            break true;
        }
    };

    drop(tick_lock);
    {
        let mut locks = tick_locks.lock().await;
        // Only the map itself still holds it: no job of this user is alive.
        if locks.get(&user_id).map_or(false, |lock| Arc::strong_count(lock) == 1) {
            locks.remove(&user_id);
        }
    }

    if stopped_itself {
        let mut jobs = jobs.lock().await;
        if jobs.get(&user_id).map(|job| job.generation) == Some(generation) {
            jobs.remove(&user_id);
            tracing::info!("⏹️ Tracking job #{} for user {} stopped itself", generation, user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    const PERIOD: Duration = Duration::from_secs(60);

    #[derive(Default)]
    struct RecordingHandler {
        work: Duration,
        stop_for: HashSet<UserId>,
        ticks: StdMutex<HashMap<UserId, usize>>,
        running: StdMutex<HashMap<UserId, usize>>,
        max_running_per_user: AtomicUsize,
        running_total: AtomicUsize,
        max_running_total: AtomicUsize,
    }

    impl RecordingHandler {
        fn with_work(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                work,
                ..Default::default()
            })
        }

        fn ticks(&self, user_id: UserId) -> usize {
            self.ticks.lock().unwrap().get(&user_id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl TickHandler for RecordingHandler {
        async fn on_tick(&self, user_id: UserId) -> TickOutcome {
            *self.ticks.lock().unwrap().entry(user_id).or_default() += 1;
            {
                let mut running = self.running.lock().unwrap();
                let slot = running.entry(user_id).or_default();
                *slot += 1;
                self.max_running_per_user.fetch_max(*slot, Ordering::SeqCst);
            }
            let total = self.running_total.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running_total.fetch_max(total, Ordering::SeqCst);

            time::sleep(self.work).await;

            self.running_total.fetch_sub(1, Ordering::SeqCst);
            *self.running.lock().unwrap().entry(user_id).or_default() -= 1;

            if self.stop_for.contains(&user_id) {
                TickOutcome::Stop
            } else {
                TickOutcome::Continue
            }
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_fire_every_period() {
        let handler = RecordingHandler::with_work(Duration::ZERO);
        let scheduler = TrackingScheduler::new(handler.clone(), PERIOD);

        scheduler.enable(1).await;
        time::sleep(secs(59)).await;
        assert_eq!(handler.ticks(1), 0);

        time::sleep(secs(2 * 60 + 2)).await;
        assert_eq!(handler.ticks(1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_twice_replaces_job() {
        let handler = RecordingHandler::with_work(Duration::ZERO);
        let scheduler = TrackingScheduler::new(handler.clone(), PERIOD);

        scheduler.enable(1).await;
        time::sleep(secs(30)).await;
        scheduler.enable(1).await;
        assert_eq!(scheduler.active_jobs().await, 1);

        // The first job would have fired at t=60.
        time::sleep(secs(31)).await;
        assert_eq!(handler.ticks(1), 0);

        // The replacement fires at t=90.
        time::sleep(secs(30)).await;
        assert_eq!(handler.ticks(1), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_never_overlaps_itself() {
        let handler = RecordingHandler::with_work(secs(150));
        let scheduler = TrackingScheduler::new(handler.clone(), PERIOD);

        scheduler.enable(1).await;
        time::sleep(secs(400)).await;

        assert!(handler.ticks(1) >= 2);
        assert_eq!(handler.max_running_per_user.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_waits_for_in_flight_tick() {
        let handler = RecordingHandler::with_work(secs(150));
        let scheduler = TrackingScheduler::new(handler.clone(), PERIOD);

        scheduler.enable(1).await;
        time::sleep(secs(61)).await;
        assert_eq!(handler.ticks(1), 1);

        // New job triggers at t=121 while the old tick runs until t=210.
        scheduler.enable(1).await;
        time::sleep(secs(300)).await;

        assert!(handler.ticks(1) >= 2);
        assert_eq!(handler.max_running_per_user.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_tick_concurrently() {
        let handler = RecordingHandler::with_work(secs(30));
        let scheduler = TrackingScheduler::new(handler.clone(), PERIOD);

        scheduler.enable(1).await;
        scheduler.enable(2).await;
        time::sleep(secs(75)).await;

        assert_eq!(handler.ticks(1), 1);
        assert_eq!(handler.ticks(2), 1);
        assert_eq!(handler.max_running_total.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_stops_future_ticks() {
        let handler = RecordingHandler::with_work(Duration::ZERO);
        let scheduler = TrackingScheduler::new(handler.clone(), PERIOD);

        scheduler.enable(1).await;
        time::sleep(secs(61)).await;
        assert!(scheduler.disable(1).await);
        assert!(!scheduler.is_enabled(1).await);

        time::sleep(secs(600)).await;
        assert_eq!(handler.ticks(1), 1);
        assert!(!scheduler.disable(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_outcome_removes_job() {
        let handler = Arc::new(RecordingHandler {
            stop_for: HashSet::from([7]),
            ..Default::default()
        });
        let scheduler = TrackingScheduler::new(handler.clone(), PERIOD);

        scheduler.enable(7).await;
        scheduler.enable(8).await;
        time::sleep(secs(61)).await;

        assert!(!scheduler.is_enabled(7).await);
        assert!(scheduler.is_enabled(8).await);

        time::sleep(secs(300)).await;
        assert_eq!(handler.ticks(7), 1);
        assert!(handler.ticks(8) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_locks_released_with_last_job() {
        let handler = Arc::new(RecordingHandler {
            stop_for: HashSet::from([3]),
            ..Default::default()
        });
        let scheduler = TrackingScheduler::new(handler.clone(), PERIOD);

        for user in 1..=3 {
            scheduler.enable(user).await;
        }
        scheduler.enable(1).await;
        assert_eq!(scheduler.tick_lock_count().await, 3);

        scheduler.disable(2).await;
        time::sleep(secs(61)).await;

        // User 2 was disabled and user 3 stopped itself; user 1 is still live.
        assert_eq!(scheduler.tick_lock_count().await, 1);
        assert!(scheduler.is_enabled(1).await);

        scheduler.enable(2).await;
        assert_eq!(scheduler.tick_lock_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let handler = RecordingHandler::with_work(Duration::ZERO);
        let scheduler = TrackingScheduler::new(handler.clone(), PERIOD);

        for user in 1..=3 {
            scheduler.enable(user).await;
        }
        scheduler.shutdown().await;
        assert_eq!(scheduler.active_jobs().await, 0);

        time::sleep(secs(300)).await;
        assert_eq!((1..=3).map(|user| handler.ticks(user)).sum::<usize>(), 0);
    }
}
