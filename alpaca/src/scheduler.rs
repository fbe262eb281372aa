//! Cooperative tick scheduler
//!
//! One loop owns a min-heap of next-due instants. Each due device is
//! ticked under its lock and reports how long until it next needs
//! attention; the watchdog sweep rides in the same heap.

use crate::device::TEMPERATURE_LOG_INTERVAL;
use crate::registry::Registry;
use crate::watchdog::{self, WatchdogConfig};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Used when a tick asks for no delay
    pub default_delay: Duration,
    /// Floor for any requested delay
    pub min_delay: Duration,
    /// Bound on waiting for a device lock
    pub tick_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_millis(500),
            min_delay: Duration::from_micros(50),
            tick_timeout: Duration::from_millis(250),
        }
    }
}

/// Smallest fallback delay the scheduler accepts
pub const MIN_DEFAULT_DELAY: Duration = Duration::from_millis(1);

impl SchedulerConfig {
    /// Raise zero or inverted delays so every reschedule lands in the future.
    pub fn normalized(mut self) -> Self {
        self.min_delay = self.min_delay.max(Duration::from_micros(1));
        self.default_delay = self.default_delay.max(self.min_delay).max(MIN_DEFAULT_DELAY);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Due {
    Device(usize),
    Watchdog,
}

pub struct Scheduler {
    registry: Arc<Registry>,
    config: SchedulerConfig,
    watchdog: WatchdogConfig,
    queue: BinaryHeap<Reverse<(Instant, u64, Due)>>,
    seq: u64,
    admitted: usize,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, config: SchedulerConfig, mut watchdog: WatchdogConfig) -> Self {
        let config = config.normalized();
        watchdog.check_interval = watchdog.check_interval.max(config.default_delay);
        let mut scheduler = Self {
            registry,
            config,
            watchdog,
            queue: BinaryHeap::new(),
            seq: 0,
            admitted: 0,
        };
        if scheduler.watchdog.enabled {
            let first = Instant::now() + scheduler.watchdog.check_interval;
            scheduler.push(first, Due::Watchdog);
        }
        scheduler
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn push(&mut self, at: Instant, due: Due) {
        self.seq += 1;
        self.queue.push(Reverse((at, self.seq, due)));
    }

    /// Zero means "use the default"; anything else is floored.
    pub fn effective_delay(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.config.default_delay
        } else {
            requested.max(self.config.min_delay)
        }
    }

    /// Queue devices registered since the last call, due immediately.
    fn admit_new_devices(&mut self, now: Instant) {
        let count = self.registry.count();
        while self.admitted < count {
            let index = self.admitted;
            self.push(now, Due::Device(index));
            self.admitted += 1;
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse((at, _, _))| *at)
    }

    /// When the device at `index` is next due
    pub fn deadline_of(&self, index: usize) -> Option<Instant> {
        self.queue
            .iter()
            .filter_map(|Reverse((at, _, due))| (*due == Due::Device(index)).then_some(*at))
            .min()
    }

    /// Run everything due at or before `now`. Returns the number of device ticks.
    pub async fn poll_due(&mut self, now: Instant) -> usize {
        self.admit_new_devices(now);
        let mut ticked = 0;
        loop {
            match self.queue.peek() {
                Some(Reverse((at, _, _))) if *at <= now => {}
                _ => break,
            }
            let Some(Reverse((_, _, due))) = self.queue.pop() else {
                break;
            };
            match due {
                Due::Device(index) => {
                    let delay = self.tick_device(index, now).await;
                    self.push(now + delay, due);
                    ticked += 1;
                }
                Due::Watchdog => {
                    watchdog::sweep(&self.registry, now, self.watchdog.timeout, self.config.tick_timeout).await;
                    self.push(now + self.watchdog.check_interval, Due::Watchdog);
                }
            }
        }
        ticked
    }

    async fn tick_device(&self, index: usize, now: Instant) -> Duration {
        let Some(handle) = self.registry.get(index) else {
            return self.config.default_delay;
        };
        let delay = match tokio::time::timeout(self.config.tick_timeout, handle.lock()).await {
            Ok(mut record) => {
                let requested = record.driver.tick(now);
                if let Some(degrees_c) = record.driver.temperature() {
                    record.temperature_log.record(degrees_c, now, TEMPERATURE_LOG_INTERVAL);
                }
                self.effective_delay(requested)
            }
            Err(_) => {
                debug!(
                    device_type = handle.summary.device_type.as_str(),
                    device_number = handle.summary.device_number,
                    "Device busy, tick deferred"
                );
                self.config.default_delay
            }
        };
        delay
    }

    /// Tick until `shutdown` flips to true or its sender goes away.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            default_delay_ms = self.config.default_delay.as_millis() as u64,
            watchdog = self.watchdog.enabled,
            "Scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Instant::now();
            self.poll_due(now).await;

            // Cap the sleep so late registrations are picked up promptly.
            let cap = now + self.config.default_delay;
            let wake = self.next_deadline().map_or(cap, |at| at.min(cap));
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Scheduler shutdown channel closed");
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }
}
