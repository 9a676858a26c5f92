use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{ProtocolCatalog, ProtocolDefinition};
use crate::config::{clamp_concurrency, EngineConfig};
use crate::connection::{ConnectionTest, DialogLimits};
use crate::types::{Outcome, RunStats, TargetDescriptor, TestResult};

/// Receives inbound data and finished results as a run progresses.
///
/// Both hooks are called from engine tasks and must not block.
pub trait ResultSink: Send + Sync {
    /// A clean inbound fragment (telnet negotiation already removed).
    fn on_data(&self, _target: &TargetDescriptor, _data: &[u8]) {}

    fn on_done(&self, _result: &TestResult) {}
}

/// Runs batches of connection tests under a concurrency bound.
pub struct Scheduler {
    catalog: Arc<ProtocolCatalog>,
    config: EngineConfig,
    sink: Option<Arc<dyn ResultSink>>,
}

impl Scheduler {
    pub fn new(catalog: Arc<ProtocolCatalog>, config: EngineConfig) -> Self {
        Self {
            catalog,
            config,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start probing `targets`. Results arrive on the returned [`ProbeRun`]
    /// in completion order.
    ///
    /// - At most `concurrency` (clamped to 1..=5000) tests are in flight.
    /// - `global_timeout` bounds the whole run; when it elapses every
    ///   unfinished test is reported as `ETIMEOUT`.
    /// - Unresolved targets are reported as `EDNS` without taking a slot.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, targets: Vec<TargetDescriptor>, concurrency: usize, global_timeout: Duration) -> ProbeRun {
        let mut pending: VecDeque<TargetDescriptor> = targets.into();
        if self.config.shuffle {
            pending.make_contiguous().shuffle(&mut rand::thread_rng());
        }

        let counters = Arc::new(RunCounters::default());
        counters.submitted.store(pending.len() as u64, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let concurrency = clamp_concurrency(concurrency);

        let driver = Driver {
            catalog: Arc::clone(&self.catalog),
            config: self.config.clone(),
            limits: DialogLimits::from_config(&self.config),
            sink: self.sink.clone(),
            cancel: cancel.clone(),
            counters: Arc::clone(&counters),
            tx,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            run_deadline: Instant::now() + global_timeout,
        };
        info!(targets = pending.len(), concurrency, timeout_ms = global_timeout.as_millis() as u64, "probe run started");
        tokio::spawn(driver.drive(pending));

        ProbeRun { rx, cancel, counters }
    }
}

/// A live probe run: a finite, single-use stream of results.
///
/// Dropping the run cancels it.
pub struct ProbeRun {
    rx: mpsc::UnboundedReceiver<TestResult>,
    cancel: CancellationToken,
    counters: Arc<RunCounters>,
}

impl ProbeRun {
    /// Stop admitting tests and report everything unfinished as `ETIMEOUT`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> RunStats {
        self.counters.snapshot()
    }

    /// Wait for every result.
    pub async fn collect_all(mut self) -> Vec<TestResult> {
        let mut out = Vec::new();
        while let Some(r) = self.next().await {
            out.push(r);
        }
        out
    }
}

impl Stream for ProbeRun {
    type Item = TestResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TestResult>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ProbeRun {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Default)]
struct RunCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    by_protocol: Mutex<BTreeMap<String, u64>>,
    by_outcome: Mutex<BTreeMap<Outcome, u64>>,
}

impl RunCounters {
    fn snapshot(&self) -> RunStats {
        RunStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            by_protocol: self.by_protocol.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            by_outcome: self.by_outcome.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }
}

/// Owns the pending queue and the in-flight set. The only writer of the
/// run counters.
struct Driver {
    catalog: Arc<ProtocolCatalog>,
    config: EngineConfig,
    limits: DialogLimits,
    sink: Option<Arc<dyn ResultSink>>,
    cancel: CancellationToken,
    counters: Arc<RunCounters>,
    tx: mpsc::UnboundedSender<TestResult>,
    semaphore: Arc<Semaphore>,
    run_deadline: Instant,
}

type Finished = (TestResult, OwnedSemaphorePermit);

/// Target and port of each spawned test, so a task that dies without a
/// result is still reported.
type InFlight = HashMap<task::Id, (TargetDescriptor, u16)>;

impl Driver {
    async fn drive(self, mut pending: VecDeque<TargetDescriptor>) {
        let mut set: JoinSet<Finished> = JoinSet::new();
        let mut in_flight = InFlight::new();

        loop {
            while pending.front().is_some_and(|t| t.ip.is_none()) {
                if let Some(target) = pending.pop_front() {
                    let port = self.port_for(&target);
                    self.emit(TestResult::unstarted(&target, port, Outcome::Dns));
                }
            }
            if pending.is_empty() && set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = time::sleep_until(self.run_deadline) => {
                    warn!(in_flight = set.len(), pending = pending.len(), "run deadline reached");
                    self.cancel.cancel();
                    break;
                }
                Some(joined) = set.join_next_with_id(), if !set.is_empty() => self.finish(&mut in_flight, joined),
                permit = Arc::clone(&self.semaphore).acquire_owned(), if !pending.is_empty() => {
                    let Ok(permit) = permit else { break };
                    if let Some(target) = pending.pop_front() {
                        self.admit(&mut set, &mut in_flight, target, permit);
                    }
                }
            }
        }

        // in-flight tests see the token and finish with what they have
        while let Some(joined) = set.join_next_with_id().await {
            self.finish(&mut in_flight, joined);
        }
        for target in pending.drain(..) {
            let port = self.port_for(&target);
            let outcome = if target.ip.is_none() { Outcome::Dns } else { Outcome::Timeout };
            self.emit(TestResult::unstarted(&target, port, outcome));
        }

        let stats = self.counters.snapshot();
        info!(
            completed = stats.completed,
            max_in_flight = stats.max_in_flight,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            "probe run finished"
        );
    }

    fn admit(
        &self,
        set: &mut JoinSet<Finished>,
        in_flight: &mut InFlight,
        mut target: TargetDescriptor,
        permit: OwnedSemaphorePermit,
    ) {
        let protocol = self.protocol_for(&target);
        if target.source.is_none() {
            target.source = target.ip.and_then(|ip| self.config.source_for(ip));
        }
        let timeout = target
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_test_timeout());
        let jitter = jitter_delay(self.config.jitter);
        let limits = self.limits;
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        let run_deadline = self.run_deadline;

        let now_in_flight = self.counters.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.max_in_flight.fetch_max(now_in_flight, Ordering::Relaxed);
        debug!(host = %target.display_name(), protocol = %protocol.name, in_flight = now_in_flight, "admitted");

        let record = (target.clone(), target.port.unwrap_or(protocol.port));
        let handle = set.spawn(async move {
            if !jitter.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let port = target.port.unwrap_or(protocol.port);
                        return (TestResult::unstarted(&target, port, Outcome::Timeout), permit);
                    }
                    _ = time::sleep(jitter) => {}
                }
            }
            let deadline = (Instant::now() + timeout).min(run_deadline);
            let test = ConnectionTest::new(target, protocol, limits, deadline).with_sink(sink);
            (test.run(cancel).await, permit)
        });
        in_flight.insert(handle.id(), record);
    }

    fn finish(&self, in_flight: &mut InFlight, joined: Result<(task::Id, Finished), task::JoinError>) {
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
        match joined {
            Ok((id, (result, permit))) => {
                in_flight.remove(&id);
                drop(permit);
                self.emit(result);
            }
            Err(e) => {
                warn!(error = %e, "connection test task failed");
                if let Some((target, port)) = in_flight.remove(&e.id()) {
                    self.emit(TestResult::unstarted(&target, port, Outcome::Io));
                }
            }
        }
    }

    fn emit(&self, result: TestResult) {
        let c = &self.counters;
        c.completed.fetch_add(1, Ordering::Relaxed);
        c.bytes_read.fetch_add(result.bytes_read, Ordering::Relaxed);
        c.bytes_written.fetch_add(result.bytes_written, Ordering::Relaxed);
        *c.by_protocol
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(result.protocol.clone())
            .or_insert(0) += 1;
        *c.by_outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(result.outcome)
            .or_insert(0) += 1;

        if let Some(sink) = &self.sink {
            sink.on_done(&result);
        }
        // the receiver may be gone; the run still winds down cleanly
        let _ = self.tx.send(result);
    }

    fn protocol_for(&self, target: &TargetDescriptor) -> Arc<ProtocolDefinition> {
        self.catalog
            .lookup(&target.protocol)
            .unwrap_or_else(|| Arc::new(ProtocolDefinition::connect_only(&target.protocol)))
    }

    fn port_for(&self, target: &TargetDescriptor) -> u16 {
        target
            .port
            .unwrap_or_else(|| self.catalog.default_port(&target.protocol))
    }
}

/// Random delay in `0..=max_ms` milliseconds.
fn jitter_delay(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
