//! Timed test-scenario execution.
//!
//! A scenario is a set of steps, each due at an offset from scenario start.
//! The scheduler pops steps in deadline order and, between deadlines, waits on
//! the same multiplexer that watches the bus feeds, so timed actions and
//! I/O-driven callbacks interleave on one cooperative loop.
//!
//! When a watched handle becomes ready before the next deadline, the popped
//! step is put back unchanged (same deadline, same tie-break): handling the
//! event may enqueue new steps that deserve to run first if their deadlines
//! are earlier.

use std::cmp::Ordering as CmpOrdering;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::netbus::SubEndpoint;

/// A malformed or negative time specification.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimeSpecError {
    #[error("incorrect time specification {0:?}")]
    Malformed(String),
    #[error("time offset must be a non-negative number, got {0}")]
    Negative(f64),
}

/// A step offset: a number of seconds, or a clock-style string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSpec {
    seconds: f64,
}

impl TimeSpec {
    pub fn from_seconds(seconds: f64) -> Result<Self, TimeSpecError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(TimeSpecError::Negative(seconds));
        }
        Ok(Self { seconds })
    }

    pub fn as_secs_f64(self) -> f64 {
        self.seconds
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs_f64(self.seconds)
    }
}

/// Parse `HH:MM:SS[.ss]` or `MM:SS[.ss]` into seconds. Fields are two digits;
/// the seconds field may carry a decimal fraction.
///
/// `"00:30"` is 30 seconds, `"01:40"` is 100, `"00:00.5"` is half a second.
pub fn parse_timespec(spec: &str) -> Result<f64, TimeSpecError> {
    let malformed = || TimeSpecError::Malformed(spec.to_string());
    let fields: Vec<&str> = spec.split(':').collect();
    match fields.as_slice() {
        [hours, minutes, seconds] => Ok(two_digit_field(hours).ok_or_else(malformed)? * 3600.0
            + two_digit_field(minutes).ok_or_else(malformed)? * 60.0
            + seconds_field(seconds).ok_or_else(malformed)?),
        [minutes, seconds] => Ok(two_digit_field(minutes).ok_or_else(malformed)? * 60.0
            + seconds_field(seconds).ok_or_else(malformed)?),
        _ => Err(malformed()),
    }
}

fn two_digit_field(field: &str) -> Option<f64> {
    if field.len() == 2 && field.bytes().all(|b| b.is_ascii_digit()) {
        field.parse().ok()
    } else {
        None
    }
}

fn seconds_field(field: &str) -> Option<f64> {
    let (whole, fraction) = match field.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (field, None),
    };
    if whole.len() != 2 || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(fraction) = fraction {
        if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    field.parse().ok()
}

impl TryFrom<f64> for TimeSpec {
    type Error = TimeSpecError;
    fn try_from(seconds: f64) -> Result<Self, Self::Error> {
        Self::from_seconds(seconds)
    }
}

impl TryFrom<u64> for TimeSpec {
    type Error = TimeSpecError;
    fn try_from(seconds: u64) -> Result<Self, Self::Error> {
        Self::from_seconds(seconds as f64)
    }
}

impl TryFrom<Duration> for TimeSpec {
    type Error = TimeSpecError;
    fn try_from(duration: Duration) -> Result<Self, Self::Error> {
        Self::from_seconds(duration.as_secs_f64())
    }
}

impl TryFrom<&str> for TimeSpec {
    type Error = TimeSpecError;
    fn try_from(spec: &str) -> Result<Self, Self::Error> {
        Self::from_seconds(parse_timespec(spec)?)
    }
}

/// Token identifying an enqueued step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepHandle(u64);

impl StepHandle {
    /// The step's insertion sequence number.
    pub fn seq(self) -> u64 {
        self.0
    }
}

/// Token identifying a watched I/O source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

/// Optional step metadata: an explicit tie-break priority and the
/// display/question information forwarded to the observability sink.
#[derive(Debug, Clone)]
pub struct StepOptions {
    pub priority: Option<u32>,
    pub label: Option<String>,
    pub show: bool,
    pub question: Option<String>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self { priority: None, label: None, show: true, question: None }
    }
}

#[derive(Debug, Clone)]
struct StepMeta {
    label: String,
    show: bool,
    question: Option<String>,
}

/// What the observability sink is told when a step runs.
#[derive(Debug)]
pub struct StepNotice<'a> {
    pub label: &'a str,
    pub show: bool,
    pub question: Option<&'a str>,
    pub deadline: Duration,
}

/// External observability sink boundary. The harness only reports; storage
/// and presentation live outside.
pub trait StepObserver {
    fn step_executed(&mut self, notice: &StepNotice<'_>);
}

type StepAction = Box<dyn FnMut(&mut ScenarioScheduler)>;

struct QueueEntry {
    deadline: Duration,
    tie: u64,
    seq: u64,
    action: StepAction,
    meta: StepMeta,
}

impl QueueEntry {
    fn key(&self) -> (Duration, u64, u64) {
        (self.deadline, self.tie, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

/// A handle the scheduler can wait on alongside its deadlines.
pub enum WatchedSource {
    /// A bus channel feed.
    Feed(SubEndpoint),
    /// A raw stream socket.
    Tcp(TcpStream),
}

impl WatchedSource {
    async fn ready(&mut self) {
        match self {
            WatchedSource::Feed(feed) => feed.ready().await,
            WatchedSource::Tcp(stream) => {
                // Level-triggered; the callback is expected to read.
                let _ = stream.readable().await;
            }
        }
    }

    pub fn as_feed_mut(&mut self) -> Option<&mut SubEndpoint> {
        match self {
            WatchedSource::Feed(feed) => Some(feed),
            WatchedSource::Tcp(_) => None,
        }
    }

    pub fn as_tcp_mut(&mut self) -> Option<&mut TcpStream> {
        match self {
            WatchedSource::Tcp(stream) => Some(stream),
            WatchedSource::Feed(_) => None,
        }
    }
}

type SourceCallback = Rc<dyn Fn(&mut WatchedSource, &mut ScenarioScheduler)>;

struct SourceEntry {
    source: WatchedSource,
    callback: SourceCallback,
}

enum WaitOutcome {
    TimedOut,
    Ready(SourceId),
}

/// Deadline-ordered step executor sharing one multiplexer with its watched
/// I/O sources. Owns its queue and sources exclusively.
pub struct ScenarioScheduler {
    queue: BinaryHeap<Reverse<QueueEntry>>,
    start: Option<Instant>,
    running: bool,
    next_seq: u64,
    next_source: u64,
    sources: HashMap<SourceId, SourceEntry>,
    detached: HashSet<SourceId>,
    observer: Option<Box<dyn StepObserver>>,
}

impl Default for ScenarioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenarioScheduler {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            start: None,
            running: false,
            next_seq: 0,
            next_source: 0,
            sources: HashMap::new(),
            detached: HashSet::new(),
            observer: None,
        }
    }

    /// Install the observability sink notified on every executed step.
    pub fn set_observer(&mut self, observer: Box<dyn StepObserver>) {
        self.observer = Some(observer);
    }

    /// Add a step due `when` after scenario start. If the scenario is already
    /// running, `when` counts from now instead, so steps scheduled from inside
    /// a running step are relative to the moment they were added.
    pub fn add_step<W>(
        &mut self,
        when: W,
        action: impl FnMut(&mut ScenarioScheduler) + 'static,
    ) -> Result<StepHandle, TimeSpecError>
    where
        W: TryInto<TimeSpec, Error = TimeSpecError>,
    {
        self.add_step_with(when, action, StepOptions::default())
    }

    pub fn add_step_with<W>(
        &mut self,
        when: W,
        action: impl FnMut(&mut ScenarioScheduler) + 'static,
        options: StepOptions,
    ) -> Result<StepHandle, TimeSpecError>
    where
        W: TryInto<TimeSpec, Error = TimeSpecError>,
    {
        let spec: TimeSpec = when.try_into()?;
        let mut deadline = spec.as_duration();
        if let Some(start) = self.start {
            deadline += start.elapsed();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let meta = StepMeta {
            label: options.label.unwrap_or_else(|| format!("step-{seq}")),
            show: options.show,
            question: options.question,
        };
        debug!(step = %meta.label, deadline_s = deadline.as_secs_f64(), "step added");
        self.queue.push(Reverse(QueueEntry {
            deadline,
            tie: options.priority.map_or(seq, u64::from),
            seq,
            action: Box::new(action),
            meta,
        }));
        Ok(StepHandle(seq))
    }

    pub fn pending_steps(&self) -> usize {
        self.queue.len()
    }

    /// Watch `source`; whenever it becomes ready while the scenario waits,
    /// `callback` is invoked with the source and the scheduler.
    pub fn add_socket(
        &mut self,
        source: WatchedSource,
        callback: impl Fn(&mut WatchedSource, &mut ScenarioScheduler) + 'static,
    ) -> SourceId {
        let id = SourceId(self.next_source);
        self.next_source += 1;
        info!(source = id.0, "watching source");
        self.sources.insert(id, SourceEntry { source, callback: Rc::new(callback) });
        id
    }

    /// Stop watching a source, returning it to the caller. Returns `None` if
    /// the source is currently dispatched (it is dropped after its callback
    /// returns) or unknown.
    pub fn remove_socket(&mut self, id: SourceId) -> Option<WatchedSource> {
        match self.sources.remove(&id) {
            Some(entry) => {
                info!(source = id.0, "source removed");
                Some(entry.source)
            }
            None => {
                self.detached.insert(id);
                None
            }
        }
    }

    /// Run the scenario: execute queued steps in deadline order, dispatching
    /// watched-source callbacks whenever one becomes ready before the next
    /// deadline. Returns when the queue empties or [`stop`](Self::stop) is
    /// called; an in-flight step always finishes.
    pub async fn play(&mut self) {
        self.running = true;
        let start = Instant::now();
        self.start = Some(start);
        info!("starting scenario");
        while self.running {
            let Some(Reverse(entry)) = self.queue.pop() else {
                break;
            };
            let now = start.elapsed();
            if now >= entry.deadline {
                self.execute_step(entry);
                continue;
            }
            match self.wait_sources(entry.deadline - now).await {
                WaitOutcome::TimedOut => self.execute_step(entry),
                WaitOutcome::Ready(source) => {
                    if start.elapsed() >= entry.deadline {
                        // The deadline arrived while the wait completed; the
                        // source stays ready and is picked up next iteration.
                        self.execute_step(entry);
                    } else {
                        self.queue.push(Reverse(entry));
                        self.dispatch_source(source);
                    }
                }
            }
        }
        self.start = None;
        info!("scenario finished");
    }

    /// Request a stop. The flag is consulted at the top of each iteration, so
    /// the current step or callback completes first. A stopped scenario keeps
    /// its remaining queue; a new `play` resumes from it.
    pub fn stop(&mut self) {
        info!("scenario stop requested");
        self.running = false;
    }

    fn execute_step(&mut self, entry: QueueEntry) {
        let QueueEntry { deadline, mut action, meta, .. } = entry;
        info!(step = %meta.label, deadline_s = deadline.as_secs_f64(), "executing step");
        action(self);
        if let Some(observer) = self.observer.as_mut() {
            observer.step_executed(&StepNotice {
                label: &meta.label,
                show: meta.show,
                question: meta.question.as_deref(),
                deadline,
            });
        }
    }

    async fn wait_sources(&mut self, wait: Duration) -> WaitOutcome {
        if self.sources.is_empty() {
            tokio::time::sleep(wait).await;
            return WaitOutcome::TimedOut;
        }
        let readiness: Vec<_> = self
            .sources
            .iter_mut()
            .map(|(id, entry)| {
                let id = *id;
                let source = &mut entry.source;
                Box::pin(async move {
                    source.ready().await;
                    id
                })
            })
            .collect();
        match tokio::time::timeout(wait, futures::future::select_all(readiness)).await {
            Ok((id, _, _)) => WaitOutcome::Ready(id),
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    fn dispatch_source(&mut self, id: SourceId) {
        // The entry is detached for the duration of the callback so the
        // callback may mutate the watch list (including removing itself).
        let Some(mut entry) = self.sources.remove(&id) else {
            return;
        };
        let callback = Rc::clone(&entry.callback);
        callback(&mut entry.source, self);
        if self.detached.remove(&id) {
            debug!(source = id.0, "source dropped during dispatch");
        } else {
            self.sources.insert(id, entry);
        }
    }
}
