//! Single-radio task scheduler.
//!
//! Every radio activity is a [`Task`]: one per connection, plus the advertiser, scanner,
//! initiator and periodic roles. Tasks live in a fixed pool and the scheduler picks one at a time
//! to bind to the radio.
//!
//! Connection events are fixed in time (their anchor points) and always take precedence. The
//! other roles (*secondary* tasks) are fitted into the gaps between connection events. When
//! several secondary tasks are due in the same gap, a [`SecondaryPolicy`] decides.
//!
//! Every radio operation is surrounded by guard bands (`Params::pre_guard`/`post_guard`), and no
//! two guarded windows ever overlap.
//!
//! The scheduler only touches task timing: anchors, intervals and missed-event counters. Whatever
//! happens inside an event is up to the `LinkLayer`, which dispatches on [`TaskKind`].
//!
//! [`Task`]: struct.Task.html
//! [`SecondaryPolicy`]: trait.SecondaryPolicy.html
//! [`TaskKind`]: enum.TaskKind.html

use {
    super::{connection::TimingChange, pool::Pool, ConnHandle, MAX_CONNECTIONS},
    crate::{
        config::Params,
        time::{Duration, Instant},
        Error,
    },
};

/// Number of task blocks: one per connection, advertiser, scanner or initiator, and the periodic
/// role.
pub const TASK_POOL_SIZE: usize = MAX_CONNECTIONS + 3;

/// The kind of radio activity a task performs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Connection(ConnHandle),
    Advertiser,
    Scanner,
    Initiator,
    PeriodicAdvertiser,
    PeriodicScanner,
}

impl TaskKind {
    pub fn is_connection(&self) -> bool {
        matches!(self, TaskKind::Connection(_))
    }

    /// Kinds whose occurrences are tied to fixed anchor points. An occurrence that can't start on
    /// time is skipped rather than delayed.
    pub fn is_anchored(&self) -> bool {
        matches!(
            self,
            TaskKind::Connection(_) | TaskKind::PeriodicAdvertiser | TaskKind::PeriodicScanner
        )
    }

    /// Receive-only roles whose window may be shortened to fit a gap.
    fn is_truncatable(&self) -> bool {
        matches!(
            self,
            TaskKind::Scanner | TaskKind::Initiator | TaskKind::PeriodicScanner
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    Inactive,
    Active,
}

/// A schedulable radio activity.
#[derive(Debug, Clone)]
pub struct Task {
    pub kind: TaskKind,
    pub state: TaskState,
    /// Start of the next occurrence (the anchor point, for connections).
    pub anchor: Instant,
    pub interval: Duration,
    /// Radio time needed by one occurrence.
    pub duration: Duration,
    /// Extra listening time on both sides of the anchor (slave receive window widening).
    pub widening: Duration,
    /// Start of the last programmed occurrence.
    pub last_start: Option<Instant>,
    /// Consecutive connection events without a valid packet from the peer.
    pub missed: u32,
}

impl Task {
    pub fn new(kind: TaskKind, anchor: Instant, interval: Duration, duration: Duration) -> Self {
        Self {
            kind,
            state: TaskState::Active,
            anchor,
            interval,
            duration,
            widening: Duration::from_micros(0),
            last_start: None,
            missed: 0,
        }
    }

    /// Start of the radio window of the next occurrence.
    pub fn window_start(&self) -> Instant {
        self.anchor - self.widening
    }

    /// Length of the radio window of the next occurrence.
    pub fn window_len(&self) -> Duration {
        self.duration + self.widening * 2
    }
}

/// Decides which secondary task runs when several are due in the same gap.
pub trait SecondaryPolicy {
    /// Returns the priority of `kind`. Lower values are served first.
    ///
    /// Only called for secondary (non-connection) kinds.
    fn rank(&self, kind: TaskKind) -> u8;
}

/// A fixed ranking of the secondary roles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PriorityTable {
    pub initiator: u8,
    pub advertiser: u8,
    pub periodic_advertiser: u8,
    pub periodic_scanner: u8,
    pub scanner: u8,
}

impl Default for PriorityTable {
    /// Initiator, advertiser, periodic advertiser, periodic scanner, scanner.
    fn default() -> Self {
        Self {
            initiator: 0,
            advertiser: 1,
            periodic_advertiser: 2,
            periodic_scanner: 3,
            scanner: 4,
        }
    }
}

impl SecondaryPolicy for PriorityTable {
    fn rank(&self, kind: TaskKind) -> u8 {
        match kind {
            TaskKind::Initiator => self.initiator,
            TaskKind::Advertiser => self.advertiser,
            TaskKind::PeriodicAdvertiser => self.periodic_advertiser,
            TaskKind::PeriodicScanner => self.periodic_scanner,
            TaskKind::Scanner => self.scanner,
            TaskKind::Connection(_) => 0,
        }
    }
}

/// The task chosen to run next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Selection {
    pub task: usize,
    pub kind: TaskKind,
    /// When the radio has to start.
    pub start: Instant,
    /// How long the radio may stay busy.
    pub duration: Duration,
}

pub struct Scheduler<P: SecondaryPolicy> {
    tasks: Pool<Task, TASK_POOL_SIZE>,
    policy: P,
    slot_unit: Duration,
    pre_guard: Duration,
    post_guard: Duration,
    /// Task bound to the radio.
    current: Option<usize>,
    /// The radio (plus its post guard) is reserved until this point.
    busy_until: Option<Instant>,
    /// `busy_until` before the current task was bound.
    busy_before: Option<Instant>,
    /// Start of an uninterrupted series of programming failures.
    failing_since: Option<Instant>,
}

impl<P: SecondaryPolicy> Scheduler<P> {
    pub fn new(policy: P, params: &Params) -> Self {
        Self {
            tasks: Pool::new(),
            policy,
            slot_unit: params.slot_unit,
            pre_guard: params.pre_guard,
            post_guard: params.post_guard,
            current: None,
            busy_until: None,
            busy_before: None,
            failing_since: None,
        }
    }

    /// Radio time reserved for one connection event, including guards.
    pub fn slot(&self) -> Duration {
        self.slot_unit + self.pre_guard + self.post_guard
    }

    /// Allocates a task block. Fails with `ResourceExhausted` when the pool is full.
    pub fn alloc(&mut self, task: Task) -> Result<usize, Error> {
        let kind = task.kind;
        let index = self.tasks.alloc(task).map_err(|_| Error::ResourceExhausted)?;
        trace!("task {} allocated for {:?}", index, kind);
        Ok(index)
    }

    /// Releases a task block.
    pub fn free(&mut self, index: usize) -> Option<Task> {
        if self.current == Some(index) {
            self.current = None;
        }
        self.tasks.free(index)
    }

    pub fn task(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn task_mut(&mut self, index: usize) -> Option<&mut Task> {
        self.tasks.get_mut(index)
    }

    /// Returns the index of the task of kind `kind`.
    pub fn find(&self, kind: TaskKind) -> Option<usize> {
        self.tasks
            .iter()
            .find(|(_, t)| t.kind == kind)
            .map(|(i, _)| i)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (usize, &Task)> + '_ {
        self.tasks.iter()
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    fn connection_count(&self) -> usize {
        self.tasks.iter().filter(|(_, t)| t.kind.is_connection()).count()
    }

    /// Checks whether one more connection with `interval` (1.25 ms units) can be serviced.
    ///
    /// Every connection needs one slot per interval, so `n` connections need `n` slots within the
    /// shortest interval among them.
    pub fn admit_connection(&self, interval: u16) -> Result<(), Error> {
        let shortest = self
            .tasks
            .iter()
            .filter(|(_, t)| t.kind.is_connection())
            .map(|(_, t)| t.interval)
            .fold(Duration::from_conn_units(interval), |a, b| {
                if b.as_micros() < a.as_micros() {
                    b
                } else {
                    a
                }
            });
        let needed = self.slot() * (self.connection_count() as u32 + 1);
        if needed.as_micros() <= shortest.as_micros() {
            Ok(())
        } else {
            debug!(
                "can't admit connection: {} needed, shortest interval {}",
                needed, shortest
            );
            Err(Error::ResourceExhausted)
        }
    }

    /// Returns the shortest connection interval (1.25 ms units) that still fits the current
    /// number of connections.
    pub fn min_interval(&self) -> u16 {
        let needed = self.slot() * self.connection_count().max(1) as u32;
        needed.div_ceil(Duration::CONN_UNIT).max(6) as u16
    }

    /// Picks the first anchor at or after `earliest` for a new connection with `interval` whose
    /// slot doesn't collide with any existing connection.
    pub fn free_anchor(&self, earliest: Instant, interval: Duration) -> Instant {
        let slot = self.slot();
        let slots = interval.div_ceil(slot).max(1);
        for n in 0..slots {
            let candidate = earliest + slot * n;
            let collides = self
                .tasks
                .iter()
                .filter(|(_, t)| t.kind.is_connection())
                .any(|(_, t)| collides_periodic(candidate, t.anchor, t.interval, slot));
            if !collides {
                return candidate;
            }
        }
        earliest
    }

    /// Returns the earliest time a new radio operation may start.
    pub fn earliest(&self, now: Instant) -> Instant {
        match self.busy_until {
            Some(busy) => now.max(busy) + self.pre_guard,
            None => now + self.pre_guard,
        }
    }

    /// Returns an active anchored task whose next occurrence can no longer be served, if any.
    ///
    /// The caller closes that occurrence as missed and calls [`skip`](#method.skip).
    pub fn overdue(&self, earliest: Instant) -> Option<usize> {
        self.tasks
            .iter()
            .filter(|(i, t)| {
                t.kind.is_anchored()
                    && t.state == TaskState::Active
                    && Some(*i) != self.current
                    && t.window_start().is_before(earliest)
            })
            .map(|(i, _)| i)
            .next()
    }

    /// Moves an anchored task past an occurrence that didn't take place.
    pub fn skip(&mut self, index: usize, change: Option<TimingChange>) {
        if let Some(task) = self.tasks.get_mut(index) {
            task.missed += 1;
            advance(task, change);
            trace!("task {} missed occurrence, {} in a row", index, task.missed);
        }
    }

    /// Chooses the task to run next, starting no earlier than `earliest`.
    ///
    /// The connection with the nearest anchor is the default. A secondary task is chosen instead
    /// if it is due and fits, with its guards, before that anchor.
    pub fn select(&self, earliest: Instant) -> Option<Selection> {
        let next_conn = self
            .tasks
            .iter()
            .filter(|(_, t)| t.kind.is_connection() && t.state == TaskState::Active)
            .fold(None::<(usize, &Task)>, |best, (i, t)| match best {
                Some((_, b)) if !t.window_start().is_before(b.window_start()) => best,
                _ => Some((i, t)),
            });
        let deadline = next_conn.map(|(_, t)| t.window_start() - self.pre_guard);

        let mut best: Option<(Selection, u8)> = None;
        for (i, t) in self.tasks.iter() {
            if t.kind.is_connection() || t.state != TaskState::Active {
                continue;
            }
            if t.kind.is_anchored() && t.anchor.is_before(earliest) {
                continue;
            }
            let start = t.anchor.max(earliest);
            let mut duration = t.duration;
            if let Some(deadline) = deadline {
                let end = start + duration + self.post_guard;
                if end.is_after(deadline) {
                    if !t.kind.is_truncatable() || !start.is_before(deadline) {
                        continue;
                    }
                    let room = (deadline - start) - self.post_guard;
                    if room.as_micros() < self.slot_unit.as_micros() {
                        continue;
                    }
                    duration = room;
                }
            }
            let rank = self.policy.rank(t.kind);
            let candidate = Selection {
                task: i,
                kind: t.kind,
                start,
                duration,
            };
            let better = match &best {
                None => true,
                Some((b, b_rank)) => {
                    start.is_before(b.start) || (start == b.start && rank < *b_rank)
                }
            };
            if better {
                best = Some((candidate, rank));
            }
        }

        if let Some((selection, _)) = best {
            return Some(selection);
        }
        next_conn.map(|(i, t)| Selection {
            task: i,
            kind: t.kind,
            start: t.window_start(),
            duration: t.window_len(),
        })
    }

    /// Binds the selected task to the radio after it was programmed successfully.
    pub fn begin(&mut self, selection: &Selection) {
        self.current = Some(selection.task);
        self.busy_before = self.busy_until;
        self.busy_until = Some(selection.start + selection.duration + self.post_guard);
        self.failing_since = None;
        if let Some(task) = self.tasks.get_mut(selection.task) {
            task.last_start = Some(selection.start);
        }
    }

    /// Records a failure to program the radio at `now`.
    ///
    /// Returns `true` once failures have persisted for `timeout`, which is fatal.
    pub fn programming_failed(&mut self, now: Instant, timeout: Duration) -> bool {
        let since = *self.failing_since.get_or_insert(now);
        (now - since).as_micros() >= timeout.as_micros()
    }

    /// Unbinds the current task once the radio reported completion at `end`.
    ///
    /// Anchored tasks move to their next anchor. For them, `synced` tells whether a valid packet
    /// was received and `change` carries new timing that takes effect with the next event. Other
    /// tasks move on by one interval plus `jitter` from where they actually started.
    pub fn complete(
        &mut self,
        end: Instant,
        synced: bool,
        change: Option<TimingChange>,
        jitter: Duration,
    ) -> Option<usize> {
        let index = self.current.take()?;
        // The radio is free once it reports completion.
        self.busy_until = Some(end + self.post_guard);
        if let Some(task) = self.tasks.get_mut(index) {
            if task.kind.is_anchored() {
                if synced {
                    task.missed = 0;
                } else {
                    task.missed += 1;
                }
                advance(task, change);
            } else {
                let start = task.last_start.unwrap_or(task.anchor);
                task.anchor = start + task.interval + jitter;
            }
        }
        Some(index)
    }

    /// Unbinds the current task without touching its timing, after its operation was aborted
    /// before it started.
    pub fn abort_current(&mut self) -> Option<usize> {
        let index = self.current.take()?;
        self.busy_until = self.busy_before;
        Some(index)
    }
}

/// Moves a connection task to its next anchor, applying `change` if an update took effect.
fn advance(task: &mut Task, change: Option<TimingChange>) {
    task.anchor += task.interval;
    if let Some(change) = change {
        // The new anchor follows the transmit window delay and offset.
        task.anchor += Duration::CONN_UNIT + change.win_offset;
        task.interval = change.interval;
    }
}

/// Returns whether a slot at `candidate` overlaps a slot of a connection anchored at `anchor`
/// every `interval`.
fn collides_periodic(candidate: Instant, anchor: Instant, interval: Duration, slot: Duration) -> bool {
    let interval = interval.as_micros();
    if interval == 0 {
        return false;
    }
    let offset = candidate.raw_micros().wrapping_sub(anchor.raw_micros()) % interval;
    offset < slot.as_micros() || interval - offset < slot.as_micros()
}
