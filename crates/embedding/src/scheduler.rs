//! Cooperative, time-budgeted execution of resumable work.
//!
//! Long-running work is expressed as a [`Resumable`] state object that
//! advances one coarse step at a time ("next 512 triangles", "next mesh").
//! [`Scheduler::tick`] runs steps until the frame budget is spent and then
//! hands control back to the host loop. Because all progress lives in the
//! state object, the resumption point is inspectable between ticks.
//!
//! The clock is checked only at step boundaries; there is no preemption
//! inside a step and no threading. At least one step runs per tick so work
//! always makes progress, even with a zero budget.

use std::cell::Cell;
use std::time::{Duration, Instant};

use embedding_config::DeformationConfig;
use tracing::trace;

/// Result of advancing a resumable task by one coarse step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<T> {
    /// More steps remain
    Pending,
    /// The task finished with this output
    Ready(T),
}

/// Work that can be advanced incrementally and suspended between steps.
///
/// Implementations must leave any shared data consistent after every step,
/// since the host may run arbitrary code between two ticks.
pub trait Resumable {
    type Output;

    /// Advance by one coarse step.
    fn step(&mut self) -> Step<Self::Output>;
}

/// Monotonic time source read at step boundaries.
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed origin.
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Deterministic clock that advances by a fixed increment on every reading.
///
/// Lets tests reproduce exact yield points regardless of machine speed.
#[derive(Debug, Default)]
pub struct SteppingClock {
    now: Cell<Duration>,
    increment: Duration,
}

impl SteppingClock {
    pub fn new(increment: Duration) -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            increment,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Duration {
        let now = self.now.get();
        self.now.set(now + self.increment);
        now
    }
}

/// Outcome of one [`Scheduler::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome<T> {
    /// Budget exhausted; call `tick` again next frame to resume
    Yielded { steps: usize },
    /// Task finished during this tick
    Complete { output: T, steps: usize },
}

impl<T> TickOutcome<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, TickOutcome::Complete { .. })
    }

    /// Steps executed during the tick.
    pub fn steps(&self) -> usize {
        match self {
            TickOutcome::Yielded { steps } | TickOutcome::Complete { steps, .. } => *steps,
        }
    }

    /// The task output, if it finished.
    pub fn into_output(self) -> Option<T> {
        match self {
            TickOutcome::Complete { output, .. } => Some(output),
            TickOutcome::Yielded { .. } => None,
        }
    }
}

/// Runs resumable tasks within a per-tick wall-clock budget.
#[derive(Debug)]
pub struct Scheduler<C: Clock = MonotonicClock> {
    clock: C,
    budget: Duration,
}

impl Scheduler<MonotonicClock> {
    /// Scheduler on the wall clock with the given per-tick budget.
    pub fn new(budget: Duration) -> Self {
        Self::with_clock(MonotonicClock::new(), budget)
    }

    /// Scheduler on the wall clock using the configured frame budget.
    pub fn from_config(config: &DeformationConfig) -> Self {
        Self::new(config.frame_budget())
    }
}

impl<C: Clock> Scheduler<C> {
    /// Scheduler on a caller-supplied clock.
    pub fn with_clock(clock: C, budget: Duration) -> Self {
        Self { clock, budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn set_budget(&mut self, budget: Duration) {
        self.budget = budget;
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Advance `task` until it completes or the budget is exceeded.
    ///
    /// Elapsed time is measured at each step boundary, so a tick may overrun
    /// the budget by at most one step.
    pub fn tick<R: Resumable>(&self, task: &mut R) -> TickOutcome<R::Output> {
        let start = self.clock.now();
        let mut steps = 0;
        loop {
            steps += 1;
            if let Step::Ready(output) = task.step() {
                trace!("tick: complete after {} steps", steps);
                return TickOutcome::Complete { output, steps };
            }
            let elapsed = self.clock.now().saturating_sub(start);
            if elapsed >= self.budget {
                trace!("tick: yielding after {} steps ({:?})", steps, elapsed);
                return TickOutcome::Yielded { steps };
            }
        }
    }
}

/// Drive a task to completion with no budget.
pub fn run_to_completion<R: Resumable>(task: &mut R) -> R::Output {
    loop {
        if let Step::Ready(output) = task.step() {
            return output;
        }
    }
}
