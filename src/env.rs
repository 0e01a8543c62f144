//! The scheduler: a virtual-time priority queue plus the single dispatch
//! loop that drives every event, process and condition in a simulation.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::condition::{Condition, Predicate};
use crate::error::KernelError;
use crate::event::{cmp_f64, Continuation, Priority, SharedEvent, Slot};
use crate::process::{Process, ProcessBody, ProcessState};

/// What a queue slot dispatches to: either a real event, or the urgent
/// sentinel `Environment::run`'s time-bounded form schedules to pin
/// termination (mirroring SimPy's `StopSimulation`). The sentinel carries
/// no payload, so it needs no `V`/`E`-typed event to occupy its slot.
enum QueueEntry<V, E> {
    Real(SharedEvent<V, E>),
    Stop,
}

struct QueueItem<V, E> {
    time: f64,
    priority: u8,
    seq: u64,
    entry: QueueEntry<V, E>,
}

impl<V, E> PartialEq for QueueItem<V, E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.priority == other.priority && self.seq == other.seq
    }
}
impl<V, E> Eq for QueueItem<V, E> {}

impl<V, E> PartialOrd for QueueItem<V, E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V, E> Ord for QueueItem<V, E> {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_f64(self.time, other.time)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// What `Environment::step_inner` popped: a real event it dispatched, or
/// the `run(Until::Time)` stop sentinel.
enum StepOutcome {
    Dispatched,
    Stopped,
}

struct EnvCore<V, E> {
    now: f64,
    queue: BinaryHeap<Reverse<QueueItem<V, E>>>,
    seq: u64,
    active_process_identity: Option<usize>,
}

/// The simulation clock and event queue. Cheap to clone: every handle
/// shares the same underlying state, the same `Rc`-based model the rest of
/// the kernel uses.
pub struct Environment<V, E> {
    core: Rc<RefCell<EnvCore<V, E>>>,
}

impl<V, E> Clone for Environment<V, E> {
    fn clone(&self) -> Self {
        Environment { core: self.core.clone() }
    }
}

impl<V, E> PartialEq for Environment<V, E> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}
impl<V, E> Eq for Environment<V, E> {}

impl<V, E> Default for Environment<V, E> {
    fn default() -> Self {
        Environment {
            core: Rc::new(RefCell::new(EnvCore {
                now: 0.0,
                queue: BinaryHeap::new(),
                seq: 0,
                active_process_identity: None,
            })),
        }
    }
}

/// What `Environment::run` should advance to before stopping.
pub enum Until<V, E> {
    /// Run until the queue is empty.
    Forever,
    /// Advance to this virtual time, running every `Urgent` event at or
    /// before it, but stopping short of any `Normal` event scheduled for
    /// exactly this instant (an urgent stop sentinel is scheduled at this
    /// time to pin the cutoff, mirroring SimPy's `StopSimulation`).
    Time(f64),
    /// Run until this specific event has been processed.
    Event(SharedEvent<V, E>),
}

impl<V, E> Environment<V, E> {
    pub(crate) fn same_env(&self, other: &Environment<V, E>) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn set_active_process_identity(&self, id: usize) {
        self.core.borrow_mut().active_process_identity = Some(id);
    }

    pub(crate) fn clear_active_process_identity(&self) {
        self.core.borrow_mut().active_process_identity = None;
    }

    pub fn active_process_identity(&self) -> Option<usize> {
        self.core.borrow().active_process_identity
    }
}

impl<V: Clone + 'static, E: Clone + std::error::Error + 'static> Environment<V, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        self.core.borrow().now
    }

    pub fn event(&self) -> SharedEvent<V, E> {
        SharedEvent::new_pending(self.clone())
    }

    pub fn timeout(&self, delay: f64, value: V) -> Result<SharedEvent<V, E>, KernelError<E>> {
        if delay < 0.0 {
            return Err(KernelError::InvalidArgument("timeout delay must be non-negative".into()));
        }
        let ev = SharedEvent::new_pending(self.clone());
        ev.force(self, Slot::Ok(value), Priority::Normal, delay)?;
        Ok(ev)
    }

    pub fn process<B>(&self, body: B) -> Process<V, E>
    where
        B: ProcessBody<V, E> + 'static,
        V: Default,
    {
        Process::spawn(self, body)
    }

    pub(crate) fn schedule_triggered(
        &self,
        event: SharedEvent<V, E>,
        priority: Priority,
        delay: f64,
    ) -> Result<(), KernelError<E>> {
        if delay < 0.0 {
            return Err(KernelError::InvalidArgument("delay must be non-negative".into()));
        }
        let mut core = self.core.borrow_mut();
        let seq = core.seq;
        core.seq += 1;
        let time = core.now + delay;
        core.queue.push(Reverse(QueueItem { time, priority: priority.raw(), seq, entry: QueueEntry::Real(event) }));
        Ok(())
    }

    /// Schedules the urgent stop sentinel used by `run(Until::Time(..))`:
    /// it shares the same queue and insertion counter as real events, so it
    /// fires before any `Normal` event at the same instant but after any
    /// `Urgent` event already queued ahead of it, exactly like a real event
    /// would.
    fn schedule_stop(&self, delay: f64) {
        let mut core = self.core.borrow_mut();
        let seq = core.seq;
        core.seq += 1;
        let time = core.now + delay;
        core.queue.push(Reverse(QueueItem { time, priority: Priority::Urgent.raw(), seq, entry: QueueEntry::Stop }));
    }

    pub fn peek(&self) -> Option<f64> {
        self.core.borrow().queue.peek().map(|Reverse(item)| item.time)
    }

    /// Pops the earliest event, marks it processed and runs its callbacks
    /// in registration order. Returns `UnhandledFailure` if the popped
    /// event carried an error that nothing defused along the way.
    pub fn step(&self) -> Result<(), KernelError<E>> {
        self.step_inner().map(|_| ())
    }

    /// The shared pop-and-dispatch primitive behind `step()`. Reports back
    /// whether the popped slot was a real event or the `run(Until::Time)`
    /// stop sentinel, so that caller can tell the two apart without
    /// widening `step()`'s public return type.
    fn step_inner(&self) -> Result<StepOutcome, KernelError<E>> {
        let item = {
            let mut core = self.core.borrow_mut();
            core.queue.pop()
        }
        .ok_or(KernelError::EmptyQueue)?
        .0;

        {
            let mut core = self.core.borrow_mut();
            core.now = item.time;
        }

        let event = match item.entry {
            QueueEntry::Stop => {
                log::trace!("dispatch t={} stop sentinel", item.time);
                return Ok(StepOutcome::Stopped);
            }
            QueueEntry::Real(event) => event,
        };

        log::trace!("dispatch t={} priority={}", item.time, item.priority);

        let was_ok = event.ok();
        let callbacks = event.take_callbacks().unwrap_or_default();

        for cont in callbacks {
            self.dispatch(&event, cont);
        }

        if was_ok == Some(false) && !event.defused() {
            let err = event.error()?;
            log::warn!("unhandled failure surfaced at t={}", item.time);
            return Err(KernelError::UnhandledFailure(err));
        }
        Ok(StepOutcome::Dispatched)
    }

    fn dispatch(&self, event: &SharedEvent<V, E>, cont: Continuation<V, E>) {
        match cont {
            Continuation::ResumeProcess(weak) => {
                if let Some(state) = weak.upgrade() {
                    ProcessState::resume_from_event(&state, self, event);
                }
            }
            Continuation::DeliverInterrupt(weak, target) => {
                if let Some(state) = weak.upgrade() {
                    ProcessState::deliver_interrupt(&state, self, &target, event);
                }
            }
            Continuation::ConditionCheck(weak) => {
                if let Some(state) = weak.upgrade() {
                    Condition::check(&state, self, event);
                }
            }
            Continuation::ConditionCollect(weak) => {
                if let Some(state) = weak.upgrade() {
                    Condition::collect_values(&state, event);
                }
            }
            Continuation::UserCallback(mut f) => f(event),
        }
    }

    pub fn run(&self, until: Until<V, E>) -> Result<Option<V>, KernelError<E>> {
        match until {
            Until::Forever => loop {
                match self.step() {
                    Ok(()) => {}
                    Err(KernelError::EmptyQueue) => return Ok(None),
                    Err(e) => return Err(e),
                }
            },
            Until::Time(limit) => {
                let delay = (limit - self.now()).max(0.0);
                self.schedule_stop(delay);
                loop {
                    match self.step_inner()? {
                        StepOutcome::Dispatched => {}
                        StepOutcome::Stopped => return Ok(None),
                    }
                }
            }
            Until::Event(target) => loop {
                if target.processed() {
                    return match target.ok() {
                        Some(true) => Ok(Some(target.value()?)),
                        Some(false) => {
                            if target.defused() {
                                Ok(None)
                            } else {
                                Err(KernelError::UnhandledFailure(target.error()?))
                            }
                        }
                        None => unreachable!("a processed event is always triggered"),
                    };
                }
                self.step()?;
            },
        }
    }
}

impl<V, E> Environment<V, E>
where
    V: Clone + 'static + From<IndexMap<usize, V>>,
    E: Clone + std::error::Error + 'static,
{
    pub fn all_of(&self, events: Vec<SharedEvent<V, E>>) -> Result<Condition<V, E>, KernelError<E>> {
        Condition::new(self, Predicate::All, events)
    }

    pub fn any_of(&self, events: Vec<SharedEvent<V, E>>) -> Result<Condition<V, E>, KernelError<E>> {
        Condition::new(self, Predicate::Any, events)
    }
}
