//! The event object model: a `Pending -> triggered -> processed` state
//! machine shared by timeouts, process completions and conditions.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::condition::{Condition, ConditionState, Predicate};
use crate::env::Environment;
use crate::error::KernelError;
use crate::process::ProcessState;

/// The outcome slot of an event: unset, or a success/failure payload.
pub(crate) enum Slot<V, E> {
    Pending,
    Ok(V),
    Err(E),
}

/// Dispatch priority. Lower values fire first at the same virtual time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Urgent,
    Normal,
}

impl Priority {
    pub(crate) fn raw(self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::Normal => 1,
        }
    }
}

/// A closed set of continuations a dispatched event can carry. Keeping this
/// as an enum (rather than a bag of trait objects) lets the scheduler match
/// on what kind of waiter it is waking without downcasting.
pub(crate) enum Continuation<V, E> {
    ResumeProcess(Weak<RefCell<ProcessState<V, E>>>),
    DeliverInterrupt(Weak<RefCell<ProcessState<V, E>>>, SharedEvent<V, E>),
    ConditionCheck(Weak<RefCell<ConditionState<V, E>>>),
    ConditionCollect(Weak<RefCell<ConditionState<V, E>>>),
    UserCallback(Box<dyn FnMut(&SharedEvent<V, E>)>),
}

pub(crate) struct EventInner<V, E> {
    env: Environment<V, E>,
    slot: Slot<V, E>,
    callbacks: Option<Vec<Continuation<V, E>>>,
    defused: Cell<bool>,
    /// Set only on a `Condition`'s own `out` event, linking back to the
    /// state that produced it. Lets `collect_values` recognize a sub-event
    /// as itself a condition and flatten its map instead of nesting it.
    condition_state: Option<Weak<RefCell<ConditionState<V, E>>>>,
}

/// A reference-counted handle to an event. Cloning is cheap: it shares the
/// same underlying state, matching the single-threaded, `Rc`-based ownership
/// model used throughout this crate.
pub struct SharedEvent<V, E>(pub(crate) Rc<RefCell<EventInner<V, E>>>);

impl<V, E> Clone for SharedEvent<V, E> {
    fn clone(&self) -> Self {
        SharedEvent(self.0.clone())
    }
}

impl<V, E> PartialEq for SharedEvent<V, E> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl<V, E> Eq for SharedEvent<V, E> {}

impl<V: Clone, E: Clone + std::error::Error + 'static> SharedEvent<V, E> {
    pub(crate) fn new_pending(env: Environment<V, E>) -> Self {
        SharedEvent(Rc::new(RefCell::new(EventInner {
            env,
            slot: Slot::Pending,
            callbacks: Some(Vec::new()),
            defused: Cell::new(false),
            condition_state: None,
        })))
    }

    /// A stable identity for this event, used as the key in a condition's
    /// collected-values map and for environment-mismatch comparisons.
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub(crate) fn owning_env(&self) -> Environment<V, E> {
        self.0.borrow().env.clone()
    }

    pub fn triggered(&self) -> bool {
        !matches!(self.0.borrow().slot, Slot::Pending)
    }

    pub fn processed(&self) -> bool {
        self.0.borrow().callbacks.is_none()
    }

    /// `Some(true)` on success, `Some(false)` on failure, `None` while
    /// still pending.
    pub fn ok(&self) -> Option<bool> {
        match self.0.borrow().slot {
            Slot::Pending => None,
            Slot::Ok(_) => Some(true),
            Slot::Err(_) => Some(false),
        }
    }

    pub fn value(&self) -> Result<V, KernelError<E>> {
        match &self.0.borrow().slot {
            Slot::Ok(v) => Ok(v.clone()),
            Slot::Pending => Err(KernelError::NotReady),
            Slot::Err(_) => Err(KernelError::NotReady),
        }
    }

    pub fn error(&self) -> Result<E, KernelError<E>> {
        match &self.0.borrow().slot {
            Slot::Err(e) => Ok(e.clone()),
            Slot::Pending => Err(KernelError::NotReady),
            Slot::Ok(_) => Err(KernelError::NotReady),
        }
    }

    pub fn defused(&self) -> bool {
        self.0.borrow().defused.get()
    }

    pub fn defuse(&self) {
        self.0.borrow().defused.set(true)
    }

    /// Tags this event as a `Condition`'s `out` event, linking back to the
    /// state `collect_values` needs to flatten it when it appears as a
    /// sub-event of another condition.
    pub(crate) fn set_condition_state(&self, state: Weak<RefCell<ConditionState<V, E>>>) {
        self.0.borrow_mut().condition_state = Some(state);
    }

    pub(crate) fn condition_state(&self) -> Option<Weak<RefCell<ConditionState<V, E>>>> {
        self.0.borrow().condition_state.clone()
    }

    pub fn callbacks_len(&self) -> usize {
        self.0.borrow().callbacks.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Moves an event from `Pending` straight into `triggered`, scheduling
    /// it for dispatch. Used by `succeed`/`fail`/`trigger` and internally by
    /// the process driver and condition composer for the variants that
    /// need a non-default priority (`Initialize`, `Interruption`).
    pub(crate) fn force(
        &self,
        env: &Environment<V, E>,
        slot: Slot<V, E>,
        priority: Priority,
        delay: f64,
    ) -> Result<(), KernelError<E>> {
        {
            let mut inner = self.0.borrow_mut();
            if !matches!(inner.slot, Slot::Pending) {
                return Err(KernelError::AlreadyTriggered);
            }
            inner.slot = slot;
        }
        env.schedule_triggered(self.clone(), priority, delay)
    }

    pub fn succeed(&self, env: &Environment<V, E>, value: V) -> Result<(), KernelError<E>> {
        self.force(env, Slot::Ok(value), Priority::Normal, 0.0)
    }

    pub fn fail(&self, env: &Environment<V, E>, err: E) -> Result<(), KernelError<E>> {
        self.force(env, Slot::Err(err), Priority::Normal, 0.0)
    }

    /// Copies another (already triggered) event's outcome into this one and
    /// schedules it — a bridge between two events representing the same
    /// logical completion.
    pub fn trigger(&self, env: &Environment<V, E>, other: &SharedEvent<V, E>) -> Result<(), KernelError<E>> {
        let slot = match &other.0.borrow().slot {
            Slot::Pending => return Err(KernelError::NotReady),
            Slot::Ok(v) => Slot::Ok(v.clone()),
            Slot::Err(e) => Slot::Err(e.clone()),
        };
        self.force(env, slot, Priority::Normal, 0.0)
    }

    /// Used only by the condition composer to fill in the aggregated value
    /// after the event has already been triggered with a placeholder. Never
    /// exposed outside the crate: callers only ever observe an event once,
    /// from dispatch, by which point this has already run.
    pub(crate) fn overwrite_ok(&self, value: V) {
        let mut inner = self.0.borrow_mut();
        inner.slot = Slot::Ok(value);
    }

    pub(crate) fn push_callback(&self, cont: Continuation<V, E>) -> Result<(), KernelError<E>> {
        let mut inner = self.0.borrow_mut();
        match &mut inner.callbacks {
            Some(cbs) => {
                cbs.push(cont);
                Ok(())
            }
            None => Err(KernelError::AlreadyProcessed),
        }
    }

    /// Registers a plain closure to run once this event is processed.
    pub fn on_complete<F>(&self, f: F) -> Result<(), KernelError<E>>
    where
        F: FnMut(&SharedEvent<V, E>) + 'static,
    {
        self.push_callback(Continuation::UserCallback(Box::new(f)))
    }

    pub(crate) fn take_callbacks(&self) -> Option<Vec<Continuation<V, E>>> {
        self.0.borrow_mut().callbacks.take()
    }

    pub(crate) fn remove_resume_continuation(&self, proc: &Weak<RefCell<ProcessState<V, E>>>) {
        let mut inner = self.0.borrow_mut();
        if let Some(cbs) = &mut inner.callbacks {
            cbs.retain(|c| match c {
                Continuation::ResumeProcess(w) => !Weak::ptr_eq(w, proc),
                _ => true,
            });
        }
    }
}

/// Events are ordered purely by environment queue placement elsewhere; this
/// just gives the inner slot a total order for the scheduler's heap keys,
/// matching the convention of ordering `f64` times and panicking on `NaN`
/// rather than silently misordering the queue.
pub(crate) fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).expect("event times must never be NaN")
}

impl<V, E> std::ops::BitAnd for SharedEvent<V, E>
where
    V: Clone + 'static + From<IndexMap<usize, V>>,
    E: Clone + std::error::Error + 'static,
{
    type Output = SharedEvent<V, E>;

    fn bitand(self, rhs: Self) -> Self::Output {
        let env = self.owning_env();
        Condition::new(&env, Predicate::All, vec![self, rhs])
            .expect("`&` requires both events to belong to the same environment")
            .event()
    }
}

impl<V, E> std::ops::BitOr for SharedEvent<V, E>
where
    V: Clone + 'static + From<IndexMap<usize, V>>,
    E: Clone + std::error::Error + 'static,
{
    type Output = SharedEvent<V, E>;

    fn bitor(self, rhs: Self) -> Self::Output {
        let env = self.owning_env();
        Condition::new(&env, Predicate::Any, vec![self, rhs])
            .expect("`|` requires both events to belong to the same environment")
            .event()
    }
}
