//! Aggregates a list of sub-events under an `All`/`Any` predicate into a
//! single event whose success value is an insertion-ordered map from each
//! contributing sub-event's identity to its payload.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::env::Environment;
use crate::error::KernelError;
use crate::event::{Continuation, SharedEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Predicate {
    All,
    Any,
}

pub(crate) struct ConditionState<V, E> {
    events: Vec<SharedEvent<V, E>>,
    predicate: Predicate,
    count: usize,
    out: SharedEvent<V, E>,
}

impl<V, E> ConditionState<V, E> {
    fn predicate_holds(&self) -> bool {
        match self.predicate {
            Predicate::All => self.count >= self.events.len(),
            Predicate::Any => self.count > 0 || self.events.is_empty(),
        }
    }
}

/// A handle to a pending or resolved condition. Its `event()` is what you
/// actually yield or compose further.
pub struct Condition<V, E> {
    state: Rc<RefCell<ConditionState<V, E>>>,
}

impl<V, E> Clone for Condition<V, E> {
    fn clone(&self) -> Self {
        Condition { state: self.state.clone() }
    }
}

impl<V, E> Condition<V, E>
where
    V: Clone + 'static + From<IndexMap<usize, V>>,
    E: Clone + std::error::Error + 'static,
{
    pub(crate) fn new(
        env: &Environment<V, E>,
        predicate: Predicate,
        events: Vec<SharedEvent<V, E>>,
    ) -> Result<Self, KernelError<E>> {
        for e in &events {
            if !e.owning_env().same_env(env) {
                return Err(KernelError::EnvironmentMismatch);
            }
        }

        let out = SharedEvent::new_pending(env.clone());
        let state = Rc::new(RefCell::new(ConditionState {
            events: events.clone(),
            predicate,
            count: 0,
            out: out.clone(),
        }));
        out.set_condition_state(Rc::downgrade(&state));

        // Runs last among the condition's own callbacks only because it is
        // registered first: the scheduler invokes continuations in
        // registration order, and nothing else is registered on `out` yet.
        out.push_callback(Continuation::ConditionCollect(Rc::downgrade(&state)))?;

        if events.is_empty() {
            out.succeed(env, V::from(IndexMap::new()))?;
        } else {
            for e in &events {
                if e.processed() {
                    Self::check(&state, env, e);
                } else {
                    e.push_callback(Continuation::ConditionCheck(Rc::downgrade(&state)))?;
                }
            }
        }

        Ok(Condition { state })
    }

    pub fn event(&self) -> SharedEvent<V, E> {
        self.state.borrow().out.clone()
    }

    /// Invoked once per sub-event, when that sub-event is processed. Forwards
    /// the first failure and short-circuits; otherwise fires `out` as soon
    /// as the predicate holds, with a placeholder value later overwritten by
    /// `collect_values`.
    pub(crate) fn check(state: &Rc<RefCell<ConditionState<V, E>>>, env: &Environment<V, E>, sub_event: &SharedEvent<V, E>) {
        let out = state.borrow().out.clone();
        if out.triggered() {
            return;
        }
        state.borrow_mut().count += 1;

        match sub_event.ok() {
            Some(false) => {
                sub_event.defuse();
                let err = sub_event.error().expect("failed event carries an error");
                let _ = out.fail(env, err);
            }
            Some(true) => {
                if state.borrow().predicate_holds() {
                    let _ = out.succeed(env, V::from(IndexMap::new()));
                }
            }
            None => unreachable!("check only runs against processed sub-events"),
        }
    }

    /// Runs as `out`'s own first callback: walks the sub-events and builds
    /// the final insertion-ordered map, replacing the placeholder value
    /// `check` installed. A sub-event that is itself another condition's
    /// `out` event is flattened into this map rather than nested, so
    /// composing conditions reads the same as composing a single flat list.
    pub(crate) fn collect_values(state: &Rc<RefCell<ConditionState<V, E>>>, out: &SharedEvent<V, E>) {
        if out.ok() != Some(true) {
            return;
        }
        let map = Self::build_map(state);
        out.overwrite_ok(V::from(map));
    }

    fn build_map(state: &Rc<RefCell<ConditionState<V, E>>>) -> IndexMap<usize, V> {
        let events = state.borrow().events.clone();
        let mut map: IndexMap<usize, V> = IndexMap::new();
        for e in &events {
            if !e.processed() {
                continue;
            }
            if let Some(sub_state) = e.condition_state().and_then(|w| w.upgrade()) {
                map.extend(Self::build_map(&sub_state));
                continue;
            }
            if let Ok(v) = e.value() {
                map.insert(e.identity(), v);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Environment;
    use std::convert::Infallible;

    #[derive(Clone, Debug)]
    enum Val {
        Num(i64),
        Map(IndexMap<usize, Val>),
    }

    impl From<IndexMap<usize, Val>> for Val {
        fn from(m: IndexMap<usize, Val>) -> Self {
            Val::Map(m)
        }
    }

    #[test]
    fn all_of_empty_succeeds_immediately() {
        let env: Environment<Val, Infallible> = Environment::new();
        let cond = env.all_of(vec![]).unwrap();
        let ev = cond.event();
        env.run(crate::env::Until::Event(ev.clone())).unwrap();
        assert_eq!(ev.ok(), Some(true));
    }

    #[test]
    fn any_of_empty_succeeds_immediately() {
        let env: Environment<Val, Infallible> = Environment::new();
        let cond = env.any_of(vec![]).unwrap();
        let ev = cond.event();
        env.run(crate::env::Until::Event(ev.clone())).unwrap();
        assert_eq!(ev.ok(), Some(true));
    }
}
