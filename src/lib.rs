/* Copyright © 2018 Gianmarco Garrisi

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <http://www.gnu.org/licenses/>. */

//! A discrete event simulation kernel inspired by the SimPy library for
//! Python, built on stable Rust.
//!
//! # Simulation
//! An [`Environment`] owns a virtual clock and a priority queue of events.
//! You drive a simulation by creating events — timeouts, processes,
//! conditions — and letting the environment dispatch them with
//! [`Environment::step`] or [`Environment::run`].
//!
//! A process is any [`ProcessBody`] implementation: a small state machine
//! that suspends by yielding an event and resumes once that event fires.
//! Processes can be composed with `&`/`|` to wait on several at once, join
//! each other's completion, and interrupt one another.

mod condition;
mod env;
mod error;
mod event;
mod process;

pub use condition::Condition;
pub use env::{Environment, Until};
pub use error::KernelError;
pub use event::{Priority, SharedEvent};
pub use process::{Interrupt, Process, ProcessBody, Step};

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use std::convert::Infallible;
    use std::error::Error;
    use std::fmt;

    // A small "record the clock, yield a one-second timeout" process used
    // by the ticker scenario below.
    struct Ticker {
        recorded: std::rc::Rc<std::cell::RefCell<Vec<f64>>>,
        remaining: u32,
    }

    impl ProcessBody<f64, Infallible> for Ticker {
        fn start(&mut self, env: &Environment<f64, Infallible>) -> Step<f64, Infallible> {
            self.recorded.borrow_mut().push(env.now());
            Step::Yield(env.timeout(1.0, env.now()).unwrap())
        }

        fn resume(&mut self, env: &Environment<f64, Infallible>, _value: f64) -> Step<f64, Infallible> {
            self.recorded.borrow_mut().push(env.now());
            if self.remaining == 0 {
                return Step::Return(env.now());
            }
            self.remaining -= 1;
            Step::Yield(env.timeout(1.0, env.now()).unwrap())
        }

        fn throw(&mut self, _env: &Environment<f64, Infallible>, err: Infallible) -> Step<f64, Infallible> {
            match err {}
        }
    }

    #[test]
    fn ticker_records_every_whole_second() {
        let env: Environment<f64, Infallible> = Environment::new();
        let recorded = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let _p = env.process(Ticker { recorded: recorded.clone(), remaining: 3 });
        env.run(Until::Time(4.0)).unwrap();
        assert_eq!(*recorded.borrow(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    // Interrupt propagation: a child waits on a long timeout and would fail
    // if it ever actually fired; the parent interrupts it first and the
    // child catches the interrupt and exits cleanly.

    #[derive(Debug, Clone)]
    enum DemoError {
        Interrupted(String),
        WokeUnexpectedly,
    }
    impl fmt::Display for DemoError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                DemoError::Interrupted(why) => write!(f, "interrupted: {why}"),
                DemoError::WokeUnexpectedly => write!(f, "woke up without being interrupted"),
            }
        }
    }
    impl Error for DemoError {}
    impl From<Interrupt<String>> for DemoError {
        fn from(i: Interrupt<String>) -> Self {
            DemoError::Interrupted(i.into_cause())
        }
    }

    struct WaitsTooLong {
        terminated_at: std::rc::Rc<std::cell::RefCell<Option<f64>>>,
    }
    impl ProcessBody<(), DemoError> for WaitsTooLong {
        fn start(&mut self, env: &Environment<(), DemoError>) -> Step<(), DemoError> {
            Step::Yield(env.timeout(10.0, ()).unwrap())
        }
        fn resume(&mut self, _env: &Environment<(), DemoError>, _v: ()) -> Step<(), DemoError> {
            Step::Fail(DemoError::WokeUnexpectedly)
        }
        fn throw(&mut self, env: &Environment<(), DemoError>, err: DemoError) -> Step<(), DemoError> {
            match err {
                DemoError::Interrupted(_) => {
                    *self.terminated_at.borrow_mut() = Some(env.now());
                    Step::Return(())
                }
                other => Step::Fail(other),
            }
        }
    }

    struct InterruptsChild {
        child: Option<Process<(), DemoError>>,
        terminated_at: std::rc::Rc<std::cell::RefCell<Option<f64>>>,
    }
    impl ProcessBody<(), DemoError> for InterruptsChild {
        fn start(&mut self, env: &Environment<(), DemoError>) -> Step<(), DemoError> {
            let child = env.process(WaitsTooLong { terminated_at: self.terminated_at.clone() });
            self.child = Some(child);
            Step::Yield(env.timeout(5.0, ()).unwrap())
        }
        fn resume(&mut self, env: &Environment<(), DemoError>, _v: ()) -> Step<(), DemoError> {
            let child = self.child.take().expect("child was spawned in start");
            child.interrupt(env, "time's up".to_string()).unwrap();
            Step::Return(())
        }
        fn throw(&mut self, _env: &Environment<(), DemoError>, err: DemoError) -> Step<(), DemoError> {
            Step::Fail(err)
        }
    }

    #[test]
    fn interrupting_a_child_stops_it_cleanly() {
        let env: Environment<(), DemoError> = Environment::new();
        let terminated_at = std::rc::Rc::new(std::cell::RefCell::new(None));
        let _p = env.process(InterruptsChild { child: None, terminated_at: terminated_at.clone() });
        env.run(Until::Time(20.0)).unwrap();
        assert_eq!(*terminated_at.borrow(), Some(5.0));
        assert_eq!(env.now(), 20.0);
    }

    // Join: a parent waits on its child's completion event and resumes with
    // the child's return value at the child's termination time.

    struct Child10;
    impl ProcessBody<f64, Infallible> for Child10 {
        fn start(&mut self, env: &Environment<f64, Infallible>) -> Step<f64, Infallible> {
            Step::Yield(env.timeout(10.0, 0.0).unwrap())
        }
        fn resume(&mut self, env: &Environment<f64, Infallible>, _v: f64) -> Step<f64, Infallible> {
            Step::Return(env.now())
        }
        fn throw(&mut self, _env: &Environment<f64, Infallible>, err: Infallible) -> Step<f64, Infallible> {
            match err {}
        }
    }

    struct Joiner {
        result: std::rc::Rc<std::cell::RefCell<Option<f64>>>,
    }
    impl ProcessBody<f64, Infallible> for Joiner {
        fn start(&mut self, env: &Environment<f64, Infallible>) -> Step<f64, Infallible> {
            let child = env.process(Child10);
            Step::Yield(child.event())
        }
        fn resume(&mut self, _env: &Environment<f64, Infallible>, value: f64) -> Step<f64, Infallible> {
            *self.result.borrow_mut() = Some(value);
            Step::Return(value)
        }
        fn throw(&mut self, _env: &Environment<f64, Infallible>, err: Infallible) -> Step<f64, Infallible> {
            match err {}
        }
    }

    #[test]
    fn join_resumes_with_childs_return_value_at_the_right_time() {
        let env: Environment<f64, Infallible> = Environment::new();
        let result = std::rc::Rc::new(std::cell::RefCell::new(None));
        let _p = env.process(Joiner { result: result.clone() });
        env.run(Until::Forever).unwrap();
        assert_eq!(env.now(), 10.0);
        assert_eq!(*result.borrow(), Some(10.0));
    }

    // Unhandled failure surfaces out of run().

    #[derive(Debug, Clone)]
    struct BoomError(String);
    impl fmt::Display for BoomError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl Error for BoomError {}

    struct Bomb;
    impl ProcessBody<(), BoomError> for Bomb {
        fn start(&mut self, env: &Environment<(), BoomError>) -> Step<(), BoomError> {
            Step::Yield(env.timeout(1.0, ()).unwrap())
        }
        fn resume(&mut self, _env: &Environment<(), BoomError>, _v: ()) -> Step<(), BoomError> {
            Step::Fail(BoomError("boom".to_string()))
        }
        fn throw(&mut self, _env: &Environment<(), BoomError>, err: BoomError) -> Step<(), BoomError> {
            Step::Fail(err)
        }
    }

    #[test]
    fn unhandled_process_failure_surfaces_from_run() {
        let env: Environment<(), BoomError> = Environment::new();
        let _p = env.process(Bomb);
        let err = env.run(Until::Time(20.0)).unwrap_err();
        assert_eq!(env.now(), 1.0);
        match err {
            KernelError::UnhandledFailure(e) => assert_eq!(e.0, "boom"),
            other => panic!("expected UnhandledFailure, got {other}"),
        }
    }

    // All-of / any-of fan-in over a batch of children racing timeouts.
    // `Num` stands in for whatever payload enum a real simulation would
    // define; it needs a `Map` variant purely so conditions over it can
    // hold their collected-values map (see `Environment::all_of`/`any_of`).

    #[derive(Clone, Debug, PartialEq)]
    enum Num {
        Val(f64),
        Map(IndexMap<usize, Num>),
    }
    impl Default for Num {
        fn default() -> Self {
            Num::Val(0.0)
        }
    }
    impl From<IndexMap<usize, Num>> for Num {
        fn from(m: IndexMap<usize, Num>) -> Self {
            Num::Map(m)
        }
    }

    struct CountsDown(f64);
    impl ProcessBody<Num, Infallible> for CountsDown {
        fn start(&mut self, env: &Environment<Num, Infallible>) -> Step<Num, Infallible> {
            Step::Yield(env.timeout(self.0, Num::Val(self.0)).unwrap())
        }
        fn resume(&mut self, _env: &Environment<Num, Infallible>, value: Num) -> Step<Num, Infallible> {
            Step::Return(value)
        }
        fn throw(&mut self, _env: &Environment<Num, Infallible>, err: Infallible) -> Step<Num, Infallible> {
            match err {}
        }
    }

    #[test]
    fn all_of_waits_for_the_slowest_child() {
        let env: Environment<Num, Infallible> = Environment::new();
        let children: Vec<_> = (0..10).rev().map(|i| env.process(CountsDown(i as f64)).event()).collect();
        let cond = env.all_of(children).unwrap();
        let out = cond.event();
        env.run(Until::Event(out.clone())).unwrap();
        assert_eq!(env.now(), 9.0);
        match out.value().unwrap() {
            Num::Map(map) => {
                let values: Vec<f64> = map
                    .values()
                    .map(|v| match v {
                        Num::Val(n) => *n,
                        Num::Map(_) => panic!("unexpected nested map"),
                    })
                    .collect();
                assert_eq!(values, vec![9.0, 8.0, 7.0, 6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
            }
            other => panic!("expected a collected-values map, got {other:?}"),
        }
    }

    #[test]
    fn any_of_resumes_with_the_fastest_child() {
        let env: Environment<Num, Infallible> = Environment::new();
        let children: Vec<_> = (0..10).rev().map(|i| env.process(CountsDown(i as f64)).event()).collect();
        let cond = env.any_of(children).unwrap();
        let out = cond.event();
        env.run(Until::Event(out.clone())).unwrap();
        assert_eq!(env.now(), 0.0);
        match out.value().unwrap() {
            Num::Map(map) => {
                let values: Vec<Num> = map.values().cloned().collect();
                assert_eq!(values, vec![Num::Val(0.0)]);
            }
            other => panic!("expected a collected-values map, got {other:?}"),
        }
    }

    #[test]
    fn nested_condition_flattens_into_the_parent_map() {
        let env: Environment<Num, Infallible> = Environment::new();
        let a = env.process(CountsDown(1.0)).event();
        let b = env.process(CountsDown(2.0)).event();
        let c = env.process(CountsDown(3.0)).event();
        let inner = env.any_of(vec![b, c]).unwrap();
        let cond = env.all_of(vec![a, inner.event()]).unwrap();
        let out = cond.event();
        env.run(Until::Event(out.clone())).unwrap();
        match out.value().unwrap() {
            Num::Map(map) => {
                let values: Vec<Num> = map.values().cloned().collect();
                assert_eq!(values, vec![Num::Val(1.0), Num::Val(2.0)]);
            }
            other => panic!("expected a flattened collected-values map, got {other:?}"),
        }
    }

    // A child's failure surfaces to whoever yields its completion event.
    // Handled, the parent recovers and the run completes cleanly; unhandled,
    // it propagates out of `run` just like a root-level failure would.

    struct FailsAfterOneTick;
    impl ProcessBody<(), BoomError> for FailsAfterOneTick {
        fn start(&mut self, env: &Environment<(), BoomError>) -> Step<(), BoomError> {
            Step::Yield(env.timeout(1.0, ()).unwrap())
        }
        fn resume(&mut self, _env: &Environment<(), BoomError>, _v: ()) -> Step<(), BoomError> {
            Step::Fail(BoomError("child boom".to_string()))
        }
        fn throw(&mut self, _env: &Environment<(), BoomError>, err: BoomError) -> Step<(), BoomError> {
            Step::Fail(err)
        }
    }

    struct CatchesChildFailure {
        caught: std::rc::Rc<std::cell::RefCell<Option<String>>>,
    }
    impl ProcessBody<(), BoomError> for CatchesChildFailure {
        fn start(&mut self, env: &Environment<(), BoomError>) -> Step<(), BoomError> {
            Step::Yield(env.process(FailsAfterOneTick).event())
        }
        fn resume(&mut self, _env: &Environment<(), BoomError>, _v: ()) -> Step<(), BoomError> {
            Step::Fail(BoomError("parent should not resume on child success".to_string()))
        }
        fn throw(&mut self, _env: &Environment<(), BoomError>, err: BoomError) -> Step<(), BoomError> {
            *self.caught.borrow_mut() = Some(err.0.clone());
            Step::Return(())
        }
    }

    #[test]
    fn parent_can_handle_a_childs_failure() {
        let env: Environment<(), BoomError> = Environment::new();
        let caught = std::rc::Rc::new(std::cell::RefCell::new(None));
        let _p = env.process(CatchesChildFailure { caught: caught.clone() });
        env.run(Until::Forever).unwrap();
        assert_eq!(env.now(), 1.0);
        assert_eq!(*caught.borrow(), Some("child boom".to_string()));
    }

    struct IgnoresChildFailure;
    impl ProcessBody<(), BoomError> for IgnoresChildFailure {
        fn start(&mut self, env: &Environment<(), BoomError>) -> Step<(), BoomError> {
            Step::Yield(env.process(FailsAfterOneTick).event())
        }
        fn resume(&mut self, _env: &Environment<(), BoomError>, _v: ()) -> Step<(), BoomError> {
            Step::Fail(BoomError("parent should not resume on child success".to_string()))
        }
        fn throw(&mut self, _env: &Environment<(), BoomError>, err: BoomError) -> Step<(), BoomError> {
            // Does not catch: propagates the child's failure as its own.
            Step::Fail(err)
        }
    }

    #[test]
    fn unhandled_child_failure_propagates_out_of_run() {
        let env: Environment<(), BoomError> = Environment::new();
        let _p = env.process(IgnoresChildFailure);
        let err = env.run(Until::Forever).unwrap_err();
        assert_eq!(env.now(), 1.0);
        match err {
            KernelError::UnhandledFailure(e) => assert_eq!(e.0, "child boom"),
            other => panic!("expected UnhandledFailure, got {other}"),
        }
    }
}
