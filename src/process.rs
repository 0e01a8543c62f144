//! The process driver: a resumable step-wise computation realized as a
//! manual continuation-passing state machine, since stable Rust has no
//! generator we can drive directly.

use std::cell::RefCell;
use std::rc::Rc;

use crate::env::Environment;
use crate::error::KernelError;
use crate::event::{Continuation, Priority, SharedEvent, Slot};

/// The next step a process body wants to take.
pub enum Step<V, E> {
    /// Suspend until `event` fires, then resume/throw depending on outcome.
    Yield(SharedEvent<V, E>),
    /// Terminate successfully with `V`.
    Return(V),
    /// Terminate with an unhandled error `E`.
    Fail(E),
}

/// A step-wise procedure driven by the kernel. Implementors hold whatever
/// state they need between steps (this is the tagged-state object the
/// design notes describe in place of a language-level generator).
pub trait ProcessBody<V, E> {
    fn start(&mut self, env: &Environment<V, E>) -> Step<V, E>;
    fn resume(&mut self, env: &Environment<V, E>, value: V) -> Step<V, E>;
    fn throw(&mut self, env: &Environment<V, E>, err: E) -> Step<V, E>;
}

/// The cause carried by an interrupt, opaque to the kernel and converted
/// into the process's own error type at the point of delivery.
#[derive(Debug, Clone)]
pub struct Interrupt<C> {
    cause: C,
}

impl<C> Interrupt<C> {
    pub fn cause(&self) -> &C {
        &self.cause
    }

    pub fn into_cause(self) -> C {
        self.cause
    }
}

pub(crate) struct ProcessState<V, E> {
    body: Box<dyn ProcessBody<V, E>>,
    started: bool,
    target: SharedEvent<V, E>,
    self_event: SharedEvent<V, E>,
}

enum Incoming<V, E> {
    Resume(V),
    Throw(E),
}

/// A handle to a running (or finished) process. Its own completion is an
/// event like any other: compose it with `&`/`|`, or yield it from another
/// process to join on it.
pub struct Process<V, E> {
    state: Rc<RefCell<ProcessState<V, E>>>,
}

impl<V, E> Clone for Process<V, E> {
    fn clone(&self) -> Self {
        Process { state: self.state.clone() }
    }
}

impl<V: Clone + Default + 'static, E: Clone + std::error::Error + 'static> Process<V, E> {
    pub(crate) fn spawn<B>(env: &Environment<V, E>, body: B) -> Self
    where
        B: ProcessBody<V, E> + 'static,
    {
        let self_event = SharedEvent::new_pending(env.clone());
        let state = Rc::new(RefCell::new(ProcessState {
            body: Box::new(body),
            started: false,
            target: self_event.clone(),
            self_event: self_event.clone(),
        }));

        let init = SharedEvent::new_pending(env.clone());
        init.force(env, Slot::Ok(V::default()), Priority::Urgent, 0.0)
            .expect("a freshly created event cannot already be triggered");
        init.push_callback(Continuation::ResumeProcess(Rc::downgrade(&state)))
            .expect("a freshly created event cannot already be processed");

        log::debug!("process spawned");
        Process { state }
    }

    pub fn event(&self) -> SharedEvent<V, E> {
        self.state.borrow().self_event.clone()
    }

    pub fn target(&self) -> SharedEvent<V, E> {
        self.state.borrow().target.clone()
    }

    pub fn is_alive(&self) -> bool {
        !self.state.borrow().self_event.triggered()
    }

    /// Interrupts the process with `cause`, converted into the process's
    /// error type `E` via `Interrupt<C>`'s `From` impl on `E`. Fails if the
    /// process has already terminated, or if it is interrupting itself.
    pub fn interrupt<C>(&self, env: &Environment<V, E>, cause: C) -> Result<(), KernelError<E>>
    where
        E: From<Interrupt<C>>,
    {
        if !self.is_alive() {
            return Err(KernelError::InterruptNotAllowed);
        }
        if env.active_process_identity() == Some(self.event().identity()) {
            return Err(KernelError::InterruptNotAllowed);
        }

        let err: E = Interrupt { cause }.into();
        let interruption = SharedEvent::new_pending(env.clone());
        interruption.force(env, Slot::Err(err), Priority::Urgent, 0.0)?;
        interruption.defuse();

        let weak_state = Rc::downgrade(&self.state);
        let target = self.state.borrow().target.clone();
        interruption.push_callback(Continuation::DeliverInterrupt(weak_state, target))?;
        log::debug!("process interrupted");
        Ok(())
    }
}

impl<V: Clone + Default + 'static, E: Clone + std::error::Error + 'static> ProcessState<V, E> {
    /// Drives the process's resume loop starting from `incoming`, looping
    /// internally whenever a yielded event turns out to already be
    /// processed (the single-step fast path described alongside the
    /// resume loop).
    fn drive(state: &Rc<RefCell<Self>>, env: &Environment<V, E>, incoming: Incoming<V, E>) {
        let identity = state.borrow().self_event.identity();
        env.set_active_process_identity(identity);

        let mut current = incoming;
        loop {
            let step = {
                let mut s = state.borrow_mut();
                if !s.started {
                    s.started = true;
                    s.body.start(env)
                } else {
                    match current {
                        Incoming::Resume(v) => s.body.resume(env, v),
                        Incoming::Throw(e) => s.body.throw(env, e),
                    }
                }
            };

            match step {
                Step::Return(v) => {
                    log::debug!("process terminated normally");
                    let self_event = state.borrow().self_event.clone();
                    let _ = self_event.succeed(env, v);
                    break;
                }
                Step::Fail(e) => {
                    log::debug!("process terminated with an error");
                    let self_event = state.borrow().self_event.clone();
                    let _ = self_event.fail(env, e);
                    break;
                }
                Step::Yield(next_event) => {
                    state.borrow_mut().target = next_event.clone();
                    if next_event.processed() {
                        current = match next_event.ok() {
                            Some(true) => Incoming::Resume(
                                next_event.value().expect("processed success event has a value"),
                            ),
                            Some(false) => {
                                next_event.defuse();
                                Incoming::Throw(
                                    next_event.error().expect("processed failure event has an error"),
                                )
                            }
                            None => unreachable!("a processed event is always triggered"),
                        };
                        continue;
                    } else {
                        let _ = next_event.push_callback(Continuation::ResumeProcess(Rc::downgrade(state)));
                        break;
                    }
                }
            }
        }

        env.clear_active_process_identity();
    }

    pub(crate) fn resume_from_event(
        state: &Rc<RefCell<Self>>,
        env: &Environment<V, E>,
        fired: &SharedEvent<V, E>,
    ) {
        let incoming = match fired.ok() {
            Some(true) => Incoming::Resume(fired.value().expect("processed success event has a value")),
            Some(false) => {
                fired.defuse();
                Incoming::Throw(fired.error().expect("processed failure event has an error"))
            }
            None => unreachable!("dispatch only fires triggered events"),
        };
        Self::drive(state, env, incoming);
    }

    pub(crate) fn deliver_interrupt(
        state: &Rc<RefCell<Self>>,
        env: &Environment<V, E>,
        target: &SharedEvent<V, E>,
        interruption: &SharedEvent<V, E>,
    ) {
        if state.borrow().self_event.triggered() {
            return;
        }
        target.remove_resume_continuation(&Rc::downgrade(state));
        let cause = interruption.error().expect("interruption events always carry an error");
        Self::drive(state, env, Incoming::Throw(cause));
    }
}
