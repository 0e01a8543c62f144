//! Error taxonomy for the simulation kernel.
//!
//! `KernelError<E>` covers failures raised by the kernel itself (scheduling,
//! event lifecycle, process driving). `E` is the user-supplied failure type
//! carried by processes and surfaced through `UnhandledFailure`; an
//! interrupt is delivered as a value of `E` itself (see
//! [`crate::process::Interrupt`]), not as a `KernelError` variant.

use thiserror::Error;

/// Errors that can arise while driving the kernel: scheduling events,
/// stepping the environment, or resuming processes.
///
/// `E` is the process failure type and must implement `std::error::Error`
/// so the kernel can chain it as a `source()`.
#[derive(Error, Debug)]
pub enum KernelError<E: std::error::Error + 'static> {
    /// An event's `succeed`/`fail` was called on an event that already left
    /// the `Pending` state.
    #[error("event already triggered")]
    AlreadyTriggered,

    /// An operation that requires a triggered-but-not-yet-processed event
    /// was attempted on one that is still pending.
    #[error("event is not ready yet")]
    NotReady,

    /// A caller passed a value the kernel cannot accept, e.g. scheduling a
    /// negative delay.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An event or process was used with an `Environment` other than the
    /// one that created it.
    #[error("event does not belong to this environment")]
    EnvironmentMismatch,

    /// `Environment::step` was called with no pending events left.
    #[error("no scheduled events left")]
    EmptyQueue,

    /// An interrupt was raised against a process that cannot be
    /// interrupted right now (e.g. it has already terminated).
    #[error("process cannot be interrupted")]
    InterruptNotAllowed,

    /// A callback was appended to an event that has already been
    /// processed; the kernel does not re-fire processed events.
    #[error("event has already been processed")]
    AlreadyProcessed,

    /// A process terminated with an error that nothing downstream
    /// observed or handled.
    #[error("unhandled process failure")]
    UnhandledFailure(#[source] E),
}
