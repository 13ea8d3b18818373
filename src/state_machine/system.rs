use std::time::Instant;

/// The [`SystemResource`] trait indicates that a type is a resource inherently provided by the
/// system context of the application, such as the current time.
///
/// Runners call [`generate`](SystemResource::generate) and hand the value to a pure
/// [`StateMachine`](super::StateMachine) through [`SystemInput::System`].
pub trait SystemResource {
    /// Produce an instance of this resource from only the implicit system context.
    fn generate() -> Self;
}

impl SystemResource for Instant {
    fn generate() -> Self {
        Instant::now()
    }
}

/// A [`StateMachine`](super::StateMachine) input wrapper for providing [`SystemResource`] to the
/// state machine. `System` updates the machine's view of the resource (e.g. the clock) and
/// `Input` carries the actual event.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemInput<I, S> {
    Input(I),
    System(S),
}
