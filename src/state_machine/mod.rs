//! Pure state machines used by the relay's runtime components.
//!
//! The relay keeps its decision logic (who is the drone's current peer, whether a crashed
//! transcoder may be restarted, which lifecycle transitions are legal) separate from the tasks
//! that own sockets and processes. The tasks are the runners: they read the clock, perform the
//! IO, and feed the observed facts into a [`StateMachine`] as input.

pub mod learning;
pub mod lifecycle;
pub mod restart;
pub mod system;

/// The [`StateMachine`] trait provides calling semantics and indicates the upholding of invariants
/// that guarantee deterministic behavior.
///
/// # Functionality
/// A machine consumes [`Input`](StateMachine::Input) values through
/// [`process_input`](StateMachine::process_input) and exposes results through
/// [`poll_output`](StateMachine::poll_output). Inputs and outputs are usually enums with one
/// variant per kind of event; the inherent impl of the machine holds the actual logic and the
/// trait impl only maps variants onto it.
///
/// # Invariants
/// Implementors *must* be pure so that every decision can be replayed in a unit test:
///
/// * **No interior mutability.** State changes only through `&mut self`; no [`std::cell`],
///   [`std::sync`] locks, or reference counted pointers.
/// * **No IO.** No sockets, files, or processes. This includes the system clock and system
///   entropy: time is provided through input, typically by wrapping the input in
///   [`SystemInput`](system::SystemInput).
/// * **No concurrency and no async.** A machine never spawns, awaits, or blocks. Runners may call
///   it from async code while holding a short critical section, never across an `.await`.
///
/// Logging through `tracing` is an allowed side effect as long as the machine's logic never
/// depends on it.
///
/// # Example
/// ```ignore
/// let mut learner = PeerLearner::new(&learning_config);
///
/// learner.process_input(SystemInput::System(Instant::generate()));
/// learner.process_input(SystemInput::Input(LearnerInput::Observed(source)));
///
/// if let Some(LearnOutcome::Learned { addr, .. }) = learner.poll_output() {
///     info!(%addr, "Learned drone endpoint");
/// }
/// ```
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) by the state machine.
    type Output;

    /// Process the provided `input` into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
