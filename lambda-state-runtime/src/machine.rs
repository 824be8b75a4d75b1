//! The lifecycle state machine of the runtime.
//!
//! A pure transition function over lifecycle events: the machine performs
//! no I/O and holds no timers. The runtime loop feeds it one event at a
//! time and executes the single action each step returns. Every legal
//! transition is written out below; any other `(state, event)` pair is a
//! protocol violation, which is a bug in the loop, not a runtime condition,
//! and aborts the process.

use crate::diagnostic::ErrorEnvelope;
use crate::types::{Invocation, InvocationOutcome};
use std::mem;

pub(crate) struct StateMachine<H> {
    state: State<H>,
    max_invocations: u64,
    invocation_count: u64,
    shutdown_marked: bool,
}

enum State<H> {
    /// Only entry point; nothing has happened yet.
    Initialized,
    /// Connection attempt and handler construction run concurrently; both
    /// must complete, in either order, before the runtime can advance.
    Starting {
        handler: Option<Result<H, ErrorEnvelope>>,
        connected: bool,
    },
    /// Handler and connection ready; the startup-success notification is
    /// still pending.
    Started { handler: H },
    Running {
        handler: H,
        invocation: InvocationState,
    },
    /// Handler construction failed; the init error report is in flight.
    ReportingInitError { error: ErrorEnvelope },
    /// The init error has been acknowledged; waiting for the failure
    /// notification before closing.
    ReportingInitErrorToChannel,
    ShuttingDown,
    Shutdown,
    /// Transient placeholder while a step is in progress.
    Transitioning,
}

#[derive(Debug)]
enum InvocationState {
    WaitingForNext,
    Handling { request_id: String },
    ReportingResult,
}

impl<H> State<H> {
    fn name(&self) -> &'static str {
        match self {
            State::Initialized => "Initialized",
            State::Starting { .. } => "Starting",
            State::Started { .. } => "Started",
            State::Running {
                invocation: InvocationState::WaitingForNext,
                ..
            } => "Running(WaitingForNext)",
            State::Running {
                invocation: InvocationState::Handling { .. },
                ..
            } => "Running(Handling)",
            State::Running {
                invocation: InvocationState::ReportingResult,
                ..
            } => "Running(ReportingResult)",
            State::ReportingInitError { .. } => "ReportingInitError",
            State::ReportingInitErrorToChannel => "ReportingInitErrorToChannel",
            State::ShuttingDown => "ShuttingDown",
            State::Shutdown => "Shutdown",
            State::Transitioning => "Transitioning",
        }
    }
}

/// Lifecycle events fed to the machine by the runtime loop.
pub(crate) enum Event<H> {
    Connect,
    Connected,
    HandlerInitialized(H),
    HandlerFailedToInitialize(ErrorEnvelope),
    StartupReported,
    StartupFailureReported,
    NextReceived(Invocation),
    InvocationCompleted(InvocationOutcome),
    AcceptedReceived,
    CloseRequested,
    ChannelInactive,
    TransportError,
}

impl<H> Event<H> {
    fn name(&self) -> &'static str {
        match self {
            Event::Connect => "Connect",
            Event::Connected => "Connected",
            Event::HandlerInitialized(_) => "HandlerInitialized",
            Event::HandlerFailedToInitialize(_) => "HandlerFailedToInitialize",
            Event::StartupReported => "StartupReported",
            Event::StartupFailureReported => "StartupFailureReported",
            Event::NextReceived(_) => "NextReceived",
            Event::InvocationCompleted(_) => "InvocationCompleted",
            Event::AcceptedReceived => "AcceptedReceived",
            Event::CloseRequested => "CloseRequested",
            Event::ChannelInactive => "ChannelInactive",
            Event::TransportError => "TransportError",
        }
    }
}

/// Side effects the runtime loop must execute after a step.
#[derive(Debug)]
pub(crate) enum Action {
    /// Begin the connection attempt and handler construction.
    Connect,
    FireStartupSuccess,
    FireStartupFailure(ErrorEnvelope),
    /// Issue the `/next` long poll.
    GetNext,
    /// Dispatch the invocation to the handler.
    InvokeHandler { invocation: Invocation, count: u64 },
    /// Post the invocation's result or error.
    ReportInvocationResult {
        request_id: String,
        outcome: InvocationOutcome,
    },
    /// Post the envelope to `/runtime/init/error`.
    ReportInitializationError(ErrorEnvelope),
    CloseConnection,
    FireChannelInactive,
    /// Nothing to do; another event will move things along.
    Wait,
}

impl<H> StateMachine<H> {
    pub(crate) fn new(max_invocations: u64) -> Self {
        StateMachine {
            state: State::Initialized,
            max_invocations,
            invocation_count: 0,
            shutdown_marked: false,
        }
    }

    /// Apply one event and return the action the loop must execute.
    pub(crate) fn step(&mut self, event: Event<H>) -> Action {
        use InvocationState::*;

        let state = mem::replace(&mut self.state, State::Transitioning);
        let (next, action) = match (state, event) {
            (State::Initialized, Event::Connect) => (
                State::Starting {
                    handler: None,
                    connected: false,
                },
                Action::Connect,
            ),

            // Startup: the two completions arrive in either order.
            (
                State::Starting {
                    handler: None,
                    connected: false,
                },
                Event::Connected,
            ) => (
                State::Starting {
                    handler: None,
                    connected: true,
                },
                Action::Wait,
            ),
            (
                State::Starting {
                    handler: Some(Ok(handler)),
                    connected: false,
                },
                Event::Connected,
            ) => (State::Started { handler }, Action::FireStartupSuccess),
            (
                State::Starting {
                    handler: Some(Err(error)),
                    connected: false,
                },
                Event::Connected,
            ) => (
                State::ReportingInitError {
                    error: error.clone(),
                },
                Action::ReportInitializationError(error),
            ),
            (
                State::Starting {
                    handler: None,
                    connected,
                },
                Event::HandlerInitialized(handler),
            ) => {
                if connected {
                    (State::Started { handler }, Action::FireStartupSuccess)
                } else {
                    (
                        State::Starting {
                            handler: Some(Ok(handler)),
                            connected: false,
                        },
                        Action::Wait,
                    )
                }
            }
            (
                State::Starting {
                    handler: None,
                    connected,
                },
                Event::HandlerFailedToInitialize(error),
            ) => {
                if connected {
                    (
                        State::ReportingInitError {
                            error: error.clone(),
                        },
                        Action::ReportInitializationError(error),
                    )
                } else {
                    (
                        State::Starting {
                            handler: Some(Err(error)),
                            connected: false,
                        },
                        Action::Wait,
                    )
                }
            }
            // The connection attempt failed, or the server hung up before
            // startup finished. There is nothing left to report to.
            (State::Starting { .. }, Event::TransportError)
            | (State::Starting { .. }, Event::ChannelInactive) => (State::Shutdown, Action::Wait),

            (State::Started { handler }, Event::StartupReported) => (
                State::Running {
                    handler,
                    invocation: WaitingForNext,
                },
                Action::GetNext,
            ),

            // The invocation cycle.
            (
                State::Running {
                    handler,
                    invocation: WaitingForNext,
                },
                Event::NextReceived(invocation),
            ) => {
                self.invocation_count += 1;
                let request_id = invocation.request_id.clone();
                (
                    State::Running {
                        handler,
                        invocation: Handling { request_id },
                    },
                    Action::InvokeHandler {
                        invocation,
                        count: self.invocation_count,
                    },
                )
            }
            (
                State::Running {
                    handler,
                    invocation: Handling { request_id },
                },
                Event::InvocationCompleted(outcome),
            ) => (
                State::Running {
                    handler,
                    invocation: ReportingResult,
                },
                Action::ReportInvocationResult { request_id, outcome },
            ),
            (
                State::Running {
                    handler,
                    invocation: ReportingResult,
                },
                Event::AcceptedReceived,
            ) => {
                if self.shutdown_marked
                    || (self.max_invocations > 0 && self.invocation_count >= self.max_invocations)
                {
                    (State::ShuttingDown, Action::CloseConnection)
                } else {
                    (
                        State::Running {
                            handler,
                            invocation: WaitingForNext,
                        },
                        Action::GetNext,
                    )
                }
            }

            // Graceful shutdown requests.
            (
                State::Running {
                    invocation: WaitingForNext,
                    ..
                },
                Event::CloseRequested,
            ) => (State::ShuttingDown, Action::CloseConnection),
            (State::Running { handler, invocation }, Event::CloseRequested) => {
                // An invocation is in flight; let it finish and report.
                // The shutdown is picked up at the next acknowledgement.
                self.shutdown_marked = true;
                (State::Running { handler, invocation }, Action::Wait)
            }

            // Init failure reporting.
            (State::ReportingInitError { error }, Event::AcceptedReceived) => (
                State::ReportingInitErrorToChannel,
                Action::FireStartupFailure(error),
            ),
            (State::ReportingInitErrorToChannel, Event::StartupFailureReported) => {
                (State::ShuttingDown, Action::CloseConnection)
            }

            // Connection teardown.
            (State::ShuttingDown, Event::ChannelInactive)
            | (State::Running { .. }, Event::ChannelInactive)
            | (State::ReportingInitError { .. }, Event::ChannelInactive)
            | (State::ReportingInitErrorToChannel, Event::ChannelInactive) => {
                (State::Shutdown, Action::FireChannelInactive)
            }
            (State::Running { .. }, Event::TransportError)
            | (State::ReportingInitError { .. }, Event::TransportError)
            | (State::ReportingInitErrorToChannel, Event::TransportError) => {
                (State::ShuttingDown, Action::CloseConnection)
            }
            (State::ShuttingDown, Event::TransportError) => (State::ShuttingDown, Action::Wait),

            (state, event) => panic!(
                "runtime state machine: protocol violation, {} received in state {}",
                event.name(),
                state.name()
            ),
        };
        self.state = next;
        action
    }

    /// The handler, once the machine holds one. Panics outside of
    /// `Started`/`Running`; calling it there is a protocol violation.
    pub(crate) fn handler_mut(&mut self) -> &mut H {
        match &mut self.state {
            State::Started { handler } | State::Running { handler, .. } => handler,
            state => panic!(
                "runtime state machine: no handler available in state {}",
                state.name()
            ),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        matches!(self.state, State::Shutdown)
    }

    /// Whether a `CloseRequested` event is legal right now. The loop holds
    /// signal deliveries back until this is true.
    pub(crate) fn accepts_close_request(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Whether the machine is waiting on a `/next` reply.
    pub(crate) fn awaiting_next_reply(&self) -> bool {
        matches!(
            self.state,
            State::Running {
                invocation: InvocationState::WaitingForNext,
                ..
            }
        )
    }

    /// Whether a server hangup in the current state is part of a normal
    /// lifecycle. Anywhere else it is an unexpected hangup the loop must
    /// surface as a transport failure.
    pub(crate) fn hangup_expected(&self) -> bool {
        matches!(
            self.state,
            State::ShuttingDown
                | State::Running {
                    invocation: InvocationState::WaitingForNext,
                    ..
                }
                | State::ReportingInitError { .. }
                | State::ReportingInitErrorToChannel
        )
    }

    /// Force the next acknowledgement to close the connection. Used when
    /// the control plane rejects an exchange.
    pub(crate) fn mark_shutdown(&mut self) {
        self.shutdown_marked = true;
    }

    pub(crate) fn invocation_count(&self) -> u64 {
        self.invocation_count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    type Machine = StateMachine<&'static str>;

    fn invocation(request_id: &str) -> Invocation {
        Invocation {
            request_id: request_id.to_owned(),
            deadline_ms: 10_000,
            invoked_function_arn: "arn:aws:lambda:us-east-2:123456789012:function:fn".into(),
            trace_id: "Root=1-5bef4de7".into(),
            client_context: None,
            cognito_identity: None,
            payload: Bytes::from_static(b"ping"),
        }
    }

    /// Drive a fresh machine to `Running(WaitingForNext)`.
    fn started(max_invocations: u64) -> Machine {
        let mut machine = Machine::new(max_invocations);
        assert!(matches!(machine.step(Event::Connect), Action::Connect));
        assert!(matches!(machine.step(Event::Connected), Action::Wait));
        assert!(matches!(
            machine.step(Event::HandlerInitialized("handler")),
            Action::FireStartupSuccess
        ));
        assert!(matches!(machine.step(Event::StartupReported), Action::GetNext));
        machine
    }

    #[test]
    fn startup_accepts_completions_in_either_order() {
        let mut machine = Machine::new(0);
        machine.step(Event::Connect);
        assert!(matches!(
            machine.step(Event::HandlerInitialized("handler")),
            Action::Wait
        ));
        assert!(matches!(machine.step(Event::Connected), Action::FireStartupSuccess));
        assert_eq!(*machine.handler_mut(), "handler");
    }

    #[test]
    fn happy_path_two_invocations_then_close() {
        let mut machine = started(2);

        for (id, expected_count) in [("A", 1), ("B", 2)] {
            match machine.step(Event::NextReceived(invocation(id))) {
                Action::InvokeHandler { invocation, count } => {
                    assert_eq!(invocation.request_id, id);
                    assert_eq!(count, expected_count);
                }
                other => panic!("expected InvokeHandler, got {other:?}"),
            }
            match machine.step(Event::InvocationCompleted(InvocationOutcome::Response(
                Bytes::from_static(b"pong"),
            ))) {
                Action::ReportInvocationResult { request_id, .. } => assert_eq!(request_id, id),
                other => panic!("expected ReportInvocationResult, got {other:?}"),
            }
            let action = machine.step(Event::AcceptedReceived);
            if expected_count < 2 {
                assert!(matches!(action, Action::GetNext));
            } else {
                assert!(matches!(action, Action::CloseConnection));
            }
        }

        assert!(matches!(
            machine.step(Event::ChannelInactive),
            Action::FireChannelInactive
        ));
        assert!(machine.is_shutdown());
        assert_eq!(machine.invocation_count(), 2);
    }

    #[test]
    fn init_failure_reports_on_the_init_endpoint() {
        let mut machine = Machine::new(0);
        machine.step(Event::Connect);
        assert!(matches!(
            machine.step(Event::HandlerFailedToInitialize(ErrorEnvelope::unhandled("E"))),
            Action::Wait
        ));
        match machine.step(Event::Connected) {
            Action::ReportInitializationError(envelope) => {
                assert_eq!(envelope.error_type, "Unhandled Error");
                assert_eq!(envelope.error_message, "E");
            }
            other => panic!("expected ReportInitializationError, got {other:?}"),
        }
        assert!(matches!(
            machine.step(Event::AcceptedReceived),
            Action::FireStartupFailure(_)
        ));
        assert!(matches!(
            machine.step(Event::StartupFailureReported),
            Action::CloseConnection
        ));
        assert!(matches!(
            machine.step(Event::ChannelInactive),
            Action::FireChannelInactive
        ));
        assert!(machine.is_shutdown());
    }

    #[test]
    fn init_failure_after_connection_reports_immediately() {
        let mut machine = Machine::new(0);
        machine.step(Event::Connect);
        machine.step(Event::Connected);
        assert!(matches!(
            machine.step(Event::HandlerFailedToInitialize(ErrorEnvelope::unhandled("E"))),
            Action::ReportInitializationError(_)
        ));
    }

    #[test]
    fn invocation_error_keeps_the_loop_alive() {
        let mut machine = started(0);
        machine.step(Event::NextReceived(invocation("X")));
        match machine.step(Event::InvocationCompleted(InvocationOutcome::Fault(
            ErrorEnvelope::unhandled("E"),
        ))) {
            Action::ReportInvocationResult { request_id, outcome } => {
                assert_eq!(request_id, "X");
                assert!(matches!(outcome, InvocationOutcome::Fault(_)));
            }
            other => panic!("expected ReportInvocationResult, got {other:?}"),
        }
        assert!(matches!(machine.step(Event::AcceptedReceived), Action::GetNext));
    }

    #[test]
    fn close_while_idle_shuts_down() {
        let mut machine = started(0);
        assert!(machine.accepts_close_request());
        assert!(matches!(
            machine.step(Event::CloseRequested),
            Action::CloseConnection
        ));
        assert!(matches!(
            machine.step(Event::ChannelInactive),
            Action::FireChannelInactive
        ));
        assert!(machine.is_shutdown());
    }

    #[test]
    fn close_mid_invocation_defers_until_acknowledged() {
        let mut machine = started(0);
        machine.step(Event::NextReceived(invocation("Y")));
        // Signal arrives while the handler runs; the invocation finishes
        // and reports before the connection closes.
        assert!(matches!(machine.step(Event::CloseRequested), Action::Wait));
        assert!(matches!(
            machine.step(Event::InvocationCompleted(InvocationOutcome::Response(
                Bytes::new()
            ))),
            Action::ReportInvocationResult { .. }
        ));
        assert!(matches!(
            machine.step(Event::AcceptedReceived),
            Action::CloseConnection
        ));
        assert!(matches!(
            machine.step(Event::ChannelInactive),
            Action::FireChannelInactive
        ));
        assert!(machine.is_shutdown());
    }

    #[test]
    fn bounded_invocations_close_after_the_last_acknowledgement() {
        let mut machine = started(1);
        machine.step(Event::NextReceived(invocation("A")));
        machine.step(Event::InvocationCompleted(InvocationOutcome::Response(Bytes::new())));
        assert!(matches!(
            machine.step(Event::AcceptedReceived),
            Action::CloseConnection
        ));
    }

    #[test]
    fn transport_error_while_running_closes_the_connection() {
        let mut machine = started(0);
        machine.step(Event::NextReceived(invocation("A")));
        assert!(matches!(
            machine.step(Event::TransportError),
            Action::CloseConnection
        ));
        assert!(matches!(
            machine.step(Event::ChannelInactive),
            Action::FireChannelInactive
        ));
        assert!(machine.is_shutdown());
    }

    #[test]
    fn hangup_while_idle_is_part_of_the_lifecycle() {
        let mut machine = started(0);
        assert!(machine.hangup_expected());
        assert!(matches!(
            machine.step(Event::ChannelInactive),
            Action::FireChannelInactive
        ));
        assert!(machine.is_shutdown());
    }

    #[test]
    fn hangup_mid_invocation_is_not_expected() {
        let mut machine = started(0);
        machine.step(Event::NextReceived(invocation("A")));
        assert!(!machine.hangup_expected());
        // The machine still winds down; the loop records the failure.
        assert!(matches!(
            machine.step(Event::ChannelInactive),
            Action::FireChannelInactive
        ));
        assert!(machine.is_shutdown());
    }

    #[test]
    fn marked_shutdown_closes_at_the_next_acknowledgement() {
        let mut machine = started(0);
        machine.step(Event::NextReceived(invocation("A")));
        machine.step(Event::InvocationCompleted(InvocationOutcome::Response(Bytes::new())));
        machine.mark_shutdown();
        assert!(matches!(
            machine.step(Event::AcceptedReceived),
            Action::CloseConnection
        ));
    }

    #[test]
    fn identical_cycles_produce_identical_actions() {
        let mut machine = started(0);
        let mut kinds = Vec::new();
        for _ in 0..2 {
            let a = machine.step(Event::NextReceived(invocation("A")));
            let b = machine.step(Event::InvocationCompleted(InvocationOutcome::Response(
                Bytes::from_static(b"pong"),
            )));
            let c = machine.step(Event::AcceptedReceived);
            kinds.push((
                matches!(a, Action::InvokeHandler { .. }),
                matches!(b, Action::ReportInvocationResult { .. }),
                matches!(c, Action::GetNext),
            ));
        }
        assert_eq!(kinds[0], kinds[1]);
        assert_eq!(kinds[0], (true, true, true));
    }

    #[test]
    fn invocation_count_tracks_dispatches() {
        let mut machine = started(0);
        assert_eq!(machine.invocation_count(), 0);
        for expected in 1..=3u64 {
            machine.step(Event::NextReceived(invocation("A")));
            assert_eq!(machine.invocation_count(), expected);
            machine.step(Event::InvocationCompleted(InvocationOutcome::Response(Bytes::new())));
            machine.step(Event::AcceptedReceived);
        }
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn unexpected_event_is_a_protocol_violation() {
        let mut machine = Machine::new(0);
        machine.step(Event::AcceptedReceived);
    }

    #[test]
    #[should_panic(expected = "no handler available")]
    fn handler_access_before_startup_is_a_protocol_violation() {
        let mut machine = Machine::new(0);
        machine.handler_mut();
    }
}
