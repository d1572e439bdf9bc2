//! Connection state machine for the live session
//!
//! This module implements the session lifecycle using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.
//!
//! Every connect attempt is tagged with a generation. Events carrying a
//! generation other than the current one are stale and change nothing.

use std::time::Duration;

use serde::Serialize;

use crate::reconnect::{ReconnectController, ReconnectDecision, ReconnectPolicy};

/// User-visible session status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Socket, handshake, or send failure. Retried silently.
    Transport,
    /// Microphone or speaker unavailable. Not retried.
    Device,
}

/// Why a connect attempt or a live transport failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Transport,
            message: message.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Device,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} fault: {}", self.kind, self.message)
    }
}

/// Authoritative session state. All transitions go through the reducer.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub status: ConnectionStatus,
    /// Strictly increasing; bumped whenever in-flight work must be invalidated.
    pub generation: u64,
    pub reconnect: ReconnectController,
    /// A `Connect` was issued and neither its link nor its failure has arrived.
    pub attempt_in_flight: bool,
    pub last_error: Option<String>,
}

impl State {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            generation: 0,
            reconnect: ReconnectController::new(policy),
            attempt_in_flight: false,
            last_error: None,
        }
    }

    /// The user wants to be connected (desired-connection intent).
    pub fn wants_connection(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected
        )
    }

    fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// User asked to start a conversation
    Start,
    /// User asked to stop
    Stop,
    /// Session manager is shutting down
    Exit,
    /// Devices acquired and transport set up for `generation`
    LinkReady { generation: u64 },
    /// A connect attempt failed before the link was ready
    ConnectFailed { generation: u64, fault: Fault },
    /// An open transport failed, closed, or announced it is going away
    TransportLost { generation: u64, reason: String },
    /// The reconnect timer armed with `token` expired
    ReconnectDue { token: u64 },
    /// Periodic context refresh. Only sent while the session is idle.
    RefreshDue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Acquire devices and dial a transport for `generation`
    Connect { generation: u64 },
    /// Make the ready link for `generation` the live one
    AdoptLink { generation: u64 },
    /// Close a link that arrived for a superseded generation
    ReleaseLink { generation: u64 },
    /// Close the live transport, stop capture, release playback and devices
    Teardown,
    ScheduleReconnect { token: u64, delay: Duration },
    CancelReconnect,
    /// Signal to publish the UI snapshot
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale generations
/// - Always emit EmitUi after visible changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use ConnectionStatus::*;
    use Effect::*;

    let mut next = state.clone();

    match event {
        Event::Start => match state.status {
            Disconnected | Error => {
                next.generation += 1;
                next.status = Connecting;
                next.last_error = None;
                next.reconnect.reset();
                next.attempt_in_flight = true;
                let generation = next.generation;
                (next, vec![CancelReconnect, Connect { generation }, EmitUi])
            }
            Connecting | Connected => (next, vec![]),
        },

        Event::Stop | Event::Exit => {
            next.generation += 1;
            next.status = Disconnected;
            next.last_error = None;
            next.reconnect.reset();
            next.attempt_in_flight = false;
            (next, vec![CancelReconnect, Teardown, EmitUi])
        }

        Event::LinkReady { generation }
            if state.is_current(generation) && state.wants_connection() =>
        {
            next.status = Connected;
            next.attempt_in_flight = false;
            next.reconnect.on_open();
            (
                next,
                vec![CancelReconnect, AdoptLink { generation }, EmitUi],
            )
        }
        // Stale or unwanted link: close it without touching anything visible
        Event::LinkReady { generation } => (next, vec![ReleaseLink { generation }]),

        Event::ConnectFailed { generation, fault }
            if state.is_current(generation) && state.wants_connection() =>
        {
            on_fault(next, fault)
        }
        Event::TransportLost { generation, reason }
            if state.is_current(generation) && state.wants_connection() =>
        {
            on_fault(next, Fault::transport(reason))
        }

        Event::ReconnectDue { token } if state.wants_connection() => {
            if !next.reconnect.fire(token) {
                return (next, vec![]);
            }
            next.generation += 1;
            next.attempt_in_flight = true;
            let generation = next.generation;
            (next, vec![Connect { generation }])
        }

        // Only an adopted link with no retry armed or dialing is rotated.
        Event::RefreshDue
            if state.status == Connected
                && !state.reconnect.is_armed()
                && !state.attempt_in_flight =>
        {
            next.generation += 1;
            next.attempt_in_flight = true;
            let generation = next.generation;
            (next, vec![Teardown, Connect { generation }])
        }

        // Stale failures, stray timers, refresh while not idle-connected
        _ => (next, vec![]),
    }
}

/// A current attempt failed while the user still wants a connection.
fn on_fault(mut next: State, fault: Fault) -> (State, Vec<Effect>) {
    use Effect::*;

    // Anything still running for the failed attempt is now stale.
    next.generation += 1;
    next.attempt_in_flight = false;

    let decision = match fault.kind {
        FaultKind::Device => ReconnectDecision::Exhausted {
            attempts: next.reconnect.attempts(),
        },
        FaultKind::Transport => next.reconnect.on_failure(),
    };

    match decision {
        ReconnectDecision::Retry { delay, .. } => {
            let token = next.generation;
            let mut effects = vec![Teardown];
            if next.reconnect.arm(token) {
                effects.push(ScheduleReconnect { token, delay });
            }
            (next, effects)
        }
        ReconnectDecision::Exhausted { .. } => {
            next.status = ConnectionStatus::Error;
            next.last_error = Some(fault.message);
            next.reconnect.reset();
            (next, vec![CancelReconnect, Teardown, EmitUi])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connecting() -> State {
        reduce(&State::default(), Event::Start).0
    }

    fn connected() -> State {
        let state = connecting();
        let generation = state.generation;
        reduce(&state, Event::LinkReady { generation }).0
    }

    fn lose(state: &State) -> (State, Vec<Effect>) {
        reduce(
            state,
            Event::TransportLost {
                generation: state.generation,
                reason: "socket closed".to_string(),
            },
        )
    }

    fn scheduled_token(effects: &[Effect]) -> Option<u64> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleReconnect { token, .. } => Some(*token),
            _ => None,
        })
    }

    #[test]
    fn start_from_disconnected_connects() {
        let (next, effects) = reduce(&State::default(), Event::Start);
        assert_eq!(next.status, ConnectionStatus::Connecting);
        assert!(next.wants_connection());
        assert!(effects.contains(&Effect::Connect {
            generation: next.generation
        }));
        assert!(effects.contains(&Effect::EmitUi));
    }

    #[test]
    fn start_while_connected_is_ignored() {
        let state = connected();
        let (next, effects) = reduce(&state, Event::Start);
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn link_ready_transitions_to_connected() {
        let state = connecting();
        let generation = state.generation;
        let (next, effects) = reduce(&state, Event::LinkReady { generation });
        assert_eq!(next.status, ConnectionStatus::Connected);
        assert!(effects.contains(&Effect::AdoptLink { generation }));
    }

    #[test]
    fn stale_link_is_released_without_regressing() {
        let state = connected();
        let stale = state.generation - 1;
        let (next, effects) = reduce(&state, Event::LinkReady { generation: stale });
        assert_eq!(next, state);
        assert_eq!(effects, vec![Effect::ReleaseLink { generation: stale }]);
    }

    #[test]
    fn stale_failure_is_ignored() {
        let state = connected();
        let (next, effects) = reduce(
            &state,
            Event::TransportLost {
                generation: state.generation - 1,
                reason: "old socket".to_string(),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn transport_loss_retries_silently() {
        let state = connected();
        let (next, effects) = lose(&state);

        // Status is unchanged, no UI emission
        assert_eq!(next.status, ConnectionStatus::Connected);
        assert!(!effects.contains(&Effect::EmitUi));
        assert!(effects.contains(&Effect::Teardown));
        assert!(next.generation > state.generation);
        assert_eq!(
            effects.last(),
            Some(&Effect::ScheduleReconnect {
                token: next.generation,
                delay: Duration::from_millis(600)
            })
        );
    }

    #[test]
    fn reconnect_due_starts_new_generation() {
        let (waiting, effects) = lose(&connected());
        let token = scheduled_token(&effects).unwrap();

        let (next, effects) = reduce(&waiting, Event::ReconnectDue { token });
        assert_eq!(
            effects,
            vec![Effect::Connect {
                generation: next.generation
            }]
        );
        assert!(!next.reconnect.is_armed());

        // Firing the same token twice does nothing
        let (again, effects) = reduce(&next, Event::ReconnectDue { token });
        assert_eq!(again, next);
        assert!(effects.is_empty());
    }

    #[test]
    fn eight_failures_escalate_on_the_eighth() {
        let mut state = connecting();
        for failure in 1..=8 {
            let (next, effects) = reduce(
                &state,
                Event::ConnectFailed {
                    generation: state.generation,
                    fault: Fault::transport("refused"),
                },
            );
            if failure < 8 {
                assert_eq!(next.status, ConnectionStatus::Connecting, "failure {}", failure);
                let token = scheduled_token(&effects).unwrap();
                state = reduce(&next, Event::ReconnectDue { token }).0;
            } else {
                assert_eq!(next.status, ConnectionStatus::Error);
                assert_eq!(next.last_error.as_deref(), Some("refused"));
                assert!(effects.contains(&Effect::Teardown));
                assert!(effects.contains(&Effect::EmitUi));
                state = next;
            }
        }
        assert!(!state.wants_connection());
    }

    #[test]
    fn backoff_resets_after_successful_open() {
        let (waiting, effects) = lose(&connected());
        let token = scheduled_token(&effects).unwrap();
        let (retrying, _) = reduce(&waiting, Event::ReconnectDue { token });
        assert_eq!(retrying.reconnect.attempts(), 1);

        let generation = retrying.generation;
        let (open, _) = reduce(&retrying, Event::LinkReady { generation });
        assert_eq!(open.reconnect.attempts(), 0);

        let (_, effects) = lose(&open);
        assert!(effects.contains(&Effect::ScheduleReconnect {
            token: open.generation + 1,
            delay: Duration::from_millis(600)
        }));
    }

    #[test]
    fn device_fault_escalates_immediately() {
        let state = connecting();
        let (next, effects) = reduce(
            &state,
            Event::ConnectFailed {
                generation: state.generation,
                fault: Fault::device("Microphone access denied"),
            },
        );
        assert_eq!(next.status, ConnectionStatus::Error);
        assert!(scheduled_token(&effects).is_none());
    }

    #[test]
    fn stop_from_any_state_disconnects() {
        for state in [State::default(), connecting(), connected(), lose(&connected()).0] {
            let (next, effects) = reduce(&state, Event::Stop);
            assert_eq!(next.status, ConnectionStatus::Disconnected);
            assert!(!next.reconnect.is_armed());
            assert!(effects.contains(&Effect::CancelReconnect));
            assert!(effects.contains(&Effect::Teardown));
        }
    }

    #[test]
    fn stop_invalidates_pending_timer_and_inflight_attempt() {
        let (waiting, effects) = lose(&connected());
        let token = scheduled_token(&effects).unwrap();
        let (stopped, _) = reduce(&waiting, Event::Stop);

        let (next, effects) = reduce(&stopped, Event::ReconnectDue { token });
        assert_eq!(next, stopped);
        assert!(effects.is_empty());

        let (next, effects) = reduce(
            &stopped,
            Event::LinkReady {
                generation: waiting.generation,
            },
        );
        assert_eq!(next.status, ConnectionStatus::Disconnected);
        assert_eq!(
            effects,
            vec![Effect::ReleaseLink {
                generation: waiting.generation
            }]
        );
    }

    #[test]
    fn error_state_restarts_and_stop_clears_it() {
        let state = connecting();
        let (failed, _) = reduce(
            &state,
            Event::ConnectFailed {
                generation: state.generation,
                fault: Fault::device("no mic"),
            },
        );
        let (restarted, _) = reduce(&failed, Event::Start);
        assert_eq!(restarted.status, ConnectionStatus::Connecting);
        assert!(restarted.last_error.is_none());

        let (stopped, _) = reduce(&failed, Event::Stop);
        assert_eq!(stopped.status, ConnectionStatus::Disconnected);
        assert!(stopped.last_error.is_none());
    }

    #[test]
    fn refresh_rotates_transport_only_when_connected() {
        let state = connected();
        let (next, effects) = reduce(&state, Event::RefreshDue);
        assert_eq!(next.status, ConnectionStatus::Connected);
        assert_eq!(
            effects,
            vec![
                Effect::Teardown,
                Effect::Connect {
                    generation: state.generation + 1
                }
            ]
        );

        let (_, effects) = reduce(&connecting(), Event::RefreshDue);
        assert!(effects.is_empty());

        // Not while a reconnect is already pending
        let (waiting, _) = lose(&connected());
        let (_, effects) = reduce(&waiting, Event::RefreshDue);
        assert!(effects.is_empty());
    }

    #[test]
    fn refresh_waits_for_inflight_reconnect_attempt() {
        let (waiting, effects) = lose(&connected());
        let token = scheduled_token(&effects).unwrap();
        let (dialing, effects) = reduce(&waiting, Event::ReconnectDue { token });
        assert_eq!(
            effects,
            vec![Effect::Connect {
                generation: dialing.generation
            }]
        );
        assert_eq!(dialing.status, ConnectionStatus::Connected);
        assert!(dialing.attempt_in_flight);
        assert!(!dialing.reconnect.is_armed());

        let (next, effects) = reduce(&dialing, Event::RefreshDue);
        assert_eq!(next, dialing);
        assert!(effects.is_empty());

        // Once the retried link is adopted the rotation is allowed again
        let generation = dialing.generation;
        let (adopted, _) = reduce(&dialing, Event::LinkReady { generation });
        assert!(!adopted.attempt_in_flight);
        let (_, effects) = reduce(&adopted, Event::RefreshDue);
        assert!(effects.contains(&Effect::Connect {
            generation: generation + 1
        }));
    }

    #[test]
    fn refresh_does_not_stack_rotations() {
        let (rotating, _) = reduce(&connected(), Event::RefreshDue);
        assert!(rotating.attempt_in_flight);
        let (next, effects) = reduce(&rotating, Event::RefreshDue);
        assert_eq!(next, rotating);
        assert!(effects.is_empty());
    }

    #[test]
    fn status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Disconnected).unwrap(),
            "\"DISCONNECTED\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Error).unwrap(),
            "\"ERROR\""
        );
    }
}
