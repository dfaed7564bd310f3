//! The Upper Layer state machine (DICOM PS3.8 Annex B).
//!
//! [`process_event`] is a pure `(state, event) -> (state, action)` function,
//! independent of any socket or I/O. [`StateMachine`] wraps it behind a
//! mutex so the same machine can be driven safely from more than one
//! thread (an association's read loop and its write path, in practice).

use std::sync::Mutex;

use snafu::Snafu;

/// A state of the Upper Layer state machine.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum State {
    /// Sta1: idle, no transport connection.
    Sta1,
    /// Sta2: transport connection open, awaiting A-ASSOCIATE-RQ.
    Sta2,
    /// Sta3: A-ASSOCIATE-RQ received, awaiting local accept/reject.
    Sta3,
    /// Sta4: awaiting transport connection opening.
    Sta4,
    /// Sta5: A-ASSOCIATE-RQ sent, awaiting A-ASSOCIATE-AC/RJ.
    Sta5,
    /// Sta6: association established, data transfer allowed.
    Sta6,
    /// Sta7: A-RELEASE-RQ sent, awaiting A-RELEASE-RP.
    Sta7,
    /// Sta8: A-RELEASE-RQ received, awaiting local release response.
    Sta8,
    /// Sta13: awaiting transport close after abort or release collision.
    Sta13,
}

/// An event fed into the state machine.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum Event {
    /// AE-1: transport connection confirmed (requester side).
    TransportConnectConfirmation,
    /// AE-2: transport connection indication (acceptor side).
    TransportConnectIndication,
    /// AE-3: local request to establish an association.
    AssociateRequest,
    /// AE-4: local decision to accept a pending A-ASSOCIATE-RQ.
    AssociateAccept,
    /// AE-5: local decision to reject a pending A-ASSOCIATE-RQ.
    AssociateReject,
    /// AE-6: A-ASSOCIATE-AC received.
    AssociateAcReceived,
    /// AE-7: A-ASSOCIATE-RJ received.
    AssociateRjReceived,
    /// AE-8: A-ASSOCIATE-RQ received.
    AssociateRqReceived,
    /// AE-9: local P-DATA request.
    DataRequest,
    /// AE-10: P-DATA-TF received.
    DataReceived,
    /// AE-11: local release request.
    ReleaseRequest,
    /// AE-12: A-RELEASE-RQ received.
    ReleaseRqReceived,
    /// AE-13: A-RELEASE-RP received.
    ReleaseRpReceived,
    /// AE-14: local release response.
    ReleaseResponse,
    /// AE-15: local abort request.
    AbortRequest,
    /// AE-16: A-ABORT received.
    AbortReceived,
    /// AE-17: transport connection closed.
    TransportClosed,
    /// AE-18: ARTIM timer expired while awaiting A-RELEASE-RP.
    ArtimTimerExpired,
    /// AE-19: an invalid or undecodable PDU was received.
    InvalidPduReceived,
}

/// An action emitted as a consequence of a state transition.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum Action {
    SendAssociateRQ,
    IssueAssociateIndication,
    SendAssociateAC,
    IssueAssociateConfirmation,
    SendData,
    IssueDataIndication,
    SendReleaseRQ,
    IssueReleaseIndication,
    SendReleaseRP,
    CloseTransport,
    SendAbort,
    /// No externally visible effect; the state did not change.
    None,
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("event {:?} is not valid in state {:?}", event, state))]
    InvalidTransition { state: State, event: Event },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Apply `event` to `state`, returning the next state and the action to
/// perform. The function never panics; an event that has no defined
/// transition for the given state is an [`Error::InvalidTransition`] and
/// the caller's state is left unchanged.
pub fn process_event(state: State, event: Event) -> Result<(State, Action)> {
    use Action as A;
    use Event as E;
    use State as S;

    // Global transitions, valid from any association-bearing state.
    if state != S::Sta1 {
        match event {
            E::AbortRequest => return Ok((S::Sta13, A::SendAbort)),
            E::AbortReceived => return Ok((S::Sta1, A::CloseTransport)),
            E::InvalidPduReceived => return Ok((S::Sta13, A::SendAbort)),
            _ => {}
        }
    }
    if state == S::Sta7 && event == E::ArtimTimerExpired {
        return Ok((S::Sta13, A::SendAbort));
    }

    match (state, event) {
        (S::Sta1, E::TransportConnectConfirmation) => Ok((S::Sta4, A::None)),
        (S::Sta1, E::TransportConnectIndication) => Ok((S::Sta2, A::None)),
        (S::Sta1, E::AssociateRequest) => Ok((S::Sta4, A::SendAssociateRQ)),

        (S::Sta2, E::AssociateRqReceived) => Ok((S::Sta3, A::IssueAssociateIndication)),

        (S::Sta3, E::AssociateAccept) => Ok((S::Sta6, A::SendAssociateAC)),
        (S::Sta3, E::AssociateReject) => Ok((S::Sta13, A::None)),

        (S::Sta4, E::TransportConnectConfirmation) => Ok((S::Sta5, A::SendAssociateRQ)),
        (S::Sta4, E::AssociateRequest) => Ok((S::Sta5, A::SendAssociateRQ)),

        (S::Sta5, E::AssociateAcReceived) => Ok((S::Sta6, A::IssueAssociateConfirmation)),
        (S::Sta5, E::AssociateRjReceived) => Ok((S::Sta1, A::None)),

        (S::Sta6, E::DataRequest) => Ok((S::Sta6, A::SendData)),
        (S::Sta6, E::DataReceived) => Ok((S::Sta6, A::IssueDataIndication)),
        (S::Sta6, E::ReleaseRequest) => Ok((S::Sta7, A::SendReleaseRQ)),
        (S::Sta6, E::ReleaseRqReceived) => Ok((S::Sta8, A::IssueReleaseIndication)),

        (S::Sta7, E::ReleaseRpReceived) => Ok((S::Sta1, A::CloseTransport)),
        // Release collision: both sides requested release at once.
        (S::Sta7, E::ReleaseRqReceived) => Ok((S::Sta7, A::SendReleaseRP)),

        (S::Sta8, E::ReleaseResponse) => Ok((S::Sta13, A::SendReleaseRP)),

        (S::Sta13, E::TransportClosed) => Ok((S::Sta1, A::None)),

        (state, event) => Err(Error::InvalidTransition { state, event }),
    }
}

/// A mutex-guarded [`process_event`], safe to drive from multiple threads.
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<State>,
}

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine::new()
    }
}

impl StateMachine {
    /// Build a new state machine starting at `Sta1`.
    pub fn new() -> Self {
        StateMachine {
            state: Mutex::new(State::Sta1),
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        *self.state.lock().expect("state machine mutex poisoned")
    }

    /// Drive `event` through the machine, returning the action to
    /// perform. On an invalid transition the state is left unchanged.
    pub fn process_event(&self, event: Event) -> Result<Action> {
        let mut guard = self.state.lock().expect("state machine mutex poisoned");
        let (next, action) = process_event(*guard, event)?;
        *guard = next;
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn full_requester_happy_path() {
        let sm = StateMachine::new();
        assert_eq!(sm.state(), State::Sta1);
        assert_eq!(
            sm.process_event(Event::AssociateRequest).unwrap(),
            Action::SendAssociateRQ
        );
        assert_eq!(sm.state(), State::Sta4);
        assert_eq!(
            sm.process_event(Event::TransportConnectConfirmation)
                .unwrap(),
            Action::SendAssociateRQ
        );
        assert_eq!(sm.state(), State::Sta5);
        assert_eq!(
            sm.process_event(Event::AssociateAcReceived).unwrap(),
            Action::IssueAssociateConfirmation
        );
        assert_eq!(sm.state(), State::Sta6);
        assert_eq!(
            sm.process_event(Event::ReleaseRequest).unwrap(),
            Action::SendReleaseRQ
        );
        assert_eq!(sm.state(), State::Sta7);
        assert_eq!(
            sm.process_event(Event::ReleaseRpReceived).unwrap(),
            Action::CloseTransport
        );
        assert_eq!(sm.state(), State::Sta1);
    }

    #[test]
    fn full_acceptor_happy_path() {
        let sm = StateMachine::new();
        sm.process_event(Event::TransportConnectIndication).unwrap();
        assert_eq!(sm.state(), State::Sta2);
        sm.process_event(Event::AssociateRqReceived).unwrap();
        assert_eq!(sm.state(), State::Sta3);
        assert_eq!(
            sm.process_event(Event::AssociateAccept).unwrap(),
            Action::SendAssociateAC
        );
        assert_eq!(sm.state(), State::Sta6);
        sm.process_event(Event::ReleaseRqReceived).unwrap();
        assert_eq!(sm.state(), State::Sta8);
        assert_eq!(
            sm.process_event(Event::ReleaseResponse).unwrap(),
            Action::SendReleaseRP
        );
        assert_eq!(sm.state(), State::Sta13);
        sm.process_event(Event::TransportClosed).unwrap();
        assert_eq!(sm.state(), State::Sta1);
    }

    #[test]
    fn invalid_pdu_aborts_from_established() {
        let sm = StateMachine::new();
        sm.process_event(Event::TransportConnectIndication).unwrap();
        sm.process_event(Event::AssociateRqReceived).unwrap();
        sm.process_event(Event::AssociateAccept).unwrap();
        assert_eq!(sm.state(), State::Sta6);
        assert_eq!(
            sm.process_event(Event::InvalidPduReceived).unwrap(),
            Action::SendAbort
        );
        assert_eq!(sm.state(), State::Sta13);
    }

    #[test]
    fn artim_timeout_only_valid_in_sta7() {
        let sm = StateMachine::new();
        assert!(sm.process_event(Event::ArtimTimerExpired).is_err());
        assert_eq!(sm.state(), State::Sta1);
    }

    #[test]
    fn invalid_transition_leaves_state_unchanged() {
        let sm = StateMachine::new();
        assert!(sm.process_event(Event::DataRequest).is_err());
        assert_eq!(sm.state(), State::Sta1);
    }

    #[test]
    fn concurrent_events_reach_a_valid_state() {
        let sm = Arc::new(StateMachine::new());
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let sm = Arc::clone(&sm);
                thread::spawn(move || {
                    let _ = sm.process_event(Event::AssociateRequest);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let valid = matches!(
            sm.state(),
            State::Sta1
                | State::Sta2
                | State::Sta3
                | State::Sta4
                | State::Sta5
                | State::Sta6
                | State::Sta7
                | State::Sta8
                | State::Sta13
        );
        assert!(valid);
    }
}
