//! A transport connection carrying the Upper Layer state machine.

use std::io::{self, ErrorKind};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::fsm::{self, Action, Event, StateMachine};
use crate::pdu::{read_pdu, write_pdu, reader, writer, Pdu, MAX_PDU_LENGTH};

/// The default read/write deadline applied to every PDU exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not set socket timeout"))]
    SetTimeout { source: io::Error },

    #[snafu(display("could not read PDU"))]
    Read { source: reader::Error },

    #[snafu(display("could not write PDU"))]
    Write { source: writer::Error },

    #[snafu(display("could not flush socket"))]
    Flush { source: io::Error },

    #[snafu(display("the connection is not in a valid state for this operation"))]
    InvalidState { source: fsm::Error },

    #[snafu(display("peer closed the connection"))]
    Closed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A DICOM Upper Layer transport connection: a TCP stream paired with its
/// own state machine, read/write deadlines, and a current max-PDU-length
/// that can only ever be lowered from [`MAX_PDU_LENGTH`].
pub struct Connection {
    stream: TcpStream,
    write_lock: Mutex<()>,
    state_machine: StateMachine,
    max_pdu_length: u32,
}

impl Connection {
    /// Wrap an already-connected stream. `max_pdu_length` is clamped to
    /// the protocol ceiling.
    pub fn new(stream: TcpStream, max_pdu_length: u32) -> Result<Self> {
        stream
            .set_read_timeout(Some(DEFAULT_TIMEOUT))
            .context(SetTimeoutSnafu)?;
        stream
            .set_write_timeout(Some(DEFAULT_TIMEOUT))
            .context(SetTimeoutSnafu)?;
        Ok(Connection {
            stream,
            write_lock: Mutex::new(()),
            state_machine: StateMachine::new(),
            max_pdu_length: max_pdu_length.min(MAX_PDU_LENGTH),
        })
    }

    /// Override the default read/write deadlines.
    pub fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(read).context(SetTimeoutSnafu)?;
        self.stream.set_write_timeout(write).context(SetTimeoutSnafu)?;
        Ok(())
    }

    /// Lower the current max-PDU-length. Attempting to raise it is a
    /// no-op: the ceiling only ever moves down, matching how a peer's
    /// advertised maximum is adopted during association negotiation.
    pub fn lower_max_pdu_length(&mut self, value: u32) {
        self.max_pdu_length = self.max_pdu_length.min(value);
    }

    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    pub fn state(&self) -> fsm::State {
        self.state_machine.state()
    }

    pub(crate) fn drive(&self, event: Event) -> Result<Action> {
        self.state_machine.process_event(event).context(InvalidStateSnafu)
    }

    /// Send a PDU, serialised against other writers on this connection.
    pub fn send_pdu(&self, pdu: &Pdu) -> Result<()> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut stream = &self.stream;
        write_pdu(&mut stream, pdu).context(WriteSnafu)?;
        debug!(pdu = pdu.short_description(), "sent PDU");
        Ok(())
    }

    /// Read the next PDU. On a clean EOF, drives AE-17 through the state
    /// machine and returns [`Error::Closed`].
    pub fn read_pdu(&self) -> Result<Pdu> {
        let mut stream = &self.stream;
        match read_pdu(&mut stream, self.max_pdu_length) {
            Ok(pdu) => {
                debug!(pdu = pdu.short_description(), "received PDU");
                Ok(pdu)
            }
            Err(reader::Error::NoPduAvailable { .. }) => {
                let _ = self.drive(Event::TransportClosed);
                Err(Error::Closed)
            }
            Err(source) => {
                warn!(%source, "invalid PDU received");
                let _ = self.drive(Event::InvalidPduReceived);
                let _ = self.send_pdu(&Pdu::Abort {
                    source: crate::pdu::AbortSource::ServiceProvider(
                        crate::pdu::AbortServiceProviderReason::UnexpectedPdu,
                    ),
                });
                Err(Error::Read { source })
            }
        }
    }

    /// Drive AE-17 and close the underlying socket.
    pub fn close(&self) -> Result<()> {
        let _ = self.drive(Event::TransportClosed);
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(source) => Err(Error::SetTimeout { source }),
        }
    }

    pub(crate) fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr())
            .field("state", &self.state())
            .field("max_pdu_length", &self.max_pdu_length)
            .finish()
    }
}
