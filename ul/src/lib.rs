//! Types and methods for interacting with DICOM nodes through the
//! DICOM Upper Layer protocol (PS3.8).
//!
//! - [`pdu`] holds the wire-level protocol data units and their codec.
//! - [`fsm`] is the Upper Layer state machine, a pure function from
//!   `(state, event)` to `(state, action)`.
//! - [`connection`] pairs a TCP stream with a state machine, read/write
//!   deadlines and a negotiated max-PDU-length.
//! - [`association`] builds on `connection` to establish, negotiate and
//!   tear down associations from either side.

pub mod association;
pub mod connection;
pub mod fsm;
pub mod pdu;

/// The implementation class UID this crate advertises during
/// association negotiation (PS3.5 Annex B.2).
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.8.4321.1";

/// The implementation version name this crate advertises.
pub const IMPLEMENTATION_VERSION_NAME: &str = "CRATE_UL_010";

pub use association::{Association, ClientAssociationOptions, ServerAssociationOptions};
pub use connection::Connection;
pub use pdu::{read_pdu, write_pdu, AeTitle, Pdu};
