//! Protocol data units of the DICOM Upper Layer protocol (DICOM PS3.8).
//!
//! This module holds the wire-level vocabulary only: the [`Pdu`] tagged
//! union and its sub-items. Encoding and decoding live in [`reader`] and
//! [`writer`]; nothing here touches a socket.

use std::fmt;

pub mod reader;
pub mod writer;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// Ceiling on a PDU (and a PDV) length mandated by the standard.
///
/// No encoder may produce a PDU larger than this, and no decoder may
/// trust a length prefix larger than this without validating it first.
pub const MAX_PDU_LENGTH: u32 = 16_777_215;

/// Length in bytes of the 6-byte PDU header (type, reserved, length).
pub const PDU_HEADER_LENGTH: u32 = 6;

/// A 16-byte, space-padded DICOM Application Entity title.
///
/// AE titles always occupy a fixed 16-byte field on the wire. [`AeTitle`]
/// stores exactly that representation and exposes [`AeTitle::trimmed`]
/// for the human-readable form, so that padding and trimming are each
/// implemented exactly once.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash)]
pub struct AeTitle([u8; 16]);

impl AeTitle {
    /// Pad `value` with trailing ASCII spaces (or truncate it) to build a
    /// fixed 16-byte AE title.
    pub fn pad(value: &str) -> AeTitle {
        let mut bytes = [b' '; 16];
        let src = value.as_bytes();
        let n = src.len().min(16);
        bytes[..n].copy_from_slice(&src[..n]);
        AeTitle(bytes)
    }

    /// Build an AE title from the raw 16-byte wire representation.
    pub fn from_bytes(bytes: [u8; 16]) -> AeTitle {
        AeTitle(bytes)
    }

    /// The raw, space-padded 16-byte wire representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The AE title with trailing spaces (and NULs) stripped.
    pub fn trimmed(&self) -> &str {
        let text = std::str::from_utf8(&self.0).unwrap_or("").trim_end_matches(['\0', ' ']);
        text
    }
}

impl fmt::Debug for AeTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AeTitle({:?})", self.trimmed())
    }
}

impl fmt::Display for AeTitle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.trimmed())
    }
}

impl From<&str> for AeTitle {
    fn from(value: &str) -> Self {
        AeTitle::pad(value)
    }
}

impl From<String> for AeTitle {
    fn from(value: String) -> Self {
        AeTitle::pad(&value)
    }
}

/// A presentation context as proposed by the association requester.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// Odd-numbered presentation context identifier.
    pub id: u8,
    /// The abstract syntax UID (SOP class or meta SOP class).
    pub abstract_syntax: String,
    /// The transfer syntaxes proposed for this context, in preference order.
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context as returned by the association acceptor.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    /// Identifier, matching that of the corresponding proposed context.
    pub id: u8,
    /// Whether (and why not) this context was accepted.
    pub reason: PresentationContextResultReason,
    /// The single negotiated transfer syntax. Only meaningful when
    /// `reason == Acceptance`; a UID is still stored (possibly empty)
    /// for a symmetrical round trip with the wire format.
    pub transfer_syntax: String,
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
#[repr(u8)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent,
    Transient,
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    Reserved(u8),
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortSource {
    ServiceUser,
    ServiceProvider(AbortServiceProviderReason),
    Reserved(u8),
}

#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortServiceProviderReason {
    ReasonNotSpecified,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    Unknown(u8, Vec<u8>),
    MaxLength(u32),
    ImplementationClassUid(String),
    ImplementationVersionName(String),
}

/// The type of payload carried by a single [`PDataValue`].
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    /// A fragment of the command stream.
    Command,
    /// A fragment of the dataset stream.
    Data,
}

/// A single Presentation Data Value item within a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    /// The (odd) presentation context this fragment belongs to.
    pub presentation_context_id: u8,
    /// Whether this fragment is part of the command or the dataset stream.
    pub value_type: PDataValueType,
    /// Whether this is the last fragment of its stream within the message.
    pub is_last: bool,
    /// The fragment's opaque payload.
    pub data: Vec<u8>,
}

/// A DICOM Upper Layer protocol data unit.
///
/// Every variant maps 1:1 to one of the seven PDU types defined by
/// PS3.8: A-ASSOCIATE-RQ, A-ASSOCIATE-AC, A-ASSOCIATE-RJ, P-DATA-TF,
/// A-RELEASE-RQ, A-RELEASE-RP and A-ABORT.
#[derive(Clone, PartialEq, Debug)]
pub enum Pdu {
    AssociationRQ {
        protocol_version: u16,
        calling_ae_title: AeTitle,
        called_ae_title: AeTitle,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextProposed>,
        user_variables: Vec<UserVariableItem>,
    },
    AssociationAC {
        protocol_version: u16,
        calling_ae_title: AeTitle,
        called_ae_title: AeTitle,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextResult>,
        user_variables: Vec<UserVariableItem>,
    },
    AssociationRJ {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    PData {
        data: Vec<PDataValue>,
    },
    ReleaseRQ,
    ReleaseRP,
    Abort {
        source: AbortSource,
    },
}

impl Pdu {
    /// A short, human-readable label for logging (not the wire encoding).
    pub fn short_description(&self) -> &'static str {
        match self {
            Pdu::AssociationRQ { .. } => "A-ASSOCIATE-RQ",
            Pdu::AssociationAC { .. } => "A-ASSOCIATE-AC",
            Pdu::AssociationRJ { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData { .. } => "P-DATA-TF",
            Pdu::ReleaseRQ => "A-RELEASE-RQ",
            Pdu::ReleaseRP => "A-RELEASE-RP",
            Pdu::Abort { .. } => "A-ABORT",
        }
    }
}

#[cfg(test)]
mod test;
