//! SCU/SCP service classes built atop the DIMSE message layer.

pub mod scp;
pub mod scu;

use snafu::Snafu;

use crate::command::CommandField;

/// The Verification SOP Class UID (PS3.4 Annex A), used by C-ECHO.
pub const VERIFICATION_SOP_CLASS_UID: &str = "1.2.840.10008.1.1";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not establish association"))]
    Association { source: dicom_ul::association::Error },

    #[snafu(display("transport setup failed"))]
    Transport { source: std::io::Error },

    #[snafu(display("association I/O failed"))]
    Io { source: dicom_ul::association::Error },

    #[snafu(display("could not encode or decode a command set"))]
    Command { source: crate::command::Error },

    #[snafu(display("no presentation context is available for SOP class `{}`", sop_class_uid))]
    NoPresentationContext { sop_class_uid: String },

    #[snafu(display("unexpected command field {:?} in this exchange", command_field))]
    UnexpectedCommandField { command_field: CommandField },

    #[snafu(display("unexpected PDU: {}", description))]
    UnexpectedPdu { description: String },

    #[snafu(display("response is missing its Status field"))]
    MissingStatus,

    #[snafu(display("operation failed with status {:#06x}", status))]
    ServiceFailure { status: u16 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
