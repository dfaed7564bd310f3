//! The DIMSE message layer and SCU/SCP service classes, built on top of
//! the DICOM Upper Layer protocol provided by `dicom-ul`.

pub mod command;
pub mod service;

pub use command::fragment::{Message, MessageReassembler};
pub use command::{CommandDataSetType, CommandField, CommandSet, Priority};
pub use service::scp::ServerOptions;
pub use service::scu::ClientOptions;
