//! DIMSE command sets: the group-0x0000 elements carried ahead of (or
//! instead of) a dataset in every DIMSE message.

use std::collections::BTreeMap;

use byteordered::byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

pub mod fragment;

/// Command sets are always encoded in Implicit VR Little Endian,
/// regardless of the transfer syntax negotiated for the dataset that
/// may follow them.
pub const COMMAND_SET_TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2";

type Tag = (u16, u16);

mod tag {
    use super::Tag;

    pub const COMMAND_FIELD: Tag = (0x0000, 0x0100);
    pub const MESSAGE_ID: Tag = (0x0000, 0x0110);
    pub const MESSAGE_ID_BEING_RESPONDED_TO: Tag = (0x0000, 0x0120);
    pub const AFFECTED_SOP_CLASS_UID: Tag = (0x0000, 0x0002);
    pub const REQUESTED_SOP_CLASS_UID: Tag = (0x0000, 0x1003);
    pub const AFFECTED_SOP_INSTANCE_UID: Tag = (0x0000, 0x1000);
    pub const REQUESTED_SOP_INSTANCE_UID: Tag = (0x0000, 0x1001);
    pub const PRIORITY: Tag = (0x0000, 0x0700);
    pub const COMMAND_DATA_SET_TYPE: Tag = (0x0000, 0x0800);
    pub const STATUS: Tag = (0x0000, 0x0900);
    pub const NUMBER_OF_REMAINING_SUBOPERATIONS: Tag = (0x0000, 0x1020);
    pub const NUMBER_OF_COMPLETED_SUBOPERATIONS: Tag = (0x0000, 0x1021);
    pub const NUMBER_OF_FAILED_SUBOPERATIONS: Tag = (0x0000, 0x1022);
    pub const NUMBER_OF_WARNING_SUBOPERATIONS: Tag = (0x0000, 0x1023);
    pub const MOVE_DESTINATION: Tag = (0x0000, 0x0600);
    pub const MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE: Tag = (0x0000, 0x1030);
    pub const MOVE_ORIGINATOR_MESSAGE_ID: Tag = (0x0000, 0x1031);
}

/// The DIMSE-C/N Command Field values (PS3.7 Table 9.1/10.1).
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandField {
    C_STORE_RQ,
    C_STORE_RSP,
    C_GET_RQ,
    C_GET_RSP,
    C_FIND_RQ,
    C_FIND_RSP,
    C_MOVE_RQ,
    C_MOVE_RSP,
    C_ECHO_RQ,
    C_ECHO_RSP,
    C_CANCEL_RQ,
    N_EVENT_REPORT_RQ,
    N_EVENT_REPORT_RSP,
    N_GET_RQ,
    N_GET_RSP,
    N_SET_RQ,
    N_SET_RSP,
    N_ACTION_RQ,
    N_ACTION_RSP,
    N_CREATE_RQ,
    N_CREATE_RSP,
    N_DELETE_RQ,
    N_DELETE_RSP,
}

impl CommandField {
    pub fn code(self) -> u16 {
        match self {
            CommandField::C_STORE_RQ => 0x0001,
            CommandField::C_STORE_RSP => 0x8001,
            CommandField::C_GET_RQ => 0x0010,
            CommandField::C_GET_RSP => 0x8010,
            CommandField::C_FIND_RQ => 0x0020,
            CommandField::C_FIND_RSP => 0x8020,
            CommandField::C_MOVE_RQ => 0x0021,
            CommandField::C_MOVE_RSP => 0x8021,
            CommandField::C_ECHO_RQ => 0x0030,
            CommandField::C_ECHO_RSP => 0x8030,
            CommandField::C_CANCEL_RQ => 0x0FFF,
            CommandField::N_EVENT_REPORT_RQ => 0x0100,
            CommandField::N_EVENT_REPORT_RSP => 0x8100,
            CommandField::N_GET_RQ => 0x0110,
            CommandField::N_GET_RSP => 0x8110,
            CommandField::N_SET_RQ => 0x0120,
            CommandField::N_SET_RSP => 0x8120,
            CommandField::N_ACTION_RQ => 0x0130,
            CommandField::N_ACTION_RSP => 0x8130,
            CommandField::N_CREATE_RQ => 0x0140,
            CommandField::N_CREATE_RSP => 0x8140,
            CommandField::N_DELETE_RQ => 0x0150,
            CommandField::N_DELETE_RSP => 0x8150,
        }
    }

    pub fn from_code(code: u16) -> Option<CommandField> {
        Some(match code {
            0x0001 => CommandField::C_STORE_RQ,
            0x8001 => CommandField::C_STORE_RSP,
            0x0010 => CommandField::C_GET_RQ,
            0x8010 => CommandField::C_GET_RSP,
            0x0020 => CommandField::C_FIND_RQ,
            0x8020 => CommandField::C_FIND_RSP,
            0x0021 => CommandField::C_MOVE_RQ,
            0x8021 => CommandField::C_MOVE_RSP,
            0x0030 => CommandField::C_ECHO_RQ,
            0x8030 => CommandField::C_ECHO_RSP,
            0x0FFF => CommandField::C_CANCEL_RQ,
            0x0100 => CommandField::N_EVENT_REPORT_RQ,
            0x8100 => CommandField::N_EVENT_REPORT_RSP,
            0x0110 => CommandField::N_GET_RQ,
            0x8110 => CommandField::N_GET_RSP,
            0x0120 => CommandField::N_SET_RQ,
            0x8120 => CommandField::N_SET_RSP,
            0x0130 => CommandField::N_ACTION_RQ,
            0x8130 => CommandField::N_ACTION_RSP,
            0x0140 => CommandField::N_CREATE_RQ,
            0x8140 => CommandField::N_CREATE_RSP,
            0x0150 => CommandField::N_DELETE_RQ,
            0x8150 => CommandField::N_DELETE_RSP,
            _ => return None,
        })
    }

    /// Whether this is a response (`-RSP`) command field.
    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

impl Priority {
    fn from_u16(value: u16) -> Option<Priority> {
        match value {
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            0x0002 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Whether a dataset stream follows the command in this message.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum CommandDataSetType {
    Present = 0x0001,
    Absent = 0x0101,
}

impl CommandDataSetType {
    pub fn has_dataset(self) -> bool {
        matches!(self, CommandDataSetType::Present)
    }
}

/// The Status value group used by every service class (PS3.7 Annex C).
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const CANCEL: u16 = 0xFE00;
    /// Default status for an unclassified processing failure, used when
    /// a handler does not select a more specific code.
    pub const DEFAULT_FAILURE: u16 = 0xC000;
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not write command field `{:?}`", tag))]
    WriteField { tag: Tag, source: std::io::Error },

    #[snafu(display("could not read command element at ({:#06x},{:#06x})", tag.0, tag.1))]
    ReadElement { tag: Tag, source: std::io::Error },

    #[snafu(display("missing required command field `{}`", field))]
    MissingField { field: &'static str },

    #[snafu(display("command field code {:#06x} is not recognized", code))]
    UnknownCommandField { code: u16 },

    #[snafu(display("element value for ({:#06x},{:#06x}) has an unexpected length", tag.0, tag.1))]
    UnexpectedLength { tag: Tag },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A DIMSE command set: the fields carried in the group-0x0000 command
/// stream ahead of (or instead of) a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSet {
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub requested_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub requested_sop_instance_uid: Option<String>,
    pub priority: Option<u16>,
    pub status: Option<u16>,
    pub number_of_remaining_sub_operations: Option<u16>,
    pub number_of_completed_sub_operations: Option<u16>,
    pub number_of_failed_sub_operations: Option<u16>,
    pub number_of_warning_sub_operations: Option<u16>,
    pub move_destination: Option<String>,
    pub move_originator_application_entity_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
}

impl CommandSet {
    fn write_uid<W: std::io::Write>(
        w: &mut W,
        tag: Tag,
        value: &str,
    ) -> Result<()> {
        let mut bytes = value.as_bytes().to_vec();
        if bytes.len() % 2 != 0 {
            bytes.push(0);
        }
        w.write_u16::<LittleEndian>(tag.0).context(WriteFieldSnafu { tag })?;
        w.write_u16::<LittleEndian>(tag.1).context(WriteFieldSnafu { tag })?;
        w.write_u32::<LittleEndian>(bytes.len() as u32)
            .context(WriteFieldSnafu { tag })?;
        w.write_all(&bytes).context(WriteFieldSnafu { tag })?;
        Ok(())
    }

    fn write_ae<W: std::io::Write>(w: &mut W, tag: Tag, value: &str) -> Result<()> {
        let mut bytes = value.as_bytes().to_vec();
        if bytes.len() % 2 != 0 {
            bytes.push(b' ');
        }
        w.write_u16::<LittleEndian>(tag.0).context(WriteFieldSnafu { tag })?;
        w.write_u16::<LittleEndian>(tag.1).context(WriteFieldSnafu { tag })?;
        w.write_u32::<LittleEndian>(bytes.len() as u32)
            .context(WriteFieldSnafu { tag })?;
        w.write_all(&bytes).context(WriteFieldSnafu { tag })?;
        Ok(())
    }

    fn write_u16_field<W: std::io::Write>(w: &mut W, tag: Tag, value: u16) -> Result<()> {
        w.write_u16::<LittleEndian>(tag.0).context(WriteFieldSnafu { tag })?;
        w.write_u16::<LittleEndian>(tag.1).context(WriteFieldSnafu { tag })?;
        w.write_u32::<LittleEndian>(2).context(WriteFieldSnafu { tag })?;
        w.write_u16::<LittleEndian>(value).context(WriteFieldSnafu { tag })?;
        Ok(())
    }

    /// Encode this command set in Implicit VR Little Endian. `command_field`
    /// and `dataset_type` are taken separately since they drive the
    /// fragmentation step rather than living as struct fields the caller
    /// juggles alongside everything else.
    pub fn encode(
        &self,
        command_field: CommandField,
        dataset_type: CommandDataSetType,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        Self::write_u16_field(&mut out, tag::COMMAND_FIELD, command_field.code())?;

        if let Some(v) = self.message_id {
            Self::write_u16_field(&mut out, tag::MESSAGE_ID, v)?;
        }
        if let Some(v) = self.message_id_being_responded_to {
            Self::write_u16_field(&mut out, tag::MESSAGE_ID_BEING_RESPONDED_TO, v)?;
        }
        if let Some(v) = &self.affected_sop_class_uid {
            Self::write_uid(&mut out, tag::AFFECTED_SOP_CLASS_UID, v)?;
        }
        if let Some(v) = &self.requested_sop_class_uid {
            Self::write_uid(&mut out, tag::REQUESTED_SOP_CLASS_UID, v)?;
        }
        if let Some(v) = &self.affected_sop_instance_uid {
            Self::write_uid(&mut out, tag::AFFECTED_SOP_INSTANCE_UID, v)?;
        }
        if let Some(v) = &self.requested_sop_instance_uid {
            Self::write_uid(&mut out, tag::REQUESTED_SOP_INSTANCE_UID, v)?;
        }
        if let Some(v) = self.priority {
            Self::write_u16_field(&mut out, tag::PRIORITY, v)?;
        }
        Self::write_u16_field(&mut out, tag::COMMAND_DATA_SET_TYPE, dataset_type as u16)?;
        if let Some(v) = self.status {
            Self::write_u16_field(&mut out, tag::STATUS, v)?;
        }
        if let Some(v) = self.number_of_remaining_sub_operations {
            Self::write_u16_field(&mut out, tag::NUMBER_OF_REMAINING_SUBOPERATIONS, v)?;
        }
        if let Some(v) = self.number_of_completed_sub_operations {
            Self::write_u16_field(&mut out, tag::NUMBER_OF_COMPLETED_SUBOPERATIONS, v)?;
        }
        if let Some(v) = self.number_of_failed_sub_operations {
            Self::write_u16_field(&mut out, tag::NUMBER_OF_FAILED_SUBOPERATIONS, v)?;
        }
        if let Some(v) = self.number_of_warning_sub_operations {
            Self::write_u16_field(&mut out, tag::NUMBER_OF_WARNING_SUBOPERATIONS, v)?;
        }
        if let Some(v) = &self.move_destination {
            Self::write_ae(&mut out, tag::MOVE_DESTINATION, v)?;
        }
        if let Some(v) = &self.move_originator_application_entity_title {
            Self::write_ae(&mut out, tag::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, v)?;
        }
        if let Some(v) = self.move_originator_message_id {
            Self::write_u16_field(&mut out, tag::MOVE_ORIGINATOR_MESSAGE_ID, v)?;
        }

        Ok(out)
    }

    /// Decode a command set (and its Command Field / dataset type) from
    /// an Implicit VR Little Endian byte buffer. Tolerant per the usual
    /// DIMSE convention: two-byte values are read as `u16`, everything
    /// else is read as text with trailing NULs/spaces trimmed.
    pub fn decode(bytes: &[u8]) -> Result<(CommandField, CommandDataSetType, CommandSet)> {
        let mut elements = BTreeMap::new();
        let mut cursor = std::io::Cursor::new(bytes);
        while (cursor.position() as usize) < bytes.len() {
            let group = cursor
                .read_u16::<LittleEndian>()
                .context(ReadElementSnafu { tag: (0, 0) })?;
            let element = cursor
                .read_u16::<LittleEndian>()
                .context(ReadElementSnafu { tag: (0, 0) })?;
            let length = cursor
                .read_u32::<LittleEndian>()
                .context(ReadElementSnafu { tag: (group, element) })?;
            let mut value = vec![0u8; length as usize];
            std::io::Read::read_exact(&mut cursor, &mut value)
                .context(ReadElementSnafu { tag: (group, element) })?;
            elements.insert((group, element), value);
        }

        let read_u16_el = |tag: Tag| -> Result<Option<u16>> {
            match elements.get(&tag) {
                None => Ok(None),
                Some(bytes) => {
                    ensure!(bytes.len() == 2, UnexpectedLengthSnafu { tag });
                    Ok(Some(u16::from_le_bytes([bytes[0], bytes[1]])))
                }
            }
        };
        let read_text_el = |tag: Tag| -> Option<String> {
            elements.get(&tag).map(|bytes| {
                String::from_utf8_lossy(bytes)
                    .trim_end_matches(['\0', ' '])
                    .to_string()
            })
        };

        let command_code = read_u16_el(tag::COMMAND_FIELD)?.context(MissingFieldSnafu {
            field: "command-field",
        })?;
        let command_field = CommandField::from_code(command_code)
            .context(UnknownCommandFieldSnafu { code: command_code })?;

        let dataset_type_code = read_u16_el(tag::COMMAND_DATA_SET_TYPE)?.context(
            MissingFieldSnafu {
                field: "command-data-set-type",
            },
        )?;
        let dataset_type = if dataset_type_code == CommandDataSetType::Absent as u16 {
            CommandDataSetType::Absent
        } else {
            CommandDataSetType::Present
        };

        let command_set = CommandSet {
            message_id: read_u16_el(tag::MESSAGE_ID)?,
            message_id_being_responded_to: read_u16_el(tag::MESSAGE_ID_BEING_RESPONDED_TO)?,
            affected_sop_class_uid: read_text_el(tag::AFFECTED_SOP_CLASS_UID),
            requested_sop_class_uid: read_text_el(tag::REQUESTED_SOP_CLASS_UID),
            affected_sop_instance_uid: read_text_el(tag::AFFECTED_SOP_INSTANCE_UID),
            requested_sop_instance_uid: read_text_el(tag::REQUESTED_SOP_INSTANCE_UID),
            priority: read_u16_el(tag::PRIORITY)?,
            status: read_u16_el(tag::STATUS)?,
            number_of_remaining_sub_operations: read_u16_el(
                tag::NUMBER_OF_REMAINING_SUBOPERATIONS,
            )?,
            number_of_completed_sub_operations: read_u16_el(
                tag::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            )?,
            number_of_failed_sub_operations: read_u16_el(tag::NUMBER_OF_FAILED_SUBOPERATIONS)?,
            number_of_warning_sub_operations: read_u16_el(tag::NUMBER_OF_WARNING_SUBOPERATIONS)?,
            move_destination: read_text_el(tag::MOVE_DESTINATION),
            move_originator_application_entity_title: read_text_el(
                tag::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
            ),
            move_originator_message_id: read_u16_el(tag::MOVE_ORIGINATOR_MESSAGE_ID)?,
        };

        Ok((command_field, dataset_type, command_set))
    }

    /// The decoded priority, if present and recognized.
    pub fn priority(&self) -> Option<Priority> {
        self.priority.and_then(Priority::from_u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_an_echo_request() {
        let cmd = CommandSet {
            message_id: Some(1),
            affected_sop_class_uid: Some("1.2.840.10008.1.1".to_owned()),
            ..Default::default()
        };
        let bytes = cmd
            .encode(CommandField::C_ECHO_RQ, CommandDataSetType::Absent)
            .unwrap();
        let (field, dataset_type, decoded) = CommandSet::decode(&bytes).unwrap();
        assert_eq!(field, CommandField::C_ECHO_RQ);
        assert_eq!(dataset_type, CommandDataSetType::Absent);
        assert_eq!(decoded.message_id, Some(1));
        assert_eq!(decoded.affected_sop_class_uid.as_deref(), Some("1.2.840.10008.1.1"));
    }

    #[test]
    fn encodes_and_decodes_a_move_rsp_with_counters() {
        let cmd = CommandSet {
            message_id_being_responded_to: Some(7),
            status: Some(status::SUCCESS),
            number_of_completed_sub_operations: Some(3),
            number_of_failed_sub_operations: Some(0),
            number_of_warning_sub_operations: Some(0),
            ..Default::default()
        };
        let bytes = cmd
            .encode(CommandField::C_MOVE_RSP, CommandDataSetType::Absent)
            .unwrap();
        let (field, _, decoded) = CommandSet::decode(&bytes).unwrap();
        assert_eq!(field, CommandField::C_MOVE_RSP);
        assert_eq!(decoded.number_of_completed_sub_operations, Some(3));
    }

    #[test]
    fn odd_length_uid_is_padded_to_even() {
        let cmd = CommandSet {
            affected_sop_class_uid: Some("1.2.3".to_owned()),
            ..Default::default()
        };
        let bytes = cmd
            .encode(CommandField::C_STORE_RQ, CommandDataSetType::Present)
            .unwrap();
        // tag(4) + length(4) for command field, then the UID element
        let uid_element_start = 12;
        let length = u32::from_le_bytes([
            bytes[uid_element_start + 4],
            bytes[uid_element_start + 5],
            bytes[uid_element_start + 6],
            bytes[uid_element_start + 7],
        ]);
        assert_eq!(length % 2, 0);
    }

    #[test]
    fn rejects_unknown_command_field() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x0000u16.to_le_bytes());
        bytes.extend_from_slice(&0x0100u16.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&0xBEEFu16.to_le_bytes());

        let err = CommandSet::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::UnknownCommandField { code: 0xBEEF }));
    }
}
