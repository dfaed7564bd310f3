//! SCU (service class user) client: `Echo`, `Store`, `Find`, `Get`, `Move`.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::net::ToSocketAddrs;

use snafu::{OptionExt, ResultExt};
use tracing::instrument;

use dicom_ul::association::{Association, ClientAssociationOptions};
use dicom_ul::pdu::Pdu;

use crate::command::fragment::{encode_message, Message, MessageReassembler};
use crate::command::{status, CommandField, CommandSet, Priority};

use super::{
    AssociationSnafu, CommandSnafu, IoSnafu, MissingStatusSnafu, NoPresentationContextSnafu,
    Result, ServiceFailureSnafu, UnexpectedCommandFieldSnafu, UnexpectedPduSnafu,
};

/// The outcome of a completed `Get` operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubOperationCounts {
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// The outcome of a completed `Move` operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveOutcome {
    pub counts: SubOperationCounts,
    pub status: u16,
}

/// Builder for an SCU connection, mirroring the teacher's
/// `ClientAssociationOptions` shape one layer up: terminal [`connect`][
/// ClientOptions::connect] dials the peer and negotiates the association.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    calling_ae_title: Cow<'static, str>,
    called_ae_title: Cow<'static, str>,
    max_pdu_length: u32,
    presentation_contexts: Vec<(Cow<'static, str>, Vec<Cow<'static, str>>)>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            calling_ae_title: "DIMSE-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            max_pdu_length: dicom_ul::pdu::reader::DEFAULT_MAX_PDU,
            presentation_contexts: Vec::new(),
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calling_ae_title<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.calling_ae_title = value.into();
        self
    }

    pub fn called_ae_title<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.called_ae_title = value.into();
        self
    }

    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Propose an abstract syntax with the given transfer syntaxes, in
    /// preference order.
    pub fn with_presentation_context<A: Into<Cow<'static, str>>>(
        mut self,
        abstract_syntax: A,
        transfer_syntaxes: Vec<Cow<'static, str>>,
    ) -> Self {
        self.presentation_contexts
            .push((abstract_syntax.into(), transfer_syntaxes));
        self
    }

    /// Connect, negotiate and return a ready [`Client`].
    #[instrument(skip(self, address))]
    pub fn connect<A: ToSocketAddrs>(self, address: A) -> Result<Client> {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.calling_ae_title)
            .called_ae_title(self.called_ae_title)
            .max_pdu_length(self.max_pdu_length);
        for (abstract_syntax, transfer_syntaxes) in self.presentation_contexts {
            options = options.with_presentation_context(abstract_syntax, transfer_syntaxes);
        }
        let association = options.establish(address).context(AssociationSnafu)?;
        Ok(Client {
            association,
            next_message_id: Cell::new(1),
            reassembler: RefCell::new(MessageReassembler::new()),
        })
    }
}

/// An established SCU connection. Each operation allocates the next
/// Message ID from a counter that wraps from 65535 back to 1.
pub struct Client {
    association: Association,
    next_message_id: Cell<u16>,
    reassembler: RefCell<MessageReassembler>,
}

impl Client {
    fn next_message_id(&self) -> u16 {
        let id = self.next_message_id.get();
        self.next_message_id
            .set(if id == u16::MAX { 1 } else { id + 1 });
        id
    }

    fn context_id(&self, sop_class_uid: &str) -> Result<u8> {
        self.association
            .find_presentation_context(sop_class_uid)
            .map(|c| c.id)
            .context(NoPresentationContextSnafu {
                sop_class_uid: sop_class_uid.to_owned(),
            })
    }

    fn send_message(&self, pc_id: u8, message: &Message) -> Result<()> {
        let pdus = encode_message(pc_id, message, self.association.max_pdu_length())
            .context(CommandSnafu)?;
        for pdu in pdus {
            if let Pdu::PData { data } = pdu {
                self.association.send_data(data).context(IoSnafu)?;
            }
        }
        Ok(())
    }

    /// Read PDUs until a full DIMSE message is reassembled, regardless of
    /// which presentation context it arrives on.
    fn receive_message(&self) -> Result<(u8, Message)> {
        loop {
            let pdu = self.association.receive().context(IoSnafu)?;
            match pdu {
                Pdu::PData { data } => {
                    let mut reassembler = self.reassembler.borrow_mut();
                    for pdv in &data {
                        if let Some(result) = reassembler.add_pdv(pdv).context(CommandSnafu)? {
                            return Ok(result);
                        }
                    }
                }
                other => {
                    return UnexpectedPduSnafu {
                        description: other.short_description().to_owned(),
                    }
                    .fail()
                }
            }
        }
    }

    /// Close the association with a normal release.
    pub fn close(self) -> Result<()> {
        self.association.release().context(IoSnafu)
    }

    /// Send a C-ECHO-RQ over the Verification presentation context and
    /// await a successful C-ECHO-RSP.
    #[instrument(skip(self))]
    pub fn echo(&self) -> Result<()> {
        let pc_id = self.context_id(super::VERIFICATION_SOP_CLASS_UID)?;
        let command = CommandSet {
            message_id: Some(self.next_message_id()),
            affected_sop_class_uid: Some(super::VERIFICATION_SOP_CLASS_UID.to_owned()),
            ..Default::default()
        };
        self.send_message(
            pc_id,
            &Message {
                command_field: CommandField::C_ECHO_RQ,
                command,
                dataset: None,
            },
        )?;

        let (_, response) = self.receive_message()?;
        if response.command_field != CommandField::C_ECHO_RSP {
            return UnexpectedCommandFieldSnafu {
                command_field: response.command_field,
            }
            .fail();
        }
        let response_status = response.command.status.context(MissingStatusSnafu)?;
        if response_status != status::SUCCESS {
            return ServiceFailureSnafu {
                status: response_status,
            }
            .fail();
        }
        Ok(())
    }

    /// Send a C-STORE-RQ carrying `dataset` and await a successful
    /// C-STORE-RSP.
    #[instrument(skip(self, dataset))]
    pub fn store(&self, sop_class_uid: &str, sop_instance_uid: &str, dataset: Vec<u8>) -> Result<()> {
        let pc_id = self.context_id(sop_class_uid)?;
        let command = CommandSet {
            message_id: Some(self.next_message_id()),
            affected_sop_class_uid: Some(sop_class_uid.to_owned()),
            affected_sop_instance_uid: Some(sop_instance_uid.to_owned()),
            priority: Some(Priority::Medium as u16),
            ..Default::default()
        };
        self.send_message(
            pc_id,
            &Message {
                command_field: CommandField::C_STORE_RQ,
                command,
                dataset: Some(dataset),
            },
        )?;

        let (_, response) = self.receive_message()?;
        if response.command_field != CommandField::C_STORE_RSP {
            return UnexpectedCommandFieldSnafu {
                command_field: response.command_field,
            }
            .fail();
        }
        let response_status = response.command.status.context(MissingStatusSnafu)?;
        if response_status != status::SUCCESS {
            return ServiceFailureSnafu {
                status: response_status,
            }
            .fail();
        }
        Ok(())
    }

    /// Send a C-FIND-RQ carrying `query` and invoke `on_result` for every
    /// Pending response until the final Success (or failure) arrives.
    #[instrument(skip(self, query, on_result))]
    pub fn find(
        &self,
        sop_class_uid: &str,
        query: Vec<u8>,
        mut on_result: impl FnMut(Vec<u8>),
    ) -> Result<()> {
        let pc_id = self.context_id(sop_class_uid)?;
        let command = CommandSet {
            message_id: Some(self.next_message_id()),
            affected_sop_class_uid: Some(sop_class_uid.to_owned()),
            priority: Some(Priority::Medium as u16),
            ..Default::default()
        };
        self.send_message(
            pc_id,
            &Message {
                command_field: CommandField::C_FIND_RQ,
                command,
                dataset: Some(query),
            },
        )?;

        loop {
            let (_, response) = self.receive_message()?;
            if response.command_field != CommandField::C_FIND_RSP {
                return UnexpectedCommandFieldSnafu {
                    command_field: response.command_field,
                }
                .fail();
            }
            let response_status = response.command.status.context(MissingStatusSnafu)?;
            match response_status {
                status::PENDING => {
                    if let Some(dataset) = response.dataset {
                        on_result(dataset);
                    }
                }
                status::SUCCESS => return Ok(()),
                other => return ServiceFailureSnafu { status: other }.fail(),
            }
        }
    }

    /// Send a C-GET-RQ carrying `query`. For every C-STORE-RQ
    /// sub-operation received, invokes `on_store` with the instance's SOP
    /// class/instance UID and dataset, expecting back the Status to reply
    /// with (`0x0000` on success), and answers with a matching
    /// C-STORE-RSP before continuing.
    #[instrument(skip(self, query, on_store))]
    pub fn get(
        &self,
        sop_class_uid: &str,
        query: Vec<u8>,
        mut on_store: impl FnMut(&str, &str, Vec<u8>) -> u16,
    ) -> Result<SubOperationCounts> {
        let pc_id = self.context_id(sop_class_uid)?;
        let command = CommandSet {
            message_id: Some(self.next_message_id()),
            affected_sop_class_uid: Some(sop_class_uid.to_owned()),
            priority: Some(Priority::Medium as u16),
            ..Default::default()
        };
        self.send_message(
            pc_id,
            &Message {
                command_field: CommandField::C_GET_RQ,
                command,
                dataset: Some(query),
            },
        )?;

        loop {
            let (sub_op_pc_id, message) = self.receive_message()?;
            match message.command_field {
                CommandField::C_STORE_RQ => {
                    let sop_class = message.command.affected_sop_class_uid.clone().unwrap_or_default();
                    let sop_instance =
                        message.command.affected_sop_instance_uid.clone().unwrap_or_default();
                    let dataset = message.dataset.unwrap_or_default();
                    let reply_status = on_store(&sop_class, &sop_instance, dataset);

                    let response_command = CommandSet {
                        message_id_being_responded_to: message.command.message_id,
                        affected_sop_class_uid: Some(sop_class),
                        affected_sop_instance_uid: Some(sop_instance),
                        status: Some(reply_status),
                        ..Default::default()
                    };
                    self.send_message(
                        sub_op_pc_id,
                        &Message {
                            command_field: CommandField::C_STORE_RSP,
                            command: response_command,
                            dataset: None,
                        },
                    )?;
                }
                CommandField::C_GET_RSP => {
                    let response_status = message.command.status.context(MissingStatusSnafu)?;
                    match response_status {
                        status::PENDING => continue,
                        status::SUCCESS => {
                            return Ok(SubOperationCounts {
                                completed: message
                                    .command
                                    .number_of_completed_sub_operations
                                    .unwrap_or(0),
                                failed: message.command.number_of_failed_sub_operations.unwrap_or(0),
                                warning: message
                                    .command
                                    .number_of_warning_sub_operations
                                    .unwrap_or(0),
                            })
                        }
                        other => return ServiceFailureSnafu { status: other }.fail(),
                    }
                }
                other => return UnexpectedCommandFieldSnafu { command_field: other }.fail(),
            }
        }
    }

    /// Send a C-MOVE-RQ directing the SCP to forward matching instances
    /// to `destination`, returning the final sub-operation counts and
    /// status once the operation completes.
    #[instrument(skip(self, query))]
    pub fn move_instances(
        &self,
        sop_class_uid: &str,
        destination: &str,
        query: Vec<u8>,
    ) -> Result<MoveOutcome> {
        let pc_id = self.context_id(sop_class_uid)?;
        let command = CommandSet {
            message_id: Some(self.next_message_id()),
            affected_sop_class_uid: Some(sop_class_uid.to_owned()),
            move_destination: Some(destination.to_owned()),
            priority: Some(Priority::Medium as u16),
            ..Default::default()
        };
        self.send_message(
            pc_id,
            &Message {
                command_field: CommandField::C_MOVE_RQ,
                command,
                dataset: Some(query),
            },
        )?;

        loop {
            let (_, response) = self.receive_message()?;
            if response.command_field != CommandField::C_MOVE_RSP {
                return UnexpectedCommandFieldSnafu {
                    command_field: response.command_field,
                }
                .fail();
            }
            let response_status = response.command.status.context(MissingStatusSnafu)?;
            let counts = SubOperationCounts {
                completed: response.command.number_of_completed_sub_operations.unwrap_or(0),
                failed: response.command.number_of_failed_sub_operations.unwrap_or(0),
                warning: response.command.number_of_warning_sub_operations.unwrap_or(0),
            };
            match response_status {
                status::PENDING => continue,
                other => {
                    return Ok(MoveOutcome {
                        counts,
                        status: other,
                    })
                }
            }
        }
    }
}
