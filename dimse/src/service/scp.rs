//! SCP (service class provider) server: a listener with a bounded pool
//! of concurrently served associations, dispatching to pluggable
//! handlers per DIMSE service.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use snafu::ResultExt;
use tracing::{info, instrument, warn};

use dicom_ul::association::{Association, ServerAssociationOptions};
use dicom_ul::pdu::Pdu;

use crate::command::fragment::{encode_message, Message, MessageReassembler};
use crate::command::{status, CommandField, CommandSet};

use super::{AssociationSnafu, CommandSnafu, IoSnafu, Result, TransportSnafu};

/// Status returned by a pluggable handler that has no specific failure
/// code to report, or by a default "not supported" handler.
pub const DEFAULT_FAILURE_STATUS: u16 = status::DEFAULT_FAILURE;

/// The result of handling a C-STORE request.
pub trait StoreHandler: Send + Sync {
    fn handle(&self, sop_class_uid: &str, sop_instance_uid: &str, dataset: &[u8]) -> u16;
}

/// Always answers Success, matching PS3.7's trivial C-ECHO semantics.
pub trait EchoHandler: Send + Sync {
    fn handle(&self) -> u16 {
        status::SUCCESS
    }
}

pub struct DefaultEchoHandler;
impl EchoHandler for DefaultEchoHandler {}

/// A single C-FIND match: the matching dataset, yielded before the
/// terminal status.
pub trait FindHandler: Send + Sync {
    fn handle(&self, sop_class_uid: &str, query: &[u8]) -> (Vec<Vec<u8>>, u16);
}

/// One instance returned by a C-GET match.
pub struct GetInstance {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub dataset: Vec<u8>,
}

pub trait GetHandler: Send + Sync {
    fn handle(&self, sop_class_uid: &str, query: &[u8]) -> (Vec<GetInstance>, u16);
}

/// The outcome of a C-MOVE request: how many sub-operations were sent,
/// and with what final status.
pub struct MoveResult {
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
    pub status: u16,
}

pub trait MoveHandler: Send + Sync {
    fn handle(&self, destination: &str, sop_class_uid: &str, query: &[u8]) -> MoveResult;
}

struct NotSupportedStoreHandler;
impl StoreHandler for NotSupportedStoreHandler {
    fn handle(&self, _sop_class_uid: &str, _sop_instance_uid: &str, _dataset: &[u8]) -> u16 {
        DEFAULT_FAILURE_STATUS
    }
}

struct NotSupportedFindHandler;
impl FindHandler for NotSupportedFindHandler {
    fn handle(&self, _sop_class_uid: &str, _query: &[u8]) -> (Vec<Vec<u8>>, u16) {
        (Vec::new(), DEFAULT_FAILURE_STATUS)
    }
}

struct NotSupportedGetHandler;
impl GetHandler for NotSupportedGetHandler {
    fn handle(&self, _sop_class_uid: &str, _query: &[u8]) -> (Vec<GetInstance>, u16) {
        (Vec::new(), DEFAULT_FAILURE_STATUS)
    }
}

struct NotSupportedMoveHandler;
impl MoveHandler for NotSupportedMoveHandler {
    fn handle(&self, _destination: &str, _sop_class_uid: &str, _query: &[u8]) -> MoveResult {
        MoveResult {
            completed: 0,
            failed: 0,
            warning: 0,
            status: DEFAULT_FAILURE_STATUS,
        }
    }
}

struct Handlers {
    echo: Arc<dyn EchoHandler>,
    store: Arc<dyn StoreHandler>,
    find: Arc<dyn FindHandler>,
    get: Arc<dyn GetHandler>,
    move_: Arc<dyn MoveHandler>,
}

/// Builder for an SCP server, mirroring the teacher's
/// `ServerAssociationOptions` one layer up: `with_*` accumulation
/// terminated by [`listen`][ServerOptions::listen].
pub struct ServerOptions {
    ae_title: Cow<'static, str>,
    max_pdu_length: u32,
    max_associations: usize,
    supported: BTreeMap<String, Vec<Cow<'static, str>>>,
    handlers: Handlers,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            ae_title: "ANY-SCP".into(),
            max_pdu_length: dicom_ul::pdu::reader::DEFAULT_MAX_PDU,
            max_associations: 25,
            supported: BTreeMap::new(),
            handlers: Handlers {
                echo: Arc::new(DefaultEchoHandler),
                store: Arc::new(NotSupportedStoreHandler),
                find: Arc::new(NotSupportedFindHandler),
                get: Arc::new(NotSupportedGetHandler),
                move_: Arc::new(NotSupportedMoveHandler),
            },
        }
    }
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ae_title<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.ae_title = value.into();
        self
    }

    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    pub fn max_associations(mut self, value: usize) -> Self {
        self.max_associations = value;
        self
    }

    pub fn with_supported_abstract_syntax<A: Into<String>>(
        mut self,
        abstract_syntax: A,
        transfer_syntaxes: Vec<Cow<'static, str>>,
    ) -> Self {
        self.supported.insert(abstract_syntax.into(), transfer_syntaxes);
        self
    }

    pub fn echo_handler(mut self, handler: Arc<dyn EchoHandler>) -> Self {
        self.handlers.echo = handler;
        self
    }

    pub fn store_handler(mut self, handler: Arc<dyn StoreHandler>) -> Self {
        self.handlers.store = handler;
        self
    }

    pub fn find_handler(mut self, handler: Arc<dyn FindHandler>) -> Self {
        self.handlers.find = handler;
        self
    }

    pub fn get_handler(mut self, handler: Arc<dyn GetHandler>) -> Self {
        self.handlers.get = handler;
        self
    }

    pub fn move_handler(mut self, handler: Arc<dyn MoveHandler>) -> Self {
        self.handlers.move_ = handler;
        self
    }

    pub fn listen<A: ToSocketAddrs>(self, address: A) -> Result<Server> {
        let listener = TcpListener::bind(address).context(TransportSnafu)?;
        Ok(Server {
            listener,
            ae_title: self.ae_title,
            max_pdu_length: self.max_pdu_length,
            max_associations: self.max_associations,
            supported: self.supported,
            handlers: Arc::new(self.handlers),
            active: Arc::new(AtomicUsize::new(0)),
            stopping: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// A listening SCP server. Call [`serve`][Server::serve] to run the
/// accept loop on the calling thread; each accepted association is
/// handled on its own thread.
pub struct Server {
    listener: TcpListener,
    ae_title: Cow<'static, str>,
    max_pdu_length: u32,
    max_associations: usize,
    supported: BTreeMap<String, Vec<Cow<'static, str>>>,
    handlers: Arc<Handlers>,
    active: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
}

impl Server {
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop until [`shutdown`][Server::shutdown] is
    /// called from another thread.
    pub fn serve(&self) -> Result<()> {
        self.listener.set_nonblocking(true).context(TransportSnafu)?;

        while !self.stopping.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.active.load(Ordering::Acquire) >= self.max_associations {
                        warn!(%peer, "rejecting connection: association pool is full");
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    self.spawn_association(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(_) => thread::sleep(Duration::from_millis(50)),
            }
        }
        Ok(())
    }

    fn spawn_association(&self, stream: TcpStream) {
        let ae_title = self.ae_title.clone();
        let max_pdu_length = self.max_pdu_length;
        let supported = self.supported.clone();
        let handlers = Arc::clone(&self.handlers);
        let active = Arc::clone(&self.active);

        active.fetch_add(1, Ordering::AcqRel);
        thread::spawn(move || {
            let _guard = ActiveGuard(active);
            if let Err(source) = accept_and_serve(stream, ae_title, max_pdu_length, supported, handlers)
            {
                warn!(%source, "association ended with an error");
            }
        });
    }

    /// Stop accepting new connections and wait (up to `deadline`) for
    /// in-flight associations to drain.
    pub fn shutdown(&self, deadline: Duration) {
        self.stopping.store(true, Ordering::Release);
        let start = Instant::now();
        while self.active.load(Ordering::Acquire) > 0 && start.elapsed() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);
impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[instrument(skip(stream, supported, handlers))]
fn accept_and_serve(
    stream: TcpStream,
    ae_title: Cow<'static, str>,
    max_pdu_length: u32,
    supported: BTreeMap<String, Vec<Cow<'static, str>>>,
    handlers: Arc<Handlers>,
) -> Result<()> {
    let mut options = ServerAssociationOptions::new()
        .ae_title(ae_title)
        .max_pdu_length(max_pdu_length);
    for (abstract_syntax, transfer_syntaxes) in supported {
        options = options.with_supported_abstract_syntax(abstract_syntax, transfer_syntaxes);
    }
    let association = options.accept(stream).context(AssociationSnafu)?;
    info!(
        contexts = association.presentation_contexts().count(),
        "association accepted"
    );

    let mut reassembler = MessageReassembler::new();
    loop {
        let pdu = match association.receive() {
            Ok(pdu) => pdu,
            Err(dicom_ul::association::Error::Receive { .. }) => break,
            Err(source) => return Err(source).context(IoSnafu),
        };

        match pdu {
            Pdu::PData { data } => {
                for pdv in &data {
                    if let Some((pc_id, message)) = reassembler.add_pdv(pdv).context(CommandSnafu)? {
                        dispatch(&association, pc_id, message, &handlers)?;
                    }
                }
            }
            Pdu::ReleaseRQ => {
                association.accept_release().context(IoSnafu)?;
                break;
            }
            Pdu::Abort { .. } => break,
            _ => break,
        }
    }
    Ok(())
}

fn send_message(association: &Association, pc_id: u8, message: &Message) -> Result<()> {
    let pdus = encode_message(pc_id, message, association.max_pdu_length()).context(CommandSnafu)?;
    for pdu in pdus {
        if let Pdu::PData { data } = pdu {
            association.send_data(data).context(IoSnafu)?;
        }
    }
    Ok(())
}

fn dispatch(
    association: &Association,
    pc_id: u8,
    message: Message,
    handlers: &Handlers,
) -> Result<()> {
    match message.command_field {
        CommandField::C_ECHO_RQ => {
            let response_status = handlers.echo.handle();
            let response = CommandSet {
                message_id_being_responded_to: message.command.message_id,
                affected_sop_class_uid: message.command.affected_sop_class_uid,
                status: Some(response_status),
                ..Default::default()
            };
            send_message(
                association,
                pc_id,
                &Message {
                    command_field: CommandField::C_ECHO_RSP,
                    command: response,
                    dataset: None,
                },
            )
        }
        CommandField::C_STORE_RQ => {
            let sop_class_uid = message.command.affected_sop_class_uid.clone().unwrap_or_default();
            let sop_instance_uid =
                message.command.affected_sop_instance_uid.clone().unwrap_or_default();
            let dataset = message.dataset.unwrap_or_default();
            let response_status = handlers.store.handle(&sop_class_uid, &sop_instance_uid, &dataset);

            let response = CommandSet {
                message_id_being_responded_to: message.command.message_id,
                affected_sop_class_uid: Some(sop_class_uid),
                affected_sop_instance_uid: Some(sop_instance_uid),
                status: Some(response_status),
                ..Default::default()
            };
            send_message(
                association,
                pc_id,
                &Message {
                    command_field: CommandField::C_STORE_RSP,
                    command: response,
                    dataset: None,
                },
            )
        }
        CommandField::C_FIND_RQ => {
            let sop_class_uid = message.command.affected_sop_class_uid.clone().unwrap_or_default();
            let query = message.dataset.unwrap_or_default();
            let (results, final_status) = handlers.find.handle(&sop_class_uid, &query);

            for result in results {
                send_message(
                    association,
                    pc_id,
                    &Message {
                        command_field: CommandField::C_FIND_RSP,
                        command: CommandSet {
                            message_id_being_responded_to: message.command.message_id,
                            affected_sop_class_uid: Some(sop_class_uid.clone()),
                            status: Some(status::PENDING),
                            ..Default::default()
                        },
                        dataset: Some(result),
                    },
                )?;
            }

            send_message(
                association,
                pc_id,
                &Message {
                    command_field: CommandField::C_FIND_RSP,
                    command: CommandSet {
                        message_id_being_responded_to: message.command.message_id,
                        status: Some(final_status),
                        ..Default::default()
                    },
                    dataset: None,
                },
            )
        }
        CommandField::C_GET_RQ => {
            let sop_class_uid = message.command.affected_sop_class_uid.clone().unwrap_or_default();
            let query = message.dataset.unwrap_or_default();
            let (instances, final_status) = handlers.get.handle(&sop_class_uid, &query);

            let mut completed = 0u16;
            let mut failed = 0u16;
            for instance in instances {
                let sub_op_pc_id = association
                    .find_presentation_context(&instance.sop_class_uid)
                    .map(|c| c.id)
                    .unwrap_or(pc_id);

                send_message(
                    association,
                    sub_op_pc_id,
                    &Message {
                        command_field: CommandField::C_STORE_RQ,
                        command: CommandSet {
                            message_id: Some(0),
                            affected_sop_class_uid: Some(instance.sop_class_uid.clone()),
                            affected_sop_instance_uid: Some(instance.sop_instance_uid.clone()),
                            ..Default::default()
                        },
                        dataset: Some(instance.dataset),
                    },
                )?;

                let (_, sub_response) = receive_one(association)?;
                let sub_status = sub_response.command.status.unwrap_or(DEFAULT_FAILURE_STATUS);
                if sub_status == status::SUCCESS {
                    completed += 1;
                } else {
                    failed += 1;
                }

                send_message(
                    association,
                    pc_id,
                    &Message {
                        command_field: CommandField::C_GET_RSP,
                        command: CommandSet {
                            message_id_being_responded_to: message.command.message_id,
                            status: Some(status::PENDING),
                            number_of_completed_sub_operations: Some(completed),
                            number_of_failed_sub_operations: Some(failed),
                            ..Default::default()
                        },
                        dataset: None,
                    },
                )?;
            }

            send_message(
                association,
                pc_id,
                &Message {
                    command_field: CommandField::C_GET_RSP,
                    command: CommandSet {
                        message_id_being_responded_to: message.command.message_id,
                        status: Some(final_status),
                        number_of_completed_sub_operations: Some(completed),
                        number_of_failed_sub_operations: Some(failed),
                        number_of_warning_sub_operations: Some(0),
                        ..Default::default()
                    },
                    dataset: None,
                },
            )
        }
        CommandField::C_MOVE_RQ => {
            let sop_class_uid = message.command.affected_sop_class_uid.clone().unwrap_or_default();
            let destination = message.command.move_destination.clone().unwrap_or_default();
            let query = message.dataset.unwrap_or_default();
            let result = handlers.move_.handle(&destination, &sop_class_uid, &query);

            send_message(
                association,
                pc_id,
                &Message {
                    command_field: CommandField::C_MOVE_RSP,
                    command: CommandSet {
                        message_id_being_responded_to: message.command.message_id,
                        status: Some(result.status),
                        number_of_completed_sub_operations: Some(result.completed),
                        number_of_failed_sub_operations: Some(result.failed),
                        number_of_warning_sub_operations: Some(result.warning),
                        ..Default::default()
                    },
                    dataset: None,
                },
            )
        }
        other => super::UnexpectedCommandFieldSnafu {
            command_field: other,
        }
        .fail(),
    }
}

/// Used only while driving a C-GET sub-operation: read PDUs until the
/// peer's C-STORE-RSP for that sub-operation reassembles.
fn receive_one(association: &Association) -> Result<(u8, Message)> {
    let mut reassembler = MessageReassembler::new();
    loop {
        let pdu = association.receive().context(IoSnafu)?;
        if let Pdu::PData { data } = pdu {
            for pdv in &data {
                if let Some(result) = reassembler.add_pdv(pdv).context(CommandSnafu)? {
                    return Ok(result);
                }
            }
        }
    }
}
