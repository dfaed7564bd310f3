//! Association establishment, data transfer and release.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::{info, instrument};

use crate::connection::{self, Connection};
use crate::fsm::Event;
use crate::pdu::{
    reader, AbortSource, AeTitle, AssociationRJResult, AssociationRJSource, PDataValue, Pdu,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem,
};

/// `1.2.840.10008.3.1.1.1`: the DICOM application context name.
pub const DEFAULT_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// Implicit VR Little Endian.
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
/// Explicit VR Little Endian.
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("at least one abstract syntax must be proposed"))]
    MissingAbstractSyntax,

    #[snafu(display("could not connect to peer"))]
    Connect { source: std::io::Error },

    #[snafu(display("could not bind listener"))]
    Bind { source: std::io::Error },

    #[snafu(display("could not accept incoming connection"))]
    Accept { source: std::io::Error },

    #[snafu(display("could not set up connection"))]
    Setup { source: connection::Error },

    #[snafu(display("could not send PDU"))]
    Send { source: connection::Error },

    #[snafu(display("could not receive PDU"))]
    Receive { source: connection::Error },

    #[snafu(display("the association was rejected by the peer"))]
    Rejected {
        result: AssociationRJResult,
        source_: AssociationRJSource,
    },

    #[snafu(display("unexpected PDU `{}` in this context", pdu.short_description()))]
    UnexpectedPdu { pdu: Pdu },

    #[snafu(display("no presentation context is available for abstract syntax `{}`", abstract_syntax))]
    NoPresentationContext { abstract_syntax: String },

    #[snafu(display("state machine rejected this operation"))]
    InvalidState { source: connection::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    match uid {
        Cow::Borrowed(s) => Cow::Borrowed(s.trim_end_matches(['\0', ' '])),
        Cow::Owned(s) => Cow::Owned(s.trim_end_matches(['\0', ' ']).to_owned()),
    }
}

/// A negotiated presentation context: the accepted transfer syntax for
/// one proposed abstract syntax, keyed by its presentation context ID.
#[derive(Debug, Clone)]
pub struct NegotiatedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// An established DICOM Upper Layer association, usable by either the
/// requester or the acceptor once negotiation has completed.
pub struct Association {
    connection: Connection,
    contexts: BTreeMap<u8, NegotiatedContext>,
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association")
            .field("connection", &self.connection)
            .field("contexts", &self.contexts)
            .finish()
    }
}

impl Association {
    /// The presentation contexts agreed during negotiation.
    pub fn presentation_contexts(&self) -> impl Iterator<Item = &NegotiatedContext> {
        self.contexts.values()
    }

    /// Find the negotiated context for `abstract_syntax`, if any.
    pub fn find_presentation_context(&self, abstract_syntax: &str) -> Option<&NegotiatedContext> {
        self.contexts
            .values()
            .find(|c| c.abstract_syntax == abstract_syntax)
    }

    fn context_or_err(&self, abstract_syntax: &str) -> Result<&NegotiatedContext> {
        self.find_presentation_context(abstract_syntax)
            .context(NoPresentationContextSnafu {
                abstract_syntax: abstract_syntax.to_owned(),
            })
    }

    /// Send one or more PDV fragments as a P-DATA-TF PDU. Drives AE-9.
    #[instrument(skip(self, data))]
    pub fn send_data(&self, data: Vec<PDataValue>) -> Result<()> {
        self.connection.drive(Event::DataRequest).context(InvalidStateSnafu)?;
        self.connection
            .send_pdu(&Pdu::PData { data })
            .context(SendSnafu)
    }

    /// Receive the next PDU from the peer. Drives AE-10 for P-DATA-TF.
    pub fn receive(&self) -> Result<Pdu> {
        let pdu = self.connection.read_pdu().context(ReceiveSnafu)?;
        if let Pdu::PData { .. } = &pdu {
            self.connection.drive(Event::DataReceived).context(InvalidStateSnafu)?;
        }
        Ok(pdu)
    }

    /// Gracefully release the association. Drives AE-11, awaits
    /// A-RELEASE-RP, drives AE-13 and closes the transport.
    pub fn release(&self) -> Result<()> {
        self.connection.drive(Event::ReleaseRequest).context(InvalidStateSnafu)?;
        self.connection.send_pdu(&Pdu::ReleaseRQ).context(SendSnafu)?;
        let pdu = self.connection.read_pdu().context(ReceiveSnafu)?;
        match pdu {
            Pdu::ReleaseRP => {
                self.connection.drive(Event::ReleaseRpReceived).context(InvalidStateSnafu)?;
            }
            other => return UnexpectedPduSnafu { pdu: other }.fail(),
        }
        self.connection.close().context(SetupSnafu)?;
        Ok(())
    }

    /// Respond to a peer-initiated release. Drives AE-12 then AE-14.
    pub fn accept_release(&self) -> Result<()> {
        self.connection.drive(Event::ReleaseRqReceived).context(InvalidStateSnafu)?;
        self.connection.drive(Event::ReleaseResponse).context(InvalidStateSnafu)?;
        self.connection.send_pdu(&Pdu::ReleaseRP).context(SendSnafu)?;
        self.connection.close().context(SetupSnafu)?;
        Ok(())
    }

    /// Abort the association. Drives AE-15, sends A-ABORT, closes.
    pub fn abort(&self, source: AbortSource) -> Result<()> {
        self.connection.drive(Event::AbortRequest).context(InvalidStateSnafu)?;
        self.connection
            .send_pdu(&Pdu::Abort { source })
            .context(SendSnafu)?;
        self.connection.close().context(SetupSnafu)?;
        Ok(())
    }

    pub fn max_pdu_length(&self) -> u32 {
        self.connection.max_pdu_length()
    }
}

/// A requested presentation context, proposing one abstract syntax and
/// the transfer syntaxes accepted for it, in preference order.
#[derive(Debug, Clone)]
pub struct ProposedPresentationContext {
    pub abstract_syntax: Cow<'static, str>,
    pub transfer_syntaxes: Vec<Cow<'static, str>>,
}

/// Builder for a requester-side association, mirroring the teacher's
/// `ClientAssociationOptions` pattern: chained `with_*` calls terminated
/// by [`establish`][ClientAssociationOptions::establish].
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    calling_ae_title: Cow<'static, str>,
    called_ae_title: Cow<'static, str>,
    application_context_name: Cow<'static, str>,
    proposed_contexts: Vec<ProposedPresentationContext>,
    protocol_version: u16,
    max_pdu_length: u32,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: DEFAULT_APPLICATION_CONTEXT_NAME.into(),
            proposed_contexts: Vec::new(),
            protocol_version: 1,
            max_pdu_length: reader::DEFAULT_MAX_PDU,
        }
    }
}

impl ClientAssociationOptions {
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

    /// Propose an abstract syntax with the given transfer syntaxes, in
    /// preference order. Defaults to Explicit then Implicit VR Little
    /// Endian when `transfer_syntaxes` is empty.
    pub fn with_presentation_context<A>(
        mut self,
        abstract_syntax: A,
        transfer_syntaxes: Vec<Cow<'static, str>>,
    ) -> Self
    where
        A: Into<Cow<'static, str>>,
    {
        let transfer_syntaxes = if transfer_syntaxes.is_empty() {
            vec![EXPLICIT_VR_LITTLE_ENDIAN.into(), IMPLICIT_VR_LITTLE_ENDIAN.into()]
        } else {
            transfer_syntaxes
        };
        self.proposed_contexts.push(ProposedPresentationContext {
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes,
        });
        self
    }

    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Open the TCP connection and negotiate an association. Drives
    /// AE-1/AE-3, then AE-6 on acceptance or AE-7 on rejection.
    #[instrument(skip(self, address), fields(called_ae_title = %self.called_ae_title))]
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<Association> {
        ensure!(!self.proposed_contexts.is_empty(), MissingAbstractSyntaxSnafu);

        let proposed: Vec<PresentationContextProposed> = self
            .proposed_contexts
            .iter()
            .enumerate()
            .map(|(i, pc)| PresentationContextProposed {
                id: (i as u8) * 2 + 1,
                abstract_syntax: pc.abstract_syntax.to_string(),
                transfer_syntaxes: pc.transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
            })
            .collect();

        let stream = TcpStream::connect(address).context(ConnectSnafu)?;
        let connection = Connection::new(stream, self.max_pdu_length).context(SetupSnafu)?;
        connection.drive(Event::TransportConnectConfirmation).context(InvalidStateSnafu)?;
        connection.drive(Event::AssociateRequest).context(InvalidStateSnafu)?;

        let request = Pdu::AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: AeTitle::pad(&self.calling_ae_title),
            called_ae_title: AeTitle::pad(&self.called_ae_title),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts: proposed.clone(),
            user_variables: vec![UserVariableItem::MaxLength(self.max_pdu_length)],
        };
        connection.send_pdu(&request).context(SendSnafu)?;

        let response = connection.read_pdu().context(ReceiveSnafu)?;
        match response {
            Pdu::AssociationAC {
                presentation_contexts,
                user_variables,
                ..
            } => {
                connection.drive(Event::AssociateAcReceived).context(InvalidStateSnafu)?;
                let mut connection = connection;
                if let Some(UserVariableItem::MaxLength(peer_max)) = user_variables
                    .iter()
                    .find(|v| matches!(v, UserVariableItem::MaxLength(_)))
                {
                    connection.lower_max_pdu_length(*peer_max);
                }

                let mut contexts = BTreeMap::new();
                for result in presentation_contexts {
                    if result.reason != PresentationContextResultReason::Acceptance {
                        continue;
                    }
                    if let Some(original) = proposed.iter().find(|p| p.id == result.id) {
                        contexts.insert(
                            result.id,
                            NegotiatedContext {
                                id: result.id,
                                abstract_syntax: original.abstract_syntax.clone(),
                                transfer_syntax: result.transfer_syntax,
                            },
                        );
                    }
                }

                info!(accepted = contexts.len(), "association established");
                Ok(Association { connection, contexts })
            }
            Pdu::AssociationRJ { result, source } => {
                connection.drive(Event::AssociateRjReceived).context(InvalidStateSnafu)?;
                RejectedSnafu {
                    result,
                    source_: source,
                }
                .fail()
            }
            other => UnexpectedPduSnafu { pdu: other }.fail(),
        }
    }
}

/// The outcome of the acceptor's negotiation rule applied to a single
/// proposed presentation context.
fn negotiate_one(
    proposed: &PresentationContextProposed,
    supported: &BTreeMap<String, Vec<Cow<'static, str>>>,
) -> PresentationContextResult {
    let abstract_syntax = trim_uid(Cow::from(proposed.abstract_syntax.as_str()));
    let Some(accepted_transfer_syntaxes) = supported.get(abstract_syntax.as_ref()) else {
        return PresentationContextResult {
            id: proposed.id,
            reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
            transfer_syntax: String::new(),
        };
    };

    let chosen = proposed.transfer_syntaxes.iter().find(|ts| {
        let ts = trim_uid(Cow::from(ts.as_str()));
        accepted_transfer_syntaxes.iter().any(|s| s == ts.as_ref())
    });

    match chosen {
        Some(ts) => PresentationContextResult {
            id: proposed.id,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: ts.clone(),
        },
        None => PresentationContextResult {
            id: proposed.id,
            reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
            transfer_syntax: String::new(),
        },
    }
}

/// Builder for an acceptor-side association, mirroring the teacher's
/// `ServerAssociationOptions` pattern.
#[derive(Debug, Clone, Default)]
pub struct ServerAssociationOptions {
    ae_title: Cow<'static, str>,
    application_context_name: Cow<'static, str>,
    supported: BTreeMap<String, Vec<Cow<'static, str>>>,
    max_pdu_length: u32,
    promiscuous: bool,
}

impl ServerAssociationOptions {
    pub fn new() -> Self {
        ServerAssociationOptions {
            ae_title: "ANY-SCP".into(),
            application_context_name: DEFAULT_APPLICATION_CONTEXT_NAME.into(),
            supported: BTreeMap::new(),
            max_pdu_length: reader::DEFAULT_MAX_PDU,
            promiscuous: false,
        }
    }

    pub fn ae_title<T: Into<Cow<'static, str>>>(mut self, value: T) -> Self {
        self.ae_title = value.into();
        self
    }

    /// Accept `abstract_syntax` and negotiate the first of
    /// `transfer_syntaxes` (in the requester's preference order) that is
    /// also listed here.
    pub fn with_supported_abstract_syntax<A: Into<String>>(
        mut self,
        abstract_syntax: A,
        transfer_syntaxes: Vec<Cow<'static, str>>,
    ) -> Self {
        self.supported.insert(abstract_syntax.into(), transfer_syntaxes);
        self
    }

    /// Accept every proposed abstract syntax, negotiating Implicit VR
    /// Little Endian unconditionally. Useful for permissive test SCPs.
    pub fn promiscuous(mut self, value: bool) -> Self {
        self.promiscuous = value;
        self
    }

    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Bind a listener and accept a single incoming association.
    pub fn listen<A: ToSocketAddrs>(self, address: A) -> Result<AssociationListener> {
        let listener = TcpListener::bind(address).context(BindSnafu)?;
        Ok(AssociationListener {
            listener,
            options: self,
        })
    }

    /// Negotiate an association over an already-accepted stream. Drives
    /// AE-2, AE-8, and then AE-4. Always answers with an A-ASSOCIATE-AC,
    /// even when every proposed presentation context is rejected; callers
    /// find that out from an empty `Association::presentation_contexts()`.
    pub fn accept(&self, stream: TcpStream) -> Result<Association> {
        let connection = Connection::new(stream, self.max_pdu_length).context(SetupSnafu)?;
        connection.drive(Event::TransportConnectIndication).context(InvalidStateSnafu)?;

        let request = connection.read_pdu().context(ReceiveSnafu)?;
        let (calling_ae_title, called_ae_title, proposed_contexts, peer_max) = match request {
            Pdu::AssociationRQ {
                calling_ae_title,
                called_ae_title,
                presentation_contexts,
                user_variables,
                ..
            } => {
                connection.drive(Event::AssociateRqReceived).context(InvalidStateSnafu)?;
                let peer_max = user_variables.iter().find_map(|v| match v {
                    UserVariableItem::MaxLength(value) => Some(*value),
                    _ => None,
                });
                (calling_ae_title, called_ae_title, presentation_contexts, peer_max)
            }
            other => return UnexpectedPduSnafu { pdu: other }.fail(),
        };

        let results: Vec<PresentationContextResult> = if self.promiscuous {
            proposed_contexts
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: pc
                        .transfer_syntaxes
                        .first()
                        .cloned()
                        .unwrap_or_else(|| IMPLICIT_VR_LITTLE_ENDIAN.to_string()),
                })
                .collect()
        } else {
            proposed_contexts
                .iter()
                .map(|pc| negotiate_one(pc, &self.supported))
                .collect()
        };

        connection.drive(Event::AssociateAccept).context(InvalidStateSnafu)?;
        let mut connection = connection;
        let effective_max = match peer_max {
            Some(peer_max) => {
                connection.lower_max_pdu_length(peer_max);
                connection.max_pdu_length()
            }
            None => connection.max_pdu_length(),
        };

        connection
            .send_pdu(&Pdu::AssociationAC {
                protocol_version: 1,
                calling_ae_title,
                called_ae_title: AeTitle::pad(&self.ae_title),
                application_context_name: self.application_context_name.to_string(),
                presentation_contexts: results.clone(),
                user_variables: vec![UserVariableItem::MaxLength(effective_max)],
            })
            .context(SendSnafu)?;

        let mut contexts = BTreeMap::new();
        for result in &results {
            if result.reason != PresentationContextResultReason::Acceptance {
                continue;
            }
            if let Some(proposed) = proposed_contexts.iter().find(|p| p.id == result.id) {
                contexts.insert(
                    result.id,
                    NegotiatedContext {
                        id: result.id,
                        abstract_syntax: proposed.abstract_syntax.clone(),
                        transfer_syntax: result.transfer_syntax.clone(),
                    },
                );
            }
        }

        let _ = calling_ae_title;
        Ok(Association { connection, contexts })
    }
}

/// A bound listener ready to accept incoming associations one at a time.
pub struct AssociationListener {
    listener: TcpListener,
    options: ServerAssociationOptions,
}

impl AssociationListener {
    /// Block until an incoming connection arrives and negotiate it.
    pub fn accept(&self) -> Result<Association> {
        let (stream, _addr) = self.listener.accept().context(AcceptSnafu)?;
        self.options.accept(stream)
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}
