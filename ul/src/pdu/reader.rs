//! PDU decoding.

use std::io::{Cursor, ErrorKind, Read};

use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};

use super::{
    AbortServiceProviderReason, AbortSource, AeTitle, AssociationRJResult,
    AssociationRJServiceProviderAcseReason, AssociationRJServiceProviderPresentationReason,
    AssociationRJServiceUserReason, AssociationRJSource, PDataValue, PDataValueType, Pdu,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    UserVariableItem, MAX_PDU_LENGTH,
};

/// The default maximum PDU length advertised by a fresh association.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("no PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("could not read PDU field `{}`", field))]
    ReadField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDU claims length {} which exceeds the maximum of {}",
        length,
        max_pdu_length
    ))]
    PduTooLarge {
        length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDV item claims length {} which exceeds the maximum PDU length of {}",
        length,
        max_pdu_length
    ))]
    PdvTooLarge {
        length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown PDU type {:#04x}", pdu_type))]
    UnknownPduType { pdu_type: u8, backtrace: Backtrace },

    #[snafu(display("missing application context name"))]
    MissingApplicationContext { backtrace: Backtrace },

    #[snafu(display("missing abstract syntax in presentation context"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("invalid presentation context result reason {}", value))]
    InvalidPresentationContextResult { value: u8, backtrace: Backtrace },

    #[snafu(display("invalid association rejection result/source/reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid abort source/reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("invalid sub-item type {:#04x} in this context", item_type))]
    InvalidSubItem { item_type: u8, backtrace: Backtrace },

    #[snafu(display("could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        source: dicom_encoding::text::DecodeTextError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Read one PDU from `reader`.
///
/// `max_pdu_length` is the maximum length this side is currently willing
/// to accept; any PDU (or PDV fragment within a P-DATA-TF PDU) claiming a
/// greater length is rejected *before* a buffer for its payload is
/// allocated, which is the load-bearing defense against a peer
/// advertising a tiny max PDU length and then sending an oversized claim.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32) -> Result<Pdu>
where
    R: Read,
{
    let mut header = [0u8; 2];
    if let Err(e) = reader.read_exact(&mut header) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadFieldSnafu { field: "pdu-type" });
    }
    let pdu_type = header[0];

    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadFieldSnafu { field: "length" })?;

    ensure!(
        pdu_length <= max_pdu_length.min(MAX_PDU_LENGTH),
        PduTooLargeSnafu {
            length: pdu_length,
            max_pdu_length,
        }
    );

    let mut body = vec![0u8; pdu_length as usize];
    reader
        .read_exact(&mut body)
        .context(ReadFieldSnafu { field: "body" })?;
    let mut cursor = Cursor::new(body);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => read_associate_rq(&mut cursor, &codec),
        0x02 => read_associate_ac(&mut cursor, &codec),
        0x03 => read_associate_rj(&mut cursor),
        0x04 => read_p_data(&mut cursor, max_pdu_length),
        0x05 => Ok(Pdu::ReleaseRQ),
        0x06 => Ok(Pdu::ReleaseRP),
        0x07 => read_abort(&mut cursor),
        other => UnknownPduTypeSnafu { pdu_type: other }.fail(),
    }
}

fn read_ae_title<R: Read>(cursor: &mut R) -> Result<AeTitle> {
    let mut bytes = [0u8; 16];
    cursor
        .read_exact(&mut bytes)
        .context(ReadFieldSnafu { field: "ae-title" })?;
    Ok(AeTitle::from_bytes(bytes))
}

fn skip_reserved<R: Read>(cursor: &mut R, n: usize) -> Result<()> {
    let mut buf = vec![0u8; n];
    cursor
        .read_exact(&mut buf)
        .context(ReadFieldSnafu { field: "reserved" })?;
    Ok(())
}

fn read_associate_rq(cursor: &mut Cursor<Vec<u8>>, codec: &dyn TextCodec) -> Result<Pdu> {
    let protocol_version = cursor
        .read_u16::<BigEndian>()
        .context(ReadFieldSnafu { field: "protocol-version" })?;
    skip_reserved(cursor, 2)?;
    let called_ae_title = read_ae_title(cursor)?;
    let calling_ae_title = read_ae_title(cursor)?;
    skip_reserved(cursor, 32)?;

    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while (cursor.position() as usize) < cursor.get_ref().len() {
        match read_variable_item(cursor, codec, true)? {
            VariableItem::ApplicationContext(name) => application_context_name = Some(name),
            VariableItem::PresentationContextProposed(pc) => presentation_contexts.push(pc),
            VariableItem::UserVariables(vars) => user_variables = vars,
            VariableItem::PresentationContextResult(_) => {
                return InvalidSubItemSnafu { item_type: 0x21u8 }.fail()
            }
        }
    }

    Ok(Pdu::AssociationRQ {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextSnafu)?,
        presentation_contexts,
        user_variables,
    })
}

fn read_associate_ac(cursor: &mut Cursor<Vec<u8>>, codec: &dyn TextCodec) -> Result<Pdu> {
    let protocol_version = cursor
        .read_u16::<BigEndian>()
        .context(ReadFieldSnafu { field: "protocol-version" })?;
    skip_reserved(cursor, 2)?;
    let called_ae_title = read_ae_title(cursor)?;
    let calling_ae_title = read_ae_title(cursor)?;
    skip_reserved(cursor, 32)?;

    let mut application_context_name = None;
    let mut presentation_contexts = Vec::new();
    let mut user_variables = Vec::new();

    while (cursor.position() as usize) < cursor.get_ref().len() {
        match read_variable_item(cursor, codec, false)? {
            VariableItem::ApplicationContext(name) => application_context_name = Some(name),
            VariableItem::PresentationContextResult(pc) => presentation_contexts.push(pc),
            VariableItem::UserVariables(vars) => user_variables = vars,
            VariableItem::PresentationContextProposed(_) => {
                return InvalidSubItemSnafu { item_type: 0x20u8 }.fail()
            }
        }
    }

    Ok(Pdu::AssociationAC {
        protocol_version,
        calling_ae_title,
        called_ae_title,
        application_context_name: application_context_name
            .context(MissingApplicationContextSnafu)?,
        presentation_contexts,
        user_variables,
    })
}

fn read_associate_rj(cursor: &mut Cursor<Vec<u8>>) -> Result<Pdu> {
    skip_reserved(cursor, 1)?;
    let result = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "result" })?;
    let source = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "source" })?;
    let reason = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "reason" })?;

    let result = match result {
        1 => AssociationRJResult::Permanent,
        2 => AssociationRJResult::Transient,
        _ => return InvalidRejectSourceOrReasonSnafu.fail(),
    };
    let source = match (source, reason) {
        (1, 1) => AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven),
        (1, 2) => AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
        ),
        (1, 3) => AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CallingAeTitleNotRecognized,
        ),
        (1, 7) => AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
        ),
        (1, other) => {
            AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::Reserved(other))
        }
        (2, 1) => AssociationRJSource::ServiceProviderAcse(
            AssociationRJServiceProviderAcseReason::NoReasonGiven,
        ),
        (2, 2) => AssociationRJSource::ServiceProviderAcse(
            AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
        ),
        (3, 1) => AssociationRJSource::ServiceProviderPresentation(
            AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
        ),
        (3, 2) => AssociationRJSource::ServiceProviderPresentation(
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
        ),
        (3, other) => AssociationRJSource::ServiceProviderPresentation(
            AssociationRJServiceProviderPresentationReason::Reserved(other),
        ),
        _ => return InvalidRejectSourceOrReasonSnafu.fail(),
    };

    Ok(Pdu::AssociationRJ { result, source })
}

fn read_abort(cursor: &mut Cursor<Vec<u8>>) -> Result<Pdu> {
    skip_reserved(cursor, 2)?;
    let source_byte = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "source" })?;
    let reason_byte = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "reason" })?;

    let source = match (source_byte, reason_byte) {
        (0, _) => AbortSource::ServiceUser,
        (2, 0) => AbortSource::ServiceProvider(AbortServiceProviderReason::ReasonNotSpecified),
        (2, 1) => AbortSource::ServiceProvider(AbortServiceProviderReason::UnexpectedPdu),
        (2, 2) => AbortSource::ServiceProvider(AbortServiceProviderReason::Reserved),
        (2, 3) => {
            AbortSource::ServiceProvider(AbortServiceProviderReason::UnrecognizedPduParameter)
        }
        (2, 4) => AbortSource::ServiceProvider(AbortServiceProviderReason::UnexpectedPduParameter),
        (2, 5) => AbortSource::ServiceProvider(AbortServiceProviderReason::InvalidPduParameter),
        (other, _) => AbortSource::Reserved(other),
    };
    let _ = source_byte;

    Ok(Pdu::Abort { source })
}

fn read_p_data(cursor: &mut Cursor<Vec<u8>>, max_pdu_length: u32) -> Result<Pdu> {
    let mut data = Vec::new();
    let total_len = cursor.get_ref().len() as u64;
    while cursor.position() < total_len {
        let item_length = cursor
            .read_u32::<BigEndian>()
            .context(ReadFieldSnafu { field: "pdv-length" })?;

        // Critical DoS defense: reject before allocating a buffer for
        // the claimed length.
        ensure!(
            item_length <= max_pdu_length,
            PdvTooLargeSnafu {
                length: item_length,
                max_pdu_length,
            }
        );

        let presentation_context_id = cursor
            .read_u8()
            .context(ReadFieldSnafu { field: "pdv-context-id" })?;
        let control_header = cursor
            .read_u8()
            .context(ReadFieldSnafu { field: "pdv-control-header" })?;

        let value_type = if control_header & 0x01 != 0 {
            PDataValueType::Command
        } else {
            PDataValueType::Data
        };
        let is_last = control_header & 0x02 != 0;

        // item_length counts the context-id and control-header bytes too.
        let payload_len = item_length.saturating_sub(2) as usize;
        let remaining = (total_len - cursor.position()) as usize;
        ensure!(
            payload_len <= remaining,
            PdvTooLargeSnafu {
                length: item_length,
                max_pdu_length,
            }
        );
        let mut payload = vec![0u8; payload_len];
        cursor
            .read_exact(&mut payload)
            .context(ReadFieldSnafu { field: "pdv-data" })?;

        data.push(PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            data: payload,
        });
    }

    Ok(Pdu::PData { data })
}

enum VariableItem {
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

fn read_variable_item(
    cursor: &mut Cursor<Vec<u8>>,
    codec: &dyn TextCodec,
    is_request: bool,
) -> Result<VariableItem> {
    let item_type = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "item-type" })?;
    skip_reserved(cursor, 1)?;
    let item_length = cursor
        .read_u16::<BigEndian>()
        .context(ReadFieldSnafu { field: "item-length" })?;
    let mut body = vec![0u8; item_length as usize];
    cursor
        .read_exact(&mut body)
        .context(ReadFieldSnafu { field: "item-body" })?;
    let mut item_cursor = Cursor::new(body);

    match item_type {
        0x10 => {
            let text = read_text(&mut item_cursor, codec, "application-context-name")?;
            Ok(VariableItem::ApplicationContext(text))
        }
        0x20 if is_request => {
            let pc = read_presentation_context_proposed(&mut item_cursor, codec)?;
            Ok(VariableItem::PresentationContextProposed(pc))
        }
        0x21 if !is_request => {
            let pc = read_presentation_context_result(&mut item_cursor, codec)?;
            Ok(VariableItem::PresentationContextResult(pc))
        }
        0x50 => {
            let vars = read_user_information(&mut item_cursor)?;
            Ok(VariableItem::UserVariables(vars))
        }
        other => InvalidSubItemSnafu { item_type: other }.fail(),
    }
}

fn read_text(
    cursor: &mut Cursor<Vec<u8>>,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String> {
    let bytes = &cursor.get_ref()[cursor.position() as usize..];
    let text = codec.decode(bytes).context(DecodeTextSnafu { field })?;
    Ok(text.trim_end_matches(['\0', ' ']).to_string())
}

fn read_presentation_context_proposed(
    cursor: &mut Cursor<Vec<u8>>,
    codec: &dyn TextCodec,
) -> Result<PresentationContextProposed> {
    let id = cursor.read_u8().context(ReadFieldSnafu { field: "pc-id" })?;
    skip_reserved(cursor, 3)?;

    let mut abstract_syntax = None;
    let mut transfer_syntaxes = Vec::new();
    let total_len = cursor.get_ref().len() as u64;
    while cursor.position() < total_len {
        let sub_type = cursor
            .read_u8()
            .context(ReadFieldSnafu { field: "pc-sub-item-type" })?;
        skip_reserved(cursor, 1)?;
        let sub_len = cursor
            .read_u16::<BigEndian>()
            .context(ReadFieldSnafu { field: "pc-sub-item-length" })?;
        let mut sub_body = vec![0u8; sub_len as usize];
        cursor
            .read_exact(&mut sub_body)
            .context(ReadFieldSnafu { field: "pc-sub-item-body" })?;
        let text = codec
            .decode(&sub_body)
            .context(DecodeTextSnafu { field: "syntax-uid" })?
            .trim_end_matches(['\0', ' '])
            .to_string();
        match sub_type {
            0x30 => abstract_syntax = Some(text),
            0x40 => transfer_syntaxes.push(text),
            other => return InvalidSubItemSnafu { item_type: other }.fail(),
        }
    }

    Ok(PresentationContextProposed {
        id,
        abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
        transfer_syntaxes,
    })
}

fn read_presentation_context_result(
    cursor: &mut Cursor<Vec<u8>>,
    codec: &dyn TextCodec,
) -> Result<PresentationContextResult> {
    let id = cursor.read_u8().context(ReadFieldSnafu { field: "pc-id" })?;
    skip_reserved(cursor, 1)?;
    let reason_byte = cursor
        .read_u8()
        .context(ReadFieldSnafu { field: "pc-result" })?;
    skip_reserved(cursor, 1)?;

    let reason = match reason_byte {
        0 => PresentationContextResultReason::Acceptance,
        1 => PresentationContextResultReason::UserRejection,
        2 => PresentationContextResultReason::NoReason,
        3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
        4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
        other => {
            return InvalidPresentationContextResultSnafu { value: other }.fail();
        }
    };

    let mut transfer_syntax = String::new();
    let total_len = cursor.get_ref().len() as u64;
    if cursor.position() < total_len {
        let sub_type = cursor
            .read_u8()
            .context(ReadFieldSnafu { field: "pc-sub-item-type" })?;
        skip_reserved(cursor, 1)?;
        let sub_len = cursor
            .read_u16::<BigEndian>()
            .context(ReadFieldSnafu { field: "pc-sub-item-length" })?;
        let mut sub_body = vec![0u8; sub_len as usize];
        cursor
            .read_exact(&mut sub_body)
            .context(ReadFieldSnafu { field: "pc-sub-item-body" })?;
        ensure!(sub_type == 0x40, InvalidSubItemSnafu { item_type: sub_type });
        transfer_syntax = codec
            .decode(&sub_body)
            .context(DecodeTextSnafu { field: "transfer-syntax-uid" })?
            .trim_end_matches(['\0', ' '])
            .to_string();
    }

    Ok(PresentationContextResult {
        id,
        reason,
        transfer_syntax,
    })
}

fn read_user_information(cursor: &mut Cursor<Vec<u8>>) -> Result<Vec<UserVariableItem>> {
    let mut vars = Vec::new();
    let total_len = cursor.get_ref().len() as u64;
    while cursor.position() < total_len {
        let item_type = cursor
            .read_u8()
            .context(ReadFieldSnafu { field: "user-item-type" })?;
        skip_reserved(cursor, 1)?;
        let item_length = cursor
            .read_u16::<BigEndian>()
            .context(ReadFieldSnafu { field: "user-item-length" })?;
        let mut body = vec![0u8; item_length as usize];
        cursor
            .read_exact(&mut body)
            .context(ReadFieldSnafu { field: "user-item-body" })?;

        match item_type {
            0x51 => {
                let mut c = Cursor::new(body);
                let value = c
                    .read_u32::<BigEndian>()
                    .context(ReadFieldSnafu { field: "max-pdu-length" })?;
                vars.push(UserVariableItem::MaxLength(value));
            }
            0x52 => {
                let text = String::from_utf8_lossy(&body).trim_end_matches(['\0', ' ']).to_string();
                vars.push(UserVariableItem::ImplementationClassUid(text));
            }
            0x55 => {
                let text = String::from_utf8_lossy(&body).trim_end_matches(['\0', ' ']).to_string();
                vars.push(UserVariableItem::ImplementationVersionName(text));
            }
            other => vars.push(UserVariableItem::Unknown(other, body)),
        }
    }
    Ok(vars)
}
