//! PDU encoding.

use std::io::Write;

use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ResultExt, Snafu};

use super::{
    AbortServiceProviderReason, AbortSource, AssociationRJResult, AssociationRJSource,
    AssociationRJServiceProviderAcseReason, AssociationRJServiceProviderPresentationReason,
    AssociationRJServiceUserReason, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserVariableItem,
};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not write PDU field `{}`", field))]
    WriteField {
        field: &'static str,
        source: std::io::Error,
    },

    #[snafu(display("could not encode text field `{}`", field))]
    EncodeText {
        field: &'static str,
        source: dicom_encoding::text::EncodeTextError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Encode and write `pdu` to `writer`.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    // Encode the body first so that the 4-byte length prefix can be
    // computed without a second pass over the stream.
    let mut body = Vec::new();
    let pdu_type = match pdu {
        Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            write_associate_body(
                &mut body,
                *protocol_version,
                called_ae_title.as_bytes(),
                calling_ae_title.as_bytes(),
                application_context_name,
                |out| write_presentation_contexts_rq(out, presentation_contexts),
                user_variables,
            )?;
            0x01
        }
        Pdu::AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            write_associate_body(
                &mut body,
                *protocol_version,
                called_ae_title.as_bytes(),
                calling_ae_title.as_bytes(),
                application_context_name,
                |out| write_presentation_contexts_ac(out, presentation_contexts),
                user_variables,
            )?;
            0x02
        }
        Pdu::AssociationRJ { result, source } => {
            write_associate_rj(&mut body, *result, *source)?;
            0x03
        }
        Pdu::PData { data } => {
            for value in data {
                let item_len = value.data.len() as u32 + 2;
                body.write_u32::<BigEndian>(item_len)
                    .context(WriteFieldSnafu { field: "pdv-length" })?;
                body.write_u8(value.presentation_context_id)
                    .context(WriteFieldSnafu { field: "pdv-context-id" })?;
                let mut control = match value.value_type {
                    PDataValueType::Command => 0x01,
                    PDataValueType::Data => 0x00,
                };
                if value.is_last {
                    control |= 0x02;
                }
                body.write_u8(control)
                    .context(WriteFieldSnafu { field: "pdv-control-header" })?;
                body.write_all(&value.data)
                    .context(WriteFieldSnafu { field: "pdv-data" })?;
            }
            0x04
        }
        Pdu::ReleaseRQ => {
            body.write_all(&[0u8; 4])
                .context(WriteFieldSnafu { field: "reserved" })?;
            0x05
        }
        Pdu::ReleaseRP => {
            body.write_all(&[0u8; 4])
                .context(WriteFieldSnafu { field: "reserved" })?;
            0x06
        }
        Pdu::Abort { source } => {
            write_abort(&mut body, *source)?;
            0x07
        }
    };

    writer
        .write_u8(pdu_type)
        .context(WriteFieldSnafu { field: "pdu-type" })?;
    writer
        .write_u8(0)
        .context(WriteFieldSnafu { field: "reserved" })?;
    writer
        .write_u32::<BigEndian>(body.len() as u32)
        .context(WriteFieldSnafu { field: "length" })?;
    writer
        .write_all(&body)
        .context(WriteFieldSnafu { field: "body" })?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_associate_body(
    out: &mut Vec<u8>,
    protocol_version: u16,
    called_ae_title: &[u8; 16],
    calling_ae_title: &[u8; 16],
    application_context_name: &str,
    write_presentation_contexts: impl FnOnce(&mut Vec<u8>) -> Result<()>,
    user_variables: &[UserVariableItem],
) -> Result<()> {
    out.write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu { field: "protocol-version" })?;
    out.write_u16::<BigEndian>(0)
        .context(WriteFieldSnafu { field: "reserved" })?;
    out.write_all(called_ae_title)
        .context(WriteFieldSnafu { field: "called-ae-title" })?;
    out.write_all(calling_ae_title)
        .context(WriteFieldSnafu { field: "calling-ae-title" })?;
    out.write_all(&[0u8; 32])
        .context(WriteFieldSnafu { field: "reserved" })?;

    write_text_item(out, 0x10, application_context_name, "application-context-name")?;
    write_presentation_contexts(out)?;
    write_user_information(out, user_variables)?;
    Ok(())
}

fn write_text_item(out: &mut Vec<u8>, item_type: u8, text: &str, field: &'static str) -> Result<()> {
    let codec = DefaultCharacterSetCodec;
    let encoded = codec.encode(text).context(EncodeTextSnafu { field })?;
    out.write_u8(item_type)
        .context(WriteFieldSnafu { field: "item-type" })?;
    out.write_u8(0).context(WriteFieldSnafu { field: "reserved" })?;
    out.write_u16::<BigEndian>(encoded.len() as u16)
        .context(WriteFieldSnafu { field: "item-length" })?;
    out.write_all(&encoded)
        .context(WriteFieldSnafu { field: "item-body" })?;
    Ok(())
}

fn write_presentation_contexts_rq(
    out: &mut Vec<u8>,
    contexts: &[PresentationContextProposed],
) -> Result<()> {
    for pc in contexts {
        let mut item = Vec::new();
        item.write_u8(pc.id).context(WriteFieldSnafu { field: "pc-id" })?;
        item.write_all(&[0u8; 3])
            .context(WriteFieldSnafu { field: "reserved" })?;
        write_text_item(&mut item, 0x30, &pc.abstract_syntax, "abstract-syntax")?;
        for ts in &pc.transfer_syntaxes {
            write_text_item(&mut item, 0x40, ts, "transfer-syntax")?;
        }

        out.write_u8(0x20).context(WriteFieldSnafu { field: "item-type" })?;
        out.write_u8(0).context(WriteFieldSnafu { field: "reserved" })?;
        out.write_u16::<BigEndian>(item.len() as u16)
            .context(WriteFieldSnafu { field: "item-length" })?;
        out.write_all(&item)
            .context(WriteFieldSnafu { field: "item-body" })?;
    }
    Ok(())
}

fn write_presentation_contexts_ac(
    out: &mut Vec<u8>,
    contexts: &[PresentationContextResult],
) -> Result<()> {
    for pc in contexts {
        let mut item = Vec::new();
        item.write_u8(pc.id).context(WriteFieldSnafu { field: "pc-id" })?;
        item.write_u8(0).context(WriteFieldSnafu { field: "reserved" })?;
        item.write_u8(pc.reason as u8)
            .context(WriteFieldSnafu { field: "pc-result" })?;
        item.write_u8(0).context(WriteFieldSnafu { field: "reserved" })?;
        if pc.reason == PresentationContextResultReason::Acceptance {
            write_text_item(&mut item, 0x40, &pc.transfer_syntax, "transfer-syntax")?;
        }

        out.write_u8(0x21).context(WriteFieldSnafu { field: "item-type" })?;
        out.write_u8(0).context(WriteFieldSnafu { field: "reserved" })?;
        out.write_u16::<BigEndian>(item.len() as u16)
            .context(WriteFieldSnafu { field: "item-length" })?;
        out.write_all(&item)
            .context(WriteFieldSnafu { field: "item-body" })?;
    }
    Ok(())
}

fn write_user_information(out: &mut Vec<u8>, vars: &[UserVariableItem]) -> Result<()> {
    if vars.is_empty() {
        return Ok(());
    }
    let mut item = Vec::new();
    for var in vars {
        match var {
            UserVariableItem::MaxLength(value) => {
                item.write_u8(0x51).context(WriteFieldSnafu { field: "item-type" })?;
                item.write_u8(0).context(WriteFieldSnafu { field: "reserved" })?;
                item.write_u16::<BigEndian>(4)
                    .context(WriteFieldSnafu { field: "item-length" })?;
                item.write_u32::<BigEndian>(*value)
                    .context(WriteFieldSnafu { field: "max-pdu-length" })?;
            }
            UserVariableItem::ImplementationClassUid(uid) => {
                write_text_item(&mut item, 0x52, uid, "implementation-class-uid")?;
            }
            UserVariableItem::ImplementationVersionName(name) => {
                write_text_item(&mut item, 0x55, name, "implementation-version-name")?;
            }
            UserVariableItem::Unknown(item_type, data) => {
                item.write_u8(*item_type)
                    .context(WriteFieldSnafu { field: "item-type" })?;
                item.write_u8(0).context(WriteFieldSnafu { field: "reserved" })?;
                item.write_u16::<BigEndian>(data.len() as u16)
                    .context(WriteFieldSnafu { field: "item-length" })?;
                item.write_all(data)
                    .context(WriteFieldSnafu { field: "item-body" })?;
            }
        }
    }

    out.write_u8(0x50).context(WriteFieldSnafu { field: "item-type" })?;
    out.write_u8(0).context(WriteFieldSnafu { field: "reserved" })?;
    out.write_u16::<BigEndian>(item.len() as u16)
        .context(WriteFieldSnafu { field: "item-length" })?;
    out.write_all(&item)
        .context(WriteFieldSnafu { field: "item-body" })?;
    Ok(())
}

fn write_associate_rj(
    out: &mut Vec<u8>,
    result: AssociationRJResult,
    source: AssociationRJSource,
) -> Result<()> {
    let result_byte = match result {
        AssociationRJResult::Permanent => 1u8,
        AssociationRJResult::Transient => 2u8,
    };
    let (source_byte, reason_byte) = match source {
        AssociationRJSource::ServiceUser(reason) => {
            let reason = match reason {
                AssociationRJServiceUserReason::NoReasonGiven => 1,
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                AssociationRJServiceUserReason::CallingAeTitleNotRecognized => 3,
                AssociationRJServiceUserReason::CalledAeTitleNotRecognized => 7,
                AssociationRJServiceUserReason::Reserved(value) => value,
            };
            (1u8, reason)
        }
        AssociationRJSource::ServiceProviderAcse(reason) => {
            let reason = match reason {
                AssociationRJServiceProviderAcseReason::NoReasonGiven => 1,
                AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported => 2,
            };
            (2u8, reason)
        }
        AssociationRJSource::ServiceProviderPresentation(reason) => {
            let reason = match reason {
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                AssociationRJServiceProviderPresentationReason::Reserved(value) => value,
            };
            (3u8, reason)
        }
    };

    out.write_u8(0).context(WriteFieldSnafu { field: "reserved" })?;
    out.write_u8(result_byte)
        .context(WriteFieldSnafu { field: "result" })?;
    out.write_u8(source_byte)
        .context(WriteFieldSnafu { field: "source" })?;
    out.write_u8(reason_byte)
        .context(WriteFieldSnafu { field: "reason" })?;
    Ok(())
}

fn write_abort(out: &mut Vec<u8>, source: AbortSource) -> Result<()> {
    let (source_byte, reason_byte) = match source {
        AbortSource::ServiceUser => (0u8, 0u8),
        AbortSource::Reserved(value) => (value, 0),
        AbortSource::ServiceProvider(reason) => {
            let reason = match reason {
                AbortServiceProviderReason::ReasonNotSpecified => 0,
                AbortServiceProviderReason::UnexpectedPdu => 1,
                AbortServiceProviderReason::Reserved => 2,
                AbortServiceProviderReason::UnrecognizedPduParameter => 3,
                AbortServiceProviderReason::UnexpectedPduParameter => 4,
                AbortServiceProviderReason::InvalidPduParameter => 5,
            };
            (2u8, reason)
        }
    };

    out.write_u16::<BigEndian>(0)
        .context(WriteFieldSnafu { field: "reserved" })?;
    out.write_u8(source_byte)
        .context(WriteFieldSnafu { field: "source" })?;
    out.write_u8(reason_byte)
        .context(WriteFieldSnafu { field: "reason" })?;
    Ok(())
}
