use super::*;

fn sample_associate_rq() -> Pdu {
    Pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: AeTitle::pad("SCU_AE"),
        called_ae_title: AeTitle::pad("SCP_AE"),
        application_context_name: "1.2.840.10008.3.1.1.1".to_owned(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_owned(),
            transfer_syntaxes: vec![
                "1.2.840.10008.1.2".to_owned(),
                "1.2.840.10008.1.2.1".to_owned(),
            ],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUid("1.2.276.0.7230010.3.0.3.6.8".to_owned()),
            UserVariableItem::ImplementationVersionName("OUR_IMPL_001".to_owned()),
        ],
    }
}

fn sample_associate_ac() -> Pdu {
    Pdu::AssociationAC {
        protocol_version: 1,
        calling_ae_title: AeTitle::pad("SCU_AE"),
        called_ae_title: AeTitle::pad("SCP_AE"),
        application_context_name: "1.2.840.10008.3.1.1.1".to_owned(),
        presentation_contexts: vec![PresentationContextResult {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: "1.2.840.10008.1.2".to_owned(),
        }],
        user_variables: vec![UserVariableItem::MaxLength(16_384)],
    }
}

fn round_trip(pdu: Pdu) {
    let mut buf = Vec::new();
    write_pdu(&mut buf, &pdu).expect("encoding should succeed");
    let decoded = read_pdu(&mut std::io::Cursor::new(buf), MAX_PDU_LENGTH).expect("decoding should succeed");
    assert_eq!(decoded, pdu);
}

#[test]
fn round_trips_associate_rq() {
    round_trip(sample_associate_rq());
}

#[test]
fn round_trips_associate_ac() {
    round_trip(sample_associate_ac());
}

#[test]
fn round_trips_associate_rj() {
    round_trip(Pdu::AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
        ),
    });
}

#[test]
fn round_trips_p_data_single_fragment() {
    round_trip(Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![0x01, 0x02, 0x03, 0x04],
        }],
    });
}

#[test]
fn round_trips_p_data_multiple_pdvs() {
    round_trip(Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0xAA; 128],
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0xBB; 16],
            },
        ],
    });
}

#[test]
fn round_trips_release_rq_rp() {
    round_trip(Pdu::ReleaseRQ);
    round_trip(Pdu::ReleaseRP);
}

#[test]
fn round_trips_abort() {
    round_trip(Pdu::Abort {
        source: AbortSource::ServiceProvider(AbortServiceProviderReason::UnexpectedPdu),
    });
}

#[test]
fn rejects_pdv_length_over_max_pdu() {
    // Hand-build a P-DATA-TF PDU whose single PDV item claims a length
    // larger than the negotiated max, without ever allocating it.
    let mut buf = Vec::new();
    buf.push(0x04); // PDU type
    buf.push(0); // reserved
    let pdv_item_len: u32 = 1_000_000;
    let pdu_len = pdv_item_len + 4; // item length field + its own length prefix
    buf.extend_from_slice(&pdu_len.to_be_bytes());
    buf.extend_from_slice(&pdv_item_len.to_be_bytes());
    buf.push(1); // presentation context id
    buf.push(0x03); // control header: command, last fragment
    // Deliberately do not include the claimed payload; the reader must
    // reject this before trying to read it.
    buf.extend_from_slice(&[0u8; 8]);

    let result = read_pdu(&mut std::io::Cursor::new(buf), 16_384);
    assert!(result.is_err());
}

#[test]
fn rejects_unknown_pdu_type() {
    let mut buf = Vec::new();
    buf.push(0xFF);
    buf.push(0);
    buf.extend_from_slice(&0u32.to_be_bytes());

    let result = read_pdu(&mut std::io::Cursor::new(buf), MAX_PDU_LENGTH);
    assert!(result.is_err());
}

#[test]
fn ae_title_pads_and_trims() {
    let title = AeTitle::pad("SHORT");
    assert_eq!(title.trimmed(), "SHORT");
    assert_eq!(title.as_bytes().len(), 16);
    assert_eq!(&title.as_bytes()[5..], &[b' '; 11]);
}

#[test]
fn ae_title_truncates_long_input() {
    let title = AeTitle::pad("THIS_NAME_IS_DEFINITELY_TOO_LONG");
    assert_eq!(title.as_bytes().len(), 16);
    assert_eq!(title.trimmed(), "THIS_NAME_IS_DEF");
}
