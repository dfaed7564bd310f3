use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use dicom_ul::association::{ClientAssociationOptions, ServerAssociationOptions};
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};

const VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

#[test]
fn establishes_and_releases_an_association() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let options = ServerAssociationOptions::new()
            .ae_title("THIS-SCP")
            .with_supported_abstract_syntax(
                VERIFICATION_SOP_CLASS,
                vec![IMPLICIT_VR_LE.into()],
            );
        let association = options.accept(stream).unwrap();
        assert_eq!(association.presentation_contexts().count(), 1);
        let pdu = association.receive().unwrap();
        assert!(matches!(pdu, Pdu::ReleaseRQ));
        association.accept_release().unwrap();
    });

    thread::sleep(Duration::from_millis(10));

    let association = ClientAssociationOptions::new()
        .calling_ae_title("THIS-SCU")
        .called_ae_title("THIS-SCP")
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE.into()])
        .establish(addr)
        .unwrap();

    let context = association
        .find_presentation_context(VERIFICATION_SOP_CLASS)
        .expect("abstract syntax should have been accepted");
    assert_eq!(context.transfer_syntax, IMPLICIT_VR_LE);

    association.release().unwrap();
    server.join().unwrap();
}

#[test]
fn accepts_association_with_an_unsupported_context_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let options = ServerAssociationOptions::new()
            .ae_title("THIS-SCP")
            .with_supported_abstract_syntax("1.2.840.10008.5.1.4.1.1.7", vec![IMPLICIT_VR_LE.into()]);
        let association = options.accept(stream).unwrap();
        assert_eq!(association.presentation_contexts().count(), 0);
        let pdu = association.receive().unwrap();
        assert!(matches!(pdu, Pdu::ReleaseRQ));
        association.accept_release().unwrap();
    });

    thread::sleep(Duration::from_millis(10));

    let association = ClientAssociationOptions::new()
        .calling_ae_title("THIS-SCU")
        .called_ae_title("THIS-SCP")
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE.into()])
        .establish(addr)
        .unwrap();

    assert!(association.find_presentation_context(VERIFICATION_SOP_CLASS).is_none());

    association.release().unwrap();
    server.join().unwrap();
}

#[test]
fn exchanges_p_data_after_establishment() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let options = ServerAssociationOptions::new()
            .ae_title("THIS-SCP")
            .with_supported_abstract_syntax(
                VERIFICATION_SOP_CLASS,
                vec![IMPLICIT_VR_LE.into()],
            );
        let association = options.accept(stream).unwrap();
        let pdu = association.receive().unwrap();
        match pdu {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].data, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected PDU: {:?}", other),
        }
        let release = association.receive().unwrap();
        assert!(matches!(release, Pdu::ReleaseRQ));
        association.accept_release().unwrap();
    });

    thread::sleep(Duration::from_millis(10));

    let association = ClientAssociationOptions::new()
        .calling_ae_title("THIS-SCU")
        .called_ae_title("THIS-SCP")
        .with_presentation_context(VERIFICATION_SOP_CLASS, vec![IMPLICIT_VR_LE.into()])
        .establish(addr)
        .unwrap();

    let context = association
        .find_presentation_context(VERIFICATION_SOP_CLASS)
        .unwrap()
        .clone();

    association
        .send_data(vec![PDataValue {
            presentation_context_id: context.id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![1, 2, 3, 4],
        }])
        .unwrap();

    association.release().unwrap();
    server.join().unwrap();
}
