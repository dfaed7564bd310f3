//! Exercises a real DICOM dataset, built and parsed through the
//! `dicom-object`/`dicom-core` stack, carried end to end over a C-STORE
//! exchange as an opaque payload from the DIMSE layer's point of view.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{mem::InMemDicomObject, StandardDataDictionary};

use dicom_dimse::service::scp::{ServerOptions, StoreHandler};
use dicom_dimse::service::scu::ClientOptions;

const SECONDARY_CAPTURE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

fn build_instance() -> InMemDicomObject<StandardDataDictionary> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, SECONDARY_CAPTURE_SOP_CLASS),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, "1.2.3.4.5.6"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from("Doe^Jane"),
    ));
    obj
}

struct DecodingStore {
    decoded_patient_name: Mutex<Option<String>>,
}

impl StoreHandler for DecodingStore {
    fn handle(&self, _sop_class_uid: &str, _sop_instance_uid: &str, dataset: &[u8]) -> u16 {
        let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
        match InMemDicomObject::<StandardDataDictionary>::read_dataset_with_ts(dataset, &ts) {
            Ok(obj) => {
                let name = obj
                    .element(tags::PATIENT_NAME)
                    .ok()
                    .and_then(|e| e.to_str().ok().map(|s| s.into_owned()));
                *self.decoded_patient_name.lock().unwrap() = name;
                dicom_dimse::command::status::SUCCESS
            }
            Err(_) => dicom_dimse::command::status::DEFAULT_FAILURE,
        }
    }
}

#[test]
fn a_real_dataset_survives_fragmentation_and_reassembly() {
    let handler = Arc::new(DecodingStore {
        decoded_patient_name: Mutex::new(None),
    });

    let server = Arc::new(
        ServerOptions::new()
            .ae_title("TEST-SCP")
            .with_supported_abstract_syntax(
                SECONDARY_CAPTURE_SOP_CLASS,
                vec![Cow::Borrowed(IMPLICIT_VR_LE)],
            )
            .store_handler(Arc::clone(&handler) as Arc<dyn StoreHandler>)
            .listen("127.0.0.1:0")
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();

    let server_thread = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.serve().unwrap())
    };
    thread::sleep(Duration::from_millis(20));

    let client = ClientOptions::new()
        .calling_ae_title("TEST-SCU")
        .called_ae_title("TEST-SCP")
        .with_presentation_context(SECONDARY_CAPTURE_SOP_CLASS, vec![Cow::Borrowed(IMPLICIT_VR_LE)])
        .max_pdu_length(256)
        .connect(addr)
        .unwrap();

    let instance = build_instance();
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut dataset_bytes = Vec::new();
    instance.write_dataset_with_ts(&mut dataset_bytes, &ts).unwrap();

    client
        .store(SECONDARY_CAPTURE_SOP_CLASS, "1.2.3.4.5.6", dataset_bytes)
        .unwrap();
    client.close().unwrap();

    server.shutdown(Duration::from_secs(2));
    server_thread.join().unwrap();

    assert_eq!(
        handler.decoded_patient_name.lock().unwrap().as_deref(),
        Some("Doe^Jane")
    );
}
