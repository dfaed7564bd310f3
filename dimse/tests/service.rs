use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dicom_dimse::service::scp::{
    FindHandler, GetHandler, GetInstance, MoveHandler, MoveResult, ServerOptions, StoreHandler,
};
use dicom_dimse::service::scu::ClientOptions;
use dicom_dimse::service::VERIFICATION_SOP_CLASS_UID;

const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
const SECONDARY_CAPTURE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";

fn transfer_syntaxes() -> Vec<Cow<'static, str>> {
    vec![IMPLICIT_VR_LE.into()]
}

struct AlwaysSuccessStore {
    received: Mutex<Vec<(String, usize)>>,
}

impl StoreHandler for AlwaysSuccessStore {
    fn handle(&self, _sop_class_uid: &str, sop_instance_uid: &str, dataset: &[u8]) -> u16 {
        self.received
            .lock()
            .unwrap()
            .push((sop_instance_uid.to_owned(), dataset.len()));
        dicom_dimse::command::status::SUCCESS
    }
}

struct ThreeResultsFind;
impl FindHandler for ThreeResultsFind {
    fn handle(&self, _sop_class_uid: &str, _query: &[u8]) -> (Vec<Vec<u8>>, u16) {
        (
            vec![vec![1, 1], vec![2, 2], vec![3, 3]],
            dicom_dimse::command::status::SUCCESS,
        )
    }
}

struct OneInstanceGet;
impl GetHandler for OneInstanceGet {
    fn handle(&self, _sop_class_uid: &str, _query: &[u8]) -> (Vec<GetInstance>, u16) {
        (
            vec![GetInstance {
                sop_class_uid: SECONDARY_CAPTURE_SOP_CLASS.to_owned(),
                sop_instance_uid: "1.2.3.4.5".to_owned(),
                dataset: vec![0x42; 128],
            }],
            dicom_dimse::command::status::SUCCESS,
        )
    }
}

struct NoopMove;
impl MoveHandler for NoopMove {
    fn handle(&self, _destination: &str, _sop_class_uid: &str, _query: &[u8]) -> MoveResult {
        MoveResult {
            completed: 1,
            failed: 0,
            warning: 0,
            status: dicom_dimse::command::status::SUCCESS,
        }
    }
}

#[test]
fn echo_round_trips_successfully() {
    let server = Arc::new(
        ServerOptions::new()
            .ae_title("TEST-SCP")
            .with_supported_abstract_syntax(VERIFICATION_SOP_CLASS_UID, transfer_syntaxes())
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
        .with_presentation_context(VERIFICATION_SOP_CLASS_UID, transfer_syntaxes())
        .connect(addr)
        .unwrap();

    client.echo().unwrap();
    client.close().unwrap();

    server.shutdown(Duration::from_secs(2));
    server_thread.join().unwrap();
}

#[test]
fn store_reports_success_and_reaches_handler() {
    let handler = Arc::new(AlwaysSuccessStore {
        received: Mutex::new(Vec::new()),
    });
    let server = Arc::new(
        ServerOptions::new()
            .ae_title("TEST-SCP")
            .with_supported_abstract_syntax(SECONDARY_CAPTURE_SOP_CLASS, transfer_syntaxes())
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
        .with_presentation_context(SECONDARY_CAPTURE_SOP_CLASS, transfer_syntaxes())
        .max_pdu_length(4096)
        .connect(addr)
        .unwrap();

    let dataset = vec![0xCDu8; 50_000];
    client
        .store(SECONDARY_CAPTURE_SOP_CLASS, "1.2.3.4.5", dataset.clone())
        .unwrap();
    client.close().unwrap();

    server.shutdown(Duration::from_secs(2));
    server_thread.join().unwrap();

    let received = handler.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], ("1.2.3.4.5".to_owned(), dataset.len()));
}

#[test]
fn find_streams_three_pending_results() {
    let server = Arc::new(
        ServerOptions::new()
            .ae_title("TEST-SCP")
            .with_supported_abstract_syntax(SECONDARY_CAPTURE_SOP_CLASS, transfer_syntaxes())
            .find_handler(Arc::new(ThreeResultsFind))
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
        .with_presentation_context(SECONDARY_CAPTURE_SOP_CLASS, transfer_syntaxes())
        .connect(addr)
        .unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    {
        let results = Arc::clone(&results);
        client
            .find(SECONDARY_CAPTURE_SOP_CLASS, vec![0], |dataset| {
                results.lock().unwrap().push(dataset);
            })
            .unwrap();
    }
    client.close().unwrap();

    server.shutdown(Duration::from_secs(2));
    server_thread.join().unwrap();

    assert_eq!(results.lock().unwrap().len(), 3);
}

#[test]
fn get_drives_a_store_sub_operation() {
    let server = Arc::new(
        ServerOptions::new()
            .ae_title("TEST-SCP")
            .with_supported_abstract_syntax(SECONDARY_CAPTURE_SOP_CLASS, transfer_syntaxes())
            .get_handler(Arc::new(OneInstanceGet))
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
        .with_presentation_context(SECONDARY_CAPTURE_SOP_CLASS, transfer_syntaxes())
        .connect(addr)
        .unwrap();

    let stored = Arc::new(Mutex::new(Vec::new()));
    let counts = {
        let stored = Arc::clone(&stored);
        client
            .get(SECONDARY_CAPTURE_SOP_CLASS, vec![0], move |sop_class, sop_instance, dataset| {
                stored
                    .lock()
                    .unwrap()
                    .push((sop_class.to_owned(), sop_instance.to_owned(), dataset.len()));
                dicom_dimse::command::status::SUCCESS
            })
            .unwrap()
    };
    client.close().unwrap();

    server.shutdown(Duration::from_secs(2));
    server_thread.join().unwrap();

    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 0);
    assert_eq!(stored.lock().unwrap().len(), 1);
}

#[test]
fn move_reports_final_counts() {
    let server = Arc::new(
        ServerOptions::new()
            .ae_title("TEST-SCP")
            .with_supported_abstract_syntax(SECONDARY_CAPTURE_SOP_CLASS, transfer_syntaxes())
            .move_handler(Arc::new(NoopMove))
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
        .with_presentation_context(SECONDARY_CAPTURE_SOP_CLASS, transfer_syntaxes())
        .connect(addr)
        .unwrap();

    let outcome = client
        .move_instances(SECONDARY_CAPTURE_SOP_CLASS, "OTHER-SCP", vec![0])
        .unwrap();
    client.close().unwrap();

    server.shutdown(Duration::from_secs(2));
    server_thread.join().unwrap();

    assert_eq!(outcome.status, dicom_dimse::command::status::SUCCESS);
    assert_eq!(outcome.counts.completed, 1);
}
