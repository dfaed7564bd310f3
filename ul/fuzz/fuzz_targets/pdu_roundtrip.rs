#![no_main]
use std::error::Error;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, &[u8])| {
    let (maxlen, data) = data;
    let _ = fuzz(maxlen, data);
});

fn fuzz(maxlen: u32, mut data: &[u8]) -> Result<(), Box<dyn Error>> {
    // A valid maxlen is always at least large enough to carry a bare PDU
    // header; this mirrors the floor Connection enforces before a read.
    let maxlen = maxlen.max(dicom_ul::pdu::PDU_HEADER_LENGTH);

    let pdu = dicom_ul::pdu::read_pdu(&mut data, maxlen)?;

    let mut bytes = Vec::new();
    dicom_ul::pdu::write_pdu(&mut bytes, &pdu)?;

    let pdu2 = dicom_ul::pdu::read_pdu(&mut bytes.as_slice(), dicom_ul::pdu::MAX_PDU_LENGTH)
        .expect("a PDU this crate just wrote should always decode");

    assert_eq!(
        pdu, pdu2,
        "pdu should be equal after serializing to/from bytes"
    );

    Ok(())
}
