// Layout conformance tests for ABI stability across languages.
// These tests assert size, alignment, and field offsets for Envelope,
// and print the observed values to aid debugging on a given platform.
use dmxp_shmsg::SHM::Structs::{Envelope, ENVELOPE_SIZE};
use memoffset::offset_of;
use std::mem::{align_of, size_of};

#[cfg(target_pointer_width = "64")]
#[test]
fn test_envelope_layout() {
    let raw = 8 + 8 + 4; // 20 bytes of fields
    let aligned = (raw + 7) & !7; // round up to 8-byte multiple => 24

    let size = size_of::<Envelope>();
    let align = align_of::<Envelope>();
    let off_payload_size = offset_of!(Envelope, payload_size);
    let off_handle = offset_of!(Envelope, handle);
    let off_region_id = offset_of!(Envelope, region_id);

    println!(
        "Envelope => size: {size}, expected: {aligned}, align: {align}, offsets: [payload_size:{off_payload_size}, handle:{off_handle}, region_id:{off_region_id}]"
    );

    assert_eq!(size, aligned);
    assert_eq!(size, ENVELOPE_SIZE);
    assert_eq!(align, align_of::<u64>());
    assert_eq!(off_payload_size, 0);
    assert_eq!(off_handle, 8);
    assert_eq!(off_region_id, 16);
}

#[test]
fn test_encoded_field_positions() {
    // Wire positions match the struct offsets, little-endian
    let bytes = Envelope::new(0x0102, 0x0304, 0x05).encode();
    assert_eq!(bytes.len(), ENVELOPE_SIZE);
    assert_eq!(&bytes[0..2], &[0x02, 0x01]);
    assert_eq!(&bytes[8..10], &[0x04, 0x03]);
    assert_eq!(bytes[16], 0x05);
    // Padding is zeroed so envelopes compare byte-for-byte
    assert_eq!(&bytes[20..24], &[0, 0, 0, 0]);
}
