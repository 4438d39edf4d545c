//! Tests for primitive type encoding/decoding: integers, fixed arrays, strings.

use crate::encoding::*;

// ------------------------------------------------------------------------------------------------
// Integers
// ------------------------------------------------------------------------------------------------

#[test]
fn roundtrip_u8() {
    let bytes = encode_to_vec(&0xABu8).unwrap();
    assert_eq!(bytes, [0xAB]);
    let (decoded, consumed) = decode_from_slice::<u8>(&bytes).unwrap();
    assert_eq!(decoded, 0xAB);
    assert_eq!(consumed, 1);
}

#[test]
fn roundtrip_u32() {
    let val: u32 = 0xDEAD_BEEF;
    let bytes = encode_to_vec(&val).unwrap();
    assert_eq!(bytes, [0xEF, 0xBE, 0xAD, 0xDE]);
    let (decoded, consumed) = decode_from_slice::<u32>(&bytes).unwrap();
    assert_eq!(decoded, val);
    assert_eq!(consumed, 4);
}

#[test]
fn roundtrip_u64() {
    let val: u64 = 0x0102_0304_0506_0708;
    let bytes = encode_to_vec(&val).unwrap();
    assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    let (decoded, consumed) = decode_from_slice::<u64>(&bytes).unwrap();
    assert_eq!(decoded, val);
    assert_eq!(consumed, 8);
}

#[test]
fn u64_truncated_is_eof() {
    let err = decode_from_slice::<u64>(&[1, 2, 3]).unwrap_err();
    assert!(matches!(
        err,
        EncodingError::UnexpectedEof {
            needed: 8,
            available: 3
        }
    ));
}

// ------------------------------------------------------------------------------------------------
// Fixed arrays
// ------------------------------------------------------------------------------------------------

#[test]
fn roundtrip_magic_array() {
    let bytes = encode_to_vec(b"TDS1").unwrap();
    assert_eq!(bytes, b"TDS1");
    let (decoded, consumed) = decode_from_slice::<[u8; 4]>(&bytes).unwrap();
    assert_eq!(&decoded, b"TDS1");
    assert_eq!(consumed, 4);
}

// ------------------------------------------------------------------------------------------------
// Strings
// ------------------------------------------------------------------------------------------------

#[test]
fn roundtrip_string() {
    let bytes = encode_to_vec(&String::from("source_node_id")).unwrap();
    assert_eq!(&bytes[..4], &14u32.to_le_bytes());
    let (decoded, consumed) = decode_from_slice::<String>(&bytes).unwrap();
    assert_eq!(decoded, "source_node_id");
    assert_eq!(consumed, 18);
}

#[test]
fn string_invalid_utf8() {
    let mut buf = 2u32.to_le_bytes().to_vec();
    buf.extend_from_slice(&[0xFF, 0xFE]);
    let err = decode_from_slice::<String>(&buf).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidUtf8(_)));
}
