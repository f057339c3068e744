use bosun::terminal::input::{decode_control_codes, decode_hex};

#[test]
fn caret_codes_decode_to_control_bytes() {
    assert_eq!(decode_control_codes("^C").unwrap(), vec![0x03]);
    assert_eq!(decode_control_codes("^c").unwrap(), vec![0x03]);
    assert_eq!(decode_control_codes("^D").unwrap(), vec![0x04]);
    assert_eq!(decode_control_codes("^Z").unwrap(), vec![0x1a]);
    assert_eq!(decode_control_codes("^@").unwrap(), vec![0x00]);
    assert_eq!(decode_control_codes("^[").unwrap(), vec![0x1b]);
    assert_eq!(decode_control_codes("^?").unwrap(), vec![0x7f]);
}

#[test]
fn unknown_caret_pairs_pass_through() {
    assert_eq!(decode_control_codes("^1").unwrap(), b"^1".to_vec());
    assert_eq!(decode_control_codes("2^2").unwrap(), b"2^2".to_vec());
    // Trailing caret is literal.
    assert_eq!(decode_control_codes("end^").unwrap(), b"end^".to_vec());
}

#[test]
fn standard_escapes_decode() {
    assert_eq!(decode_control_codes(r"\n").unwrap(), vec![b'\n']);
    assert_eq!(decode_control_codes(r"\r").unwrap(), vec![b'\r']);
    assert_eq!(decode_control_codes(r"\t").unwrap(), vec![b'\t']);
    assert_eq!(decode_control_codes(r"\0").unwrap(), vec![0x00]);
    assert_eq!(decode_control_codes(r"\e").unwrap(), vec![0x1b]);
    assert_eq!(decode_control_codes(r"\\").unwrap(), vec![b'\\']);
}

#[test]
fn hex_and_unicode_escapes_decode() {
    assert_eq!(decode_control_codes(r"\x1b[A").unwrap(), b"\x1b[A".to_vec());
    assert_eq!(decode_control_codes(r"\x00\xff").unwrap(), vec![0x00, 0xff]);
    assert_eq!(decode_control_codes(r"A").unwrap(), vec![b'A']);
    // Multi-byte UTF-8 result.
    assert_eq!(decode_control_codes(r"é").unwrap(), "é".as_bytes().to_vec());
}

#[test]
fn mixed_text_and_codes() {
    assert_eq!(
        decode_control_codes("ls\\n^C").unwrap(),
        vec![b'l', b's', b'\n', 0x03]
    );
}

#[test]
fn malformed_escapes_are_rejected() {
    assert!(decode_control_codes(r"\x1").is_err());
    assert!(decode_control_codes(r"\xzz").is_err());
    assert!(decode_control_codes(r"\u12").is_err());
    assert!(decode_control_codes(r"\q").is_err());
    assert!(decode_control_codes("trailing\\").is_err());
    // Unpaired surrogate is not a valid char.
    assert!(decode_control_codes(r"\ud800").is_err());
}

#[test]
fn hex_strings_decode_to_bytes() {
    assert_eq!(decode_hex("68690a").unwrap(), b"hi\n".to_vec());
    assert_eq!(decode_hex("DE AD BE EF").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(decode_hex("").unwrap(), Vec::<u8>::new());
}

#[test]
fn invalid_hex_is_rejected() {
    assert!(decode_hex("abc").is_err());
    assert!(decode_hex("zz").is_err());
    assert!(decode_hex("0x41").is_err());
}
