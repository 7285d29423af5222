use super::*;
use secp256k1::Secp256k1;

fn generate_key() -> XOnlyPublicKey {
    let secp = Secp256k1::new();
    let (_, pubkey) = secp.generate_keypair(&mut rand::rng());
    pubkey.x_only_public_key().0
}

fn sample_cert() -> Certificate {
    Certificate {
        primary: generate_key(),
        created: 1_700_000_000,
        expires: 0,
        uids: vec![UserId::new("node-a@overlay").unwrap()],
        subkeys: vec![
            Subkey {
                pubkey: generate_key(),
                flags: FLAG_CAN_AUTHENTICATE,
                created: 1_700_000_000,
                expires: 0,
            },
            Subkey {
                pubkey: generate_key(),
                flags: FLAG_CAN_SIGN | FLAG_CAN_ENCRYPT,
                created: 1_700_000_100,
                expires: 1_800_000_000,
            },
        ],
    }
}

#[test]
fn test_encode_decode() {
    let cert = sample_cert();
    let raw = cert.encode();
    let decoded = Certificate::decode(&raw).unwrap();
    assert_eq!(decoded, cert);
}

#[test]
fn test_decode_rejects_trailing_bytes() {
    let mut raw = sample_cert().encode();
    raw.push(0);
    assert!(matches!(
        Certificate::decode(&raw),
        Err(CertError::TrailingBytes(1))
    ));
}

#[test]
fn test_decode_rejects_bad_version() {
    let mut raw = sample_cert().encode();
    raw[0] = 0xFF;
    assert!(matches!(
        Certificate::decode(&raw),
        Err(CertError::UnsupportedVersion(0xFF))
    ));
}

#[test]
fn test_decode_rejects_truncation() {
    let raw = sample_cert().encode();
    assert!(matches!(
        Certificate::decode(&raw[..raw.len() - 3]),
        Err(CertError::TooShort { .. })
    ));
}

#[test]
fn test_fingerprint_is_stable() {
    let cert = sample_cert();
    assert_eq!(cert.fingerprint(), cert.fingerprint());

    // Fingerprint depends only on the primary key.
    let mut other = cert.clone();
    other.uids.clear();
    other.subkeys.clear();
    assert_eq!(other.fingerprint(), cert.fingerprint());
}

#[test]
fn test_subkey_id_is_fingerprint_tail() {
    let cert = sample_cert();
    let sk = &cert.subkeys[0];
    let fpr = sk.fingerprint();
    assert_eq!(sk.id(), fpr.as_bytes()[12..20]);
    assert_eq!(cert.subkey_by_id(&sk.id()), Some(sk));
}

#[test]
fn test_subkey_lookup_miss() {
    let cert = sample_cert();
    assert!(cert.subkey_by_id(&[0u8; SUBKEY_ID_SIZE]).is_none());
}

#[test]
fn test_uid_length_limit() {
    assert!(UserId::new("x".repeat(255)).is_ok());
    assert!(matches!(
        UserId::new("x".repeat(256)),
        Err(CertError::UidTooLong(256))
    ));
}

#[test]
fn test_prefix_derivation() {
    let fpr = Fingerprint::from_bytes([
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
        0xEE, 0xFF, 0x01, 0x02, 0x03, 0x04,
    ]);
    let prefix = OverlayPrefix::from_fingerprint(&fpr);
    assert_eq!(
        prefix.as_bytes(),
        &[0xFC, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]
    );
}

#[test]
fn test_prefix_lead_byte_always_forced() {
    let cert = sample_cert();
    let prefix = cert.prefix();
    assert_eq!(prefix.as_bytes()[0], PREFIX_LEAD);
    assert_eq!(
        &prefix.as_bytes()[1..],
        &cert.fingerprint().as_bytes()[5..12]
    );
}

#[test]
fn test_prefix_from_bytes_validates_lead() {
    assert!(OverlayPrefix::from_bytes([0xFC, 1, 2, 3, 4, 5, 6, 7]).is_ok());
    assert!(OverlayPrefix::from_bytes([0xFD, 1, 2, 3, 4, 5, 6, 7]).is_err());
}

#[test]
fn test_fingerprint_hex_round_trip() {
    let fpr = Fingerprint::from_bytes([0xAB; 20]);
    assert_eq!(fpr.hex(), "ab".repeat(20));
    assert_eq!(fpr.hex().len(), 40);
    assert_eq!(Fingerprint::from_hex(&fpr.hex()).unwrap(), fpr);

    assert!(Fingerprint::from_hex("not hex").is_err());
    assert!(Fingerprint::from_hex("abcd").is_err());
}
