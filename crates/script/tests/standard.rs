use zcore_script::standard::{
    classify_script_pubkey, legacy_sigop_count, p2pk_script, p2pkh_script, ScriptType,
};

#[test]
fn classify_p2pkh() {
    let script = p2pkh_script(&[0x11; 20]);
    assert_eq!(script.len(), 25);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Pkh);
}

#[test]
fn classify_p2sh() {
    let mut script = vec![0xa9, 0x14];
    script.extend_from_slice(&[0x22; 20]);
    script.push(0x87);
    assert_eq!(classify_script_pubkey(&script), ScriptType::P2Sh);
}

#[test]
fn classify_p2pk() {
    let compressed = p2pk_script(&[0x02; 33]);
    assert_eq!(classify_script_pubkey(&compressed), ScriptType::P2Pk);
    let uncompressed = p2pk_script(&[0x04; 65]);
    assert_eq!(classify_script_pubkey(&uncompressed), ScriptType::P2Pk);
}

#[test]
fn classify_null_data() {
    assert_eq!(classify_script_pubkey(&[0x6a, 0x01, 0x01]), ScriptType::NullData);
    let mut oversized = vec![0x6a, 0x4c, 81];
    oversized.extend_from_slice(&[0u8; 81]);
    assert_eq!(classify_script_pubkey(&oversized), ScriptType::Unknown);
}

#[test]
fn classify_unknown() {
    assert_eq!(classify_script_pubkey(&[0x51]), ScriptType::Unknown);
    assert_eq!(classify_script_pubkey(&[]), ScriptType::Unknown);
}

#[test]
fn sigops_are_counted_outside_pushes() {
    assert_eq!(legacy_sigop_count(&p2pkh_script(&[0xac; 20])), 1);
    // CHECKSIG, CHECKSIGVERIFY, CHECKMULTISIG
    assert_eq!(legacy_sigop_count(&[0xac, 0xad, 0xae]), 22);
    // Counting stops at a truncated push.
    assert_eq!(legacy_sigop_count(&[0xac, 0x05, 0xac]), 1);
}
