#![no_main]
use libfuzzer_sys::fuzz_target;
use arbitrary::Arbitrary;

use conclave::groups::{parse_message, GroupConfig, GroupDumps};

#[derive(Arbitrary, Debug)]
struct KeyMessageInput {
    /// Raw bytes offered as a key message
    message: Vec<u8>,
    /// Raw bytes offered as a group message
    ciphertext: Vec<u8>,
    /// Whether the receiving instance holds the group secret key
    as_admin: bool,
}

/// Key-message ingestion must fail cleanly on forged or malformed input and
/// never change the ring when it does.
fuzz_target!(|input: KeyMessageInput| {
    if input.message.len() > 1 << 20 {
        return;
    }
    let _ = parse_message(&input.message);

    let (_, user_sk) = conclave::crypto::generate_keypair();
    let (group_pk, group_sk) = conclave::crypto::generate_keypair();
    let secret = if input.as_admin { Some(&group_sk[..]) } else { None };
    let mut group = match GroupConfig::init(&user_sk, &group_pk, secret, GroupDumps::default()) {
        Ok(group) => group,
        Err(_) => return,
    };

    let before = group.group_keys();
    if group.load_key_message(&input.message, "fuzz", 0).is_err() {
        assert_eq!(group.group_keys(), before);
    }
    let _ = group.decrypt_message(&input.ciphertext);
});
