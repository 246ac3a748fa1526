#![no_main]
use libfuzzer_sys::fuzz_target;

use conclave::groups::{GroupMetadata, KeyRetention, KeyRing, MembershipRoster};
use conclave::user_groups::UserGroupsRegistry;

/// Every dump decoder must reject garbage without panicking.
fuzz_target!(|data: &[u8]| {
    if let Ok(info) = GroupMetadata::from_dump(data) {
        let _ = info.get();
    }
    let _ = MembershipRoster::from_dump(data).map(|roster| roster.get_all());

    if data.len() > 32 {
        let mut group = [0u8; 32];
        group.copy_from_slice(&data[..32]);
        if let Ok(mut ring) = KeyRing::from_dump(group, &data[32..], KeyRetention::default()) {
            let _ = ring.group_keys();
            let _ = ring.dump();
        }
    }

    let user_sk = [7u8; 64];
    if let Ok(mut registry) = UserGroupsRegistry::init(&user_sk, Some(data)) {
        let _ = registry.get_all();
        let _ = registry.dump();
    }
});
