#![no_main]
use libfuzzer_sys::fuzz_target;

use conclave::user_groups::{build_full_url, CommunityUrl};

fuzz_target!(|data: &[u8]| {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => return,
    };

    // Parsing arbitrary text must not panic
    let parsed = match CommunityUrl::parse(text) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };

    // A parsed url with a key must survive a rebuild with the same identity
    if let Some(pubkey) = parsed.pubkey {
        let rebuilt = build_full_url(&parsed.base_url, &parsed.room, &pubkey);
        let again = CommunityUrl::parse(&rebuilt).expect("rebuilt url must parse");
        assert_eq!(again.key(), parsed.key());
        assert_eq!(again.pubkey, Some(pubkey));
    }
});
