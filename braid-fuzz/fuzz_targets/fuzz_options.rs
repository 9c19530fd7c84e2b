#![no_main]

use braid_mptcp::codec::{decode_options, encode_options};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The option walker must survive arbitrary TCP option regions
    // without panicking, and everything it accepts must re-encode.
    let opts = decode_options(data);
    if !opts.is_empty() {
        let wire = encode_options(&opts);
        // Whatever decoded once decodes again identically.
        let again = decode_options(&wire);
        assert_eq!(opts, again);
    }
});
