//! Fuzz harness for helper request and reply decoding.
//!
//! Feeds arbitrary frames to `decode_request` and `HelperResponse::decode`.
//! Neither may panic. A decode failure must map to an error code the helper
//! can send back, and a request that decodes must survive re-encoding.

#![no_main]
use libfuzzer_sys::fuzz_target;
use privhelper_daemon::protocol::{
    DecodeConfig, HelperErrorCode, HelperResponse, decode_request,
};

fuzz_target!(|data: &[u8]| {
    let config = DecodeConfig {
        max_message_size: 4096,
    };

    match decode_request(data, &config) {
        Ok(request) => {
            let reencoded = request.encode();
            let again = decode_request(&reencoded, &config)
                .expect("re-encoded request must decode");
            assert_eq!(again, request);
        },
        Err(e) => {
            assert_ne!(e.code(), HelperErrorCode::Unspecified);
        },
    }

    let _ = HelperResponse::decode(data, &config);
});
