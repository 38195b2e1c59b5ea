#![no_main]
use libfuzzer_sys::fuzz_target;
use veilnet::net::wire::decode_key_list;

fuzz_target!(|data: &[u8]| {
    let _ = decode_key_list(data);
});
