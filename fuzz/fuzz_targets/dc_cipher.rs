#![no_main]
use libfuzzer_sys::fuzz_target;
use veilnet::dcnet::DcNetCipher;

fuzz_target!(|data: &[u8]| {
    for equivocation in [false, true] {
        let _ = DcNetCipher::from_bytes(data, 64, equivocation);
    }
});
