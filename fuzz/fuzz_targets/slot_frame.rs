#![no_main]
use libfuzzer_sys::fuzz_target;
use veilnet::net::wire::{parse_probes, parse_slot};

fuzz_target!(|data: &[u8]| {
    let _ = parse_slot(data);
    let _ = parse_probes(data);
});
