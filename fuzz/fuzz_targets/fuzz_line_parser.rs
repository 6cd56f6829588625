#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Controller responses come from a USB wire: arbitrary chunking, NULs,
    // truncation. The framer and parser must never panic.
    let mut lb = damper_core::codec::LineBuffer::new();
    for chunk in data.chunks(7) {
        for line in lb.push(chunk) {
            let _ = damper_core::codec::parse_line(&line);
        }
    }
});
