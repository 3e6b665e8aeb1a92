#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Kernel event buffers are parsed byte-by-byte with explicit bounds
    // checks; arbitrary input must never panic.
    #[cfg(target_os = "linux")]
    pathwatch::fuzzing::parse_inotify_buffer(data);
    #[cfg(not(target_os = "linux"))]
    let _ = data;
});
