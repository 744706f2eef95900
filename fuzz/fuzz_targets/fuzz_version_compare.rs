#![no_main]

use libfuzzer_sys::fuzz_target;
use plugwright::version::{bump_patch, compare};

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;
    // comparison is reflexive and never panics
    assert!(compare(a, a));
    let _ = compare(a, b);
    let _ = bump_patch(a);
});
