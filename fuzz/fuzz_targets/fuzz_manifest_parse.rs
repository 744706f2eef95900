#![no_main]

use libfuzzer_sys::fuzz_target;
use plugwright::manifest::Manifest;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let manifest = Manifest::parse(text);

    // Whatever we write must read back to the same values
    let reparsed = Manifest::parse(&manifest.render());
    assert_eq!(
        serde_json::to_value(&manifest).ok(),
        serde_json::to_value(&reparsed).ok()
    );
    let _ = manifest.state();
    let _ = manifest.missing_keys();
});
