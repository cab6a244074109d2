//! Fuzz target for DUT byte decoding.

#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_soak::serial::LineDecoder;
use tokio::time::Instant;

fuzz_target!(|data: &[u8]| {
    for label in ["gb18030", "utf-8"] {
        let Some(decoder) = LineDecoder::for_label(label) else {
            continue;
        };

        let (text, lossy) = decoder.decode(data);
        if std::str::from_utf8(data).is_ok() && label == "utf-8" {
            assert!(!lossy, "valid UTF-8 flagged lossy");
            assert_eq!(text.as_bytes(), data);
        }

        // Raw bytes are kept verbatim whatever the decoder makes of them.
        let line = decoder.line(data.to_vec(), Instant::now());
        assert_eq!(line.raw, data);
        assert_eq!(line.lossy, lossy);
    }
});
