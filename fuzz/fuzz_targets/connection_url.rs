#![no_main]

use kv_connection::ConnectionConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz connection URL parsing
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = ConnectionConfig::from_url(s) {
            let _ = config.description();
            let _ = format!("{config:?}");
        }
    }
});
