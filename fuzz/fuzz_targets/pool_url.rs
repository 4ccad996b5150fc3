#![no_main]

use kv_pool::PoolConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz pool option parsing; anything accepted must also validate
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = PoolConfig::from_url(s) {
            assert!(config.validate().is_ok());
        }
    }
});
