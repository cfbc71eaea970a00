#![no_main]

use libfuzzer_sys::fuzz_target;
use ysql_pool::resolve::parse_port;
use ysql_pool::ConnectionParams;

fuzz_target!(|data: &[u8]| {
    let Ok(url) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(params) = ConnectionParams::parse_url(url) {
        assert!(!params.host.is_empty());
        // Ports are validated later, at resolution time
        if let Ok(port) = parse_port(&params.port) {
            assert!(port > 0);
        }
    }
});
