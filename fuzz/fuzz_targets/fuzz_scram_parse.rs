#![no_main]

use libfuzzer_sys::arbitrary::{self, Arbitrary};
use libfuzzer_sys::fuzz_target;
use ysql_pool::auth::{md5_password, ScramClient};

#[derive(Debug, Arbitrary)]
struct AuthInput {
    user: String,
    password: String,
    server_first: Vec<u8>,
    server_final: Vec<u8>,
    salt: [u8; 4],
}

fuzz_target!(|input: AuthInput| {
    // Server-controlled SCRAM messages must fail cleanly, never panic
    let client = ScramClient::new(&input.user, &input.password);
    let _ = client.initial_response();
    if let Ok((_, verifier)) = client.respond(&input.server_first) {
        let _ = verifier.verify(&input.server_final);
    }

    let hashed = md5_password(&input.user, &input.password, &input.salt);
    assert!(hashed.starts_with("md5"));
    assert_eq!(hashed.len(), 35);
});
