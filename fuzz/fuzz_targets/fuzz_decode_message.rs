#![no_main]

use bytes::{Buf, BytesMut};
use libfuzzer_sys::fuzz_target;
use ysql_pool::protocol::{decode_message, BackendMessage};
use ysql_pool::types::{oid, Value};

const TYPE_OIDS: [u32; 9] = [
    oid::BOOL,
    oid::BYTEA,
    oid::INT2,
    oid::INT4,
    oid::INT8,
    oid::FLOAT4,
    oid::FLOAT8,
    oid::NUMERIC,
    25,
];

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    // Several messages may arrive in one TCP segment
    while buf.len() >= 5 {
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        // The connection rejects these before decoding
        if len < 4 {
            break;
        }
        match decode_message(&mut buf) {
            Ok((BackendMessage::DataRow(values), consumed)) => {
                // Text-format column decoding must never panic either
                for (i, value) in values.iter().enumerate() {
                    let _ = Value::from_text(TYPE_OIDS[i % TYPE_OIDS.len()], value.as_deref());
                }
                if consumed == 0 {
                    break;
                }
                buf.advance(consumed);
            }
            Ok((_, consumed)) => {
                if consumed == 0 {
                    break;
                }
                buf.advance(consumed);
            }
            Err(_) => break,
        }
    }
});
