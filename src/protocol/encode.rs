//! Frontend message encoding

use super::constants::{frontend, SSL_REQUEST_CODE, TEXT_FORMAT};
use super::message::FrontendMessage;
use bytes::{BufMut, BytesMut};
use std::io;

/// Encode one frontend message
///
/// Fails with `InvalidInput` when a string carries an embedded NUL or a
/// count does not fit the wire field.
pub fn encode_message(msg: &FrontendMessage) -> io::Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(64);

    match msg {
        FrontendMessage::SslRequest => frame(&mut buf, None, |buf| {
            buf.put_i32(SSL_REQUEST_CODE);
            Ok(())
        })?,
        FrontendMessage::Startup { version, params } => frame(&mut buf, None, |buf| {
            buf.put_i32(*version);
            for (name, value) in params {
                put_cstr(buf, name)?;
                put_cstr(buf, value)?;
            }
            buf.put_u8(0);
            Ok(())
        })?,
        FrontendMessage::Password(password) => {
            frame(&mut buf, Some(frontend::PASSWORD), |buf| put_cstr(buf, password))?
        }
        FrontendMessage::SaslInitialResponse { mechanism, data } => {
            frame(&mut buf, Some(frontend::PASSWORD), |buf| {
                put_cstr(buf, mechanism)?;
                buf.put_i32(wire_len(data.len())?);
                buf.put_slice(data);
                Ok(())
            })?
        }
        FrontendMessage::SaslResponse { data } => frame(&mut buf, Some(frontend::PASSWORD), |buf| {
            buf.put_slice(data);
            Ok(())
        })?,
        FrontendMessage::Query(sql) => frame(&mut buf, Some(frontend::QUERY), |buf| put_cstr(buf, sql))?,
        FrontendMessage::Parse {
            name,
            query,
            param_types,
        } => frame(&mut buf, Some(frontend::PARSE), |buf| {
            put_cstr(buf, name)?;
            put_cstr(buf, query)?;
            buf.put_i16(wire_count(param_types.len())?);
            param_types.iter().for_each(|oid| buf.put_u32(*oid));
            Ok(())
        })?,
        FrontendMessage::Bind {
            portal,
            statement,
            params,
        } => frame(&mut buf, Some(frontend::BIND), |buf| {
            put_cstr(buf, portal)?;
            put_cstr(buf, statement)?;
            // A single format code applies to all parameters
            buf.put_i16(1);
            buf.put_i16(TEXT_FORMAT);
            buf.put_i16(wire_count(params.len())?);
            for param in params {
                match param {
                    Some(value) => {
                        buf.put_i32(wire_len(value.len())?);
                        buf.put_slice(value);
                    }
                    None => buf.put_i32(-1),
                }
            }
            buf.put_i16(1);
            buf.put_i16(TEXT_FORMAT);
            Ok(())
        })?,
        FrontendMessage::Describe { kind, name } => frame(&mut buf, Some(frontend::DESCRIBE), |buf| {
            buf.put_u8(*kind);
            put_cstr(buf, name)
        })?,
        FrontendMessage::Execute { portal, max_rows } => {
            frame(&mut buf, Some(frontend::EXECUTE), |buf| {
                put_cstr(buf, portal)?;
                buf.put_i32(*max_rows);
                Ok(())
            })?
        }
        FrontendMessage::Sync => frame(&mut buf, Some(frontend::SYNC), |_| Ok(()))?,
        FrontendMessage::Terminate => frame(&mut buf, Some(frontend::TERMINATE), |_| Ok(()))?,
    }

    Ok(buf)
}

/// Write an optional tag, a length placeholder and the body, then patch the length
fn frame<F>(buf: &mut BytesMut, tag: Option<u8>, body: F) -> io::Result<()>
where
    F: FnOnce(&mut BytesMut) -> io::Result<()>,
{
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let start = buf.len();
    buf.put_i32(0);
    body(buf)?;

    let len = wire_len(buf.len() - start)?;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_cstr(buf: &mut BytesMut, s: &str) -> io::Result<()> {
    if s.contains('\0') {
        return Err(invalid("string contains a NUL byte"));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn wire_len(n: usize) -> io::Result<i32> {
    i32::try_from(n).map_err(|_| invalid("message too large"))
}

fn wire_count(n: usize) -> io::Result<i16> {
    i16::try_from(n).map_err(|_| invalid("too many parameters"))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}
