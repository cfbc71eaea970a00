//! Backend message decoding

use super::constants::{auth, backend};
use super::message::{AuthenticationMessage, BackendMessage, ErrorFields, FieldDescription};
use bytes::{Bytes, BytesMut};
use std::io;

/// Largest message accepted, matching the server's own 1 GB limit
///
/// Checked against the length header before the body is buffered.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 30;

/// Decode the first message in `data`
///
/// Returns the message and the number of bytes it occupied; the caller
/// advances the buffer. `UnexpectedEof` means more bytes are needed,
/// `InvalidData` means the stream is corrupt.
pub fn decode_message(data: &mut BytesMut) -> io::Result<(BackendMessage, usize)> {
    if data.len() < 5 {
        return Err(eof("message header"));
    }
    let tag = data[0];
    let len = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let len = usize::try_from(len)
        .ok()
        .filter(|&n| n >= 4)
        .ok_or_else(|| corrupt(format!("invalid message length {}", len)))?;
    if len > MAX_MESSAGE_LENGTH {
        return Err(corrupt(format!(
            "message length {} exceeds maximum {}",
            len, MAX_MESSAGE_LENGTH
        )));
    }
    if data.len() < len + 1 {
        return Err(eof("message body"));
    }

    let mut body = Body::new(&data[5..len + 1]);
    let msg = match tag {
        backend::AUTHENTICATION => BackendMessage::Authentication(body.authentication()?),
        backend::BACKEND_KEY_DATA => BackendMessage::BackendKeyData {
            process_id: body.i32()?,
            secret_key: body.i32()?,
        },
        backend::PARAMETER_STATUS => BackendMessage::ParameterStatus {
            name: body.cstr()?,
            value: body.cstr()?,
        },
        backend::READY_FOR_QUERY => BackendMessage::ReadyForQuery { status: body.u8()? },
        backend::PARSE_COMPLETE => BackendMessage::ParseComplete,
        backend::BIND_COMPLETE => BackendMessage::BindComplete,
        backend::NO_DATA => BackendMessage::NoData,
        backend::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
        backend::PARAMETER_DESCRIPTION => {
            let count = body.count()?;
            BackendMessage::ParameterDescription(
                (0..count).map(|_| body.u32()).collect::<io::Result<_>>()?,
            )
        }
        backend::ROW_DESCRIPTION => {
            let count = body.count()?;
            BackendMessage::RowDescription(
                (0..count).map(|_| body.field()).collect::<io::Result<_>>()?,
            )
        }
        backend::DATA_ROW => {
            let count = body.count()?;
            BackendMessage::DataRow((0..count).map(|_| body.value()).collect::<io::Result<_>>()?)
        }
        backend::COMMAND_COMPLETE => BackendMessage::CommandComplete(body.cstr()?),
        backend::ERROR_RESPONSE => BackendMessage::ErrorResponse(body.error_fields()?),
        backend::NOTICE_RESPONSE => BackendMessage::NoticeResponse(body.error_fields()?),
        backend::NOTIFICATION_RESPONSE => BackendMessage::NotificationResponse {
            process_id: body.i32()?,
            channel: body.cstr()?,
            payload: body.cstr()?,
        },
        other => return Err(corrupt(format!("unknown message tag 0x{:02X}", other))),
    };

    Ok((msg, len + 1))
}

/// Cursor over one message body
struct Body<'a> {
    buf: &'a [u8],
}

impl<'a> Body<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize, what: &'static str) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(eof(what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1, "byte")?[0])
    }

    fn i16(&mut self) -> io::Result<i16> {
        let b = self.take(2, "int16")?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> io::Result<i32> {
        let b = self.take(4, "int32")?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(self.i32()? as u32)
    }

    /// Non-negative Int16 element count
    fn count(&mut self) -> io::Result<usize> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| corrupt(format!("negative count {}", n)))
    }

    fn cstr(&mut self) -> io::Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| corrupt("unterminated string".to_string()))?;
        let s = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf = &self.buf[end + 1..];
        Ok(s)
    }

    fn rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf).to_vec()
    }

    /// Length-prefixed column value, -1 for NULL
    fn value(&mut self) -> io::Result<Option<Bytes>> {
        match self.i32()? {
            -1 => Ok(None),
            n if n < 0 => Err(corrupt(format!("invalid value length {}", n))),
            n => Ok(Some(Bytes::copy_from_slice(self.take(n as usize, "column value")?))),
        }
    }

    fn field(&mut self) -> io::Result<FieldDescription> {
        Ok(FieldDescription {
            name: self.cstr()?,
            table_oid: self.i32()?,
            column_attr: self.i16()?,
            type_oid: self.u32()?,
            type_size: self.i16()?,
            type_modifier: self.i32()?,
            format_code: self.i16()?,
        })
    }

    fn error_fields(&mut self) -> io::Result<ErrorFields> {
        let mut fields = ErrorFields::default();
        loop {
            match self.u8()? {
                0 => return Ok(fields),
                code => {
                    let value = self.cstr()?;
                    fields.set(code, value);
                }
            }
        }
    }

    fn authentication(&mut self) -> io::Result<AuthenticationMessage> {
        let msg = match self.i32()? {
            auth::OK => AuthenticationMessage::Ok,
            auth::CLEARTEXT_PASSWORD => AuthenticationMessage::CleartextPassword,
            auth::MD5_PASSWORD => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(self.take(4, "md5 salt")?);
                AuthenticationMessage::Md5Password { salt }
            }
            auth::SASL => {
                let mut mechanisms = Vec::new();
                while !self.buf.is_empty() {
                    let name = self.cstr()?;
                    if name.is_empty() {
                        break;
                    }
                    mechanisms.push(name);
                }
                AuthenticationMessage::Sasl { mechanisms }
            }
            auth::SASL_CONTINUE => AuthenticationMessage::SaslContinue { data: self.rest() },
            auth::SASL_FINAL => AuthenticationMessage::SaslFinal { data: self.rest() },
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unsupported authentication method {}", other),
                ))
            }
        };
        Ok(msg)
    }
}

fn eof(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("truncated {}", what))
}

fn corrupt(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn message(tag: u8, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(tag);
        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn test_ready_for_query() {
        let mut buf = message(b'Z', b"T");
        let (msg, consumed) = decode_message(&mut buf).unwrap();
        assert!(matches!(msg, BackendMessage::ReadyForQuery { status: b'T' }));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_consecutive_messages() {
        let mut buf = message(b'1', b"");
        buf.extend_from_slice(&message(b'2', b""));
        buf.extend_from_slice(&message(b'C', b"UPDATE 1\0"));

        let (msg, n) = decode_message(&mut buf).unwrap();
        assert!(matches!(msg, BackendMessage::ParseComplete));
        let _ = buf.split_to(n);
        let (msg, n) = decode_message(&mut buf).unwrap();
        assert!(matches!(msg, BackendMessage::BindComplete));
        let _ = buf.split_to(n);
        let (msg, _) = decode_message(&mut buf).unwrap();
        assert!(matches!(msg, BackendMessage::CommandComplete(tag) if tag == "UPDATE 1"));
    }

    #[test]
    fn test_data_row_with_null() {
        let mut body = Vec::new();
        body.extend_from_slice(&2i16.to_be_bytes());
        body.extend_from_slice(&4i32.to_be_bytes());
        body.extend_from_slice(b"9200");
        body.extend_from_slice(&(-1i32).to_be_bytes());

        let (msg, _) = decode_message(&mut message(b'D', &body)).unwrap();
        match msg {
            BackendMessage::DataRow(values) => {
                assert_eq!(values, vec![Some(Bytes::from_static(b"9200")), None]);
            }
            other => panic!("expected DataRow, got {:?}", other),
        }
    }

    #[test]
    fn test_row_description() {
        let mut body = Vec::new();
        body.extend_from_slice(&1i16.to_be_bytes());
        body.extend_from_slice(b"balance\0");
        body.extend_from_slice(&16384i32.to_be_bytes());
        body.extend_from_slice(&3i16.to_be_bytes());
        body.extend_from_slice(&23u32.to_be_bytes());
        body.extend_from_slice(&4i16.to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());

        let (msg, _) = decode_message(&mut message(b'T', &body)).unwrap();
        match msg {
            BackendMessage::RowDescription(fields) => assert_eq!(
                fields,
                vec![FieldDescription {
                    name: "balance".into(),
                    table_oid: 16384,
                    column_attr: 3,
                    type_oid: 23,
                    type_size: 4,
                    type_modifier: -1,
                    format_code: 0,
                }]
            ),
            other => panic!("expected RowDescription, got {:?}", other),
        }
    }

    #[test]
    fn test_error_response_fields() {
        let body = b"SERROR\0C40001\0Mcould not serialize access\0Rsome_routine\0\0";
        let (msg, _) = decode_message(&mut message(b'E', body)).unwrap();
        match msg {
            BackendMessage::ErrorResponse(fields) => {
                assert_eq!(fields.severity.as_deref(), Some("ERROR"));
                assert_eq!(fields.code.as_deref(), Some("40001"));
                assert_eq!(fields.message.as_deref(), Some("could not serialize access"));
            }
            other => panic!("expected ErrorResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_sasl_mechanisms() {
        let mut body = 10i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let (msg, _) = decode_message(&mut message(b'R', &body)).unwrap();
        match msg {
            BackendMessage::Authentication(AuthenticationMessage::Sasl { mechanisms }) => {
                assert_eq!(mechanisms, ["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
            }
            other => panic!("expected SASL request, got {:?}", other),
        }
    }

    #[test]
    fn test_md5_salt() {
        let mut body = 5i32.to_be_bytes().to_vec();
        body.extend_from_slice(&[1, 2, 3, 4]);
        let (msg, _) = decode_message(&mut message(b'R', &body)).unwrap();
        assert!(matches!(
            msg,
            BackendMessage::Authentication(AuthenticationMessage::Md5Password { salt: [1, 2, 3, 4] })
        ));
    }

    #[test]
    fn test_incomplete_input_asks_for_more() {
        let err = decode_message(&mut BytesMut::from(&b"Z\0\0"[..])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        let err = decode_message(&mut BytesMut::from(&b"Z\0\0\0\x05"[..])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_corrupt_input_rejected() {
        let oversized = ((MAX_MESSAGE_LENGTH + 1) as i32).to_be_bytes();
        let mut buf = BytesMut::from(&[b'D'][..]);
        buf.extend_from_slice(&oversized);
        assert_eq!(decode_message(&mut buf).unwrap_err().kind(), io::ErrorKind::InvalidData);

        let mut buf = BytesMut::from(&b"Z\0\0\0\x02"[..]);
        assert_eq!(decode_message(&mut buf).unwrap_err().kind(), io::ErrorKind::InvalidData);

        let mut buf = message(b'?', b"");
        assert_eq!(decode_message(&mut buf).unwrap_err().kind(), io::ErrorKind::InvalidData);

        // Value length runs past the end of the body
        let mut body = 1i16.to_be_bytes().to_vec();
        body.extend_from_slice(&100i32.to_be_bytes());
        assert!(decode_message(&mut message(b'D', &body)).is_err());
    }

    #[test]
    fn test_parameter_description() {
        let mut body = 2i16.to_be_bytes().to_vec();
        body.extend_from_slice(&23u32.to_be_bytes());
        body.extend_from_slice(&25u32.to_be_bytes());
        let (msg, consumed) = decode_message(&mut message(b't', &body)).unwrap();
        assert!(matches!(msg, BackendMessage::ParameterDescription(oids) if oids == [23, 25]));
        assert_eq!(consumed, 15);
    }
}
