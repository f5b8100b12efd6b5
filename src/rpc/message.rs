//! MessagePack-RPC frame model.
//!
//! Frames follow the [MessagePack-RPC spec](https://github.com/msgpack-rpc/msgpack-rpc/blob/master/spec.md):
//! request `[0, msgid, method, params]`, response `[1, msgid, error, result]`
//! and notification `[2, method, params]`. Values stay as [`rmpv::Value`]
//! end to end so payloads never round-trip through an intermediate format.

use rmpv::Value;

use crate::error::RpcError;

pub const REQUEST: u64 = 0;
pub const RESPONSE: u64 = 1;
pub const NOTIFICATION: u64 = 2;

/// A decoded inbound frame. Outbound requests are encoded directly by
/// [`encode_request`]; the host never sends responses or notifications.
#[derive(Debug)]
pub enum Frame {
    Response {
        msgid: u32,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// The peer sent a request; plugin servers are not expected to, so the
    /// client logs and drops these.
    Request { msgid: u32, method: String },
}

/// Encode an outbound request frame.
pub fn encode_request(msgid: u32, method: &str, params: Vec<Value>) -> Result<Vec<u8>, RpcError> {
    let frame = Value::Array(vec![
        Value::from(REQUEST),
        Value::from(msgid),
        Value::from(method),
        Value::Array(params),
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &frame).map_err(|e| RpcError::Decode(e.to_string()))?;
    Ok(buf)
}

/// Interpret one decoded MessagePack value as an RPC frame.
pub fn parse_frame(value: Value) -> Result<Frame, RpcError> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(RpcError::Decode(format!(
                "frame is not an array: {other}"
            )))
        }
    };
    let kind = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| RpcError::Decode("frame has no type tag".into()))?;

    match kind {
        RESPONSE if items.len() == 4 => {
            let mut items = items.into_iter();
            items.next();
            let msgid = items
                .next()
                .and_then(|v| v.as_u64())
                .ok_or_else(|| RpcError::Decode("response msgid is not an integer".into()))?
                as u32;
            let error = items.next().unwrap_or(Value::Nil);
            let result = items.next().unwrap_or(Value::Nil);
            Ok(Frame::Response {
                msgid,
                error,
                result,
            })
        }
        NOTIFICATION if items.len() == 3 => {
            let mut items = items.into_iter();
            items.next();
            let method = items
                .next()
                .and_then(|v| v.as_str().map(str::to_owned))
                .ok_or_else(|| RpcError::Decode("notification method is not a string".into()))?;
            let params = items.next().unwrap_or(Value::Nil);
            Ok(Frame::Notification { method, params })
        }
        REQUEST if items.len() == 4 => {
            let msgid = items[1].as_u64().unwrap_or(0) as u32;
            let method = items[2].as_str().unwrap_or("?").to_owned();
            Ok(Frame::Request { msgid, method })
        }
        other => Err(RpcError::Decode(format!(
            "unknown frame type {other} (len {})",
            items.len()
        ))),
    }
}

/// Build a MessagePack map value from string keys.
pub fn map(fields: Vec<(&str, Value)>) -> Value {
    Value::Map(
        fields
            .into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect(),
    )
}

/// Look up a field in a MessagePack map by string key.
pub fn field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Render a remote instance id as its canonical text form. Servers may
/// answer with either a string or an integer; the host treats ids as
/// opaque text from then on.
pub fn id_text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::to_owned)
        .or_else(|| value.as_i64().map(|i| i.to_string()))
        .or_else(|| value.as_u64().map(|i| i.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_encodes_as_a_four_element_array() {
        let buf = encode_request(7, "plugin.HandleEvent", vec![Value::from("x")]).unwrap();
        let decoded = rmpv::decode::read_value(&mut &buf[..]).unwrap();
        let items = decoded.as_array().unwrap();
        assert_eq!(items[0].as_u64(), Some(REQUEST));
        assert_eq!(items[1].as_u64(), Some(7));
        assert_eq!(items[2].as_str(), Some("plugin.HandleEvent"));
        assert_eq!(items[3].as_array().unwrap().len(), 1);
    }

    #[test]
    fn response_and_notification_frames_parse() {
        let resp = Value::Array(vec![
            Value::from(RESPONSE),
            Value::from(3u32),
            Value::Nil,
            Value::from("ok"),
        ]);
        match parse_frame(resp).unwrap() {
            Frame::Response {
                msgid,
                error,
                result,
            } => {
                assert_eq!(msgid, 3);
                assert!(error.is_nil());
                assert_eq!(result.as_str(), Some("ok"));
            }
            other => panic!("expected response, got {other:?}"),
        }

        let notif = Value::Array(vec![
            Value::from(NOTIFICATION),
            Value::from("serverPid"),
            Value::Array(vec![Value::from(4242)]),
        ]);
        match parse_frame(notif).unwrap() {
            Frame::Notification { method, params } => {
                assert_eq!(method, "serverPid");
                assert_eq!(params.as_array().unwrap()[0].as_u64(), Some(4242));
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        assert!(parse_frame(Value::from("nope")).is_err());
        assert!(parse_frame(Value::Array(vec![Value::from(9u32)])).is_err());
    }

    #[test]
    fn id_text_accepts_strings_and_integers() {
        assert_eq!(id_text(&Value::from("i-1")), Some("i-1".into()));
        assert_eq!(id_text(&Value::from(12)), Some("12".into()));
        assert_eq!(id_text(&Value::Nil), None);
    }
}
