use serde_json::{json, Value};
use thiserror::Error;

/// The `[index, payload]` unit read from the editor.
///
/// A non-negative index marks a message the editor pushed on its own; a
/// negative index answers the call that was written with that same index.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub index: i64,
    pub payload: Value,
}

impl Envelope {
    pub fn new(index: i64, payload: Value) -> Self {
        Self { index, payload }
    }

    pub fn is_reply(&self) -> bool {
        self.index < 0
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line.trim_end())
            .map_err(|error| ProtocolError::Malformed(format!("{error}: {line:?}")))?;
        match value {
            Value::Array(mut items) if items.len() == 2 => {
                let payload = items.pop().unwrap_or(Value::Null);
                let index = items[0].as_i64().ok_or_else(|| {
                    ProtocolError::Malformed(format!("index is not an integer: {line:?}"))
                })?;
                Ok(Self { index, payload })
            }
            _ => Err(ProtocolError::Malformed(format!(
                "expected a two element array: {line:?}"
            ))),
        }
    }
}

/// Messages written to the editor. A `reply_index` asks the editor to answer
/// with an envelope carrying that (negative) index.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Notification(Value),
    Call {
        function: String,
        args: Vec<Value>,
        reply_index: Option<i64>,
    },
    Expr {
        expr: String,
        reply_index: Option<i64>,
    },
    Ex {
        command: String,
    },
}

impl Outbound {
    pub fn to_value(&self) -> Value {
        match self {
            Outbound::Notification(payload) => json!([0, payload]),
            Outbound::Call {
                function,
                args,
                reply_index,
            } => {
                let mut message = vec![json!("call"), json!(function), json!(args)];
                message.extend(reply_index.map(Value::from));
                Value::Array(message)
            }
            Outbound::Expr { expr, reply_index } => {
                let mut message = vec![json!("expr"), json!(expr)];
                message.extend(reply_index.map(Value::from));
                Value::Array(message)
            }
            Outbound::Ex { command } => json!(["ex", command]),
        }
    }

    pub fn to_line(&self) -> String {
        self.to_value().to_string()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("received reply {0} while no call was pending")]
    UnsolicitedReply(i64),
    #[error("expected reply {expected}, received {received}")]
    UnexpectedReply { expected: i64, received: i64 },
    #[error("call {pending} is still awaiting its reply")]
    CallPending { pending: i64 },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("editor channel closed")]
    Disconnected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_envelope() {
        assert_eq!(
            Envelope::decode("[3, [\"mode\", \"debug\"]]\n").unwrap(),
            Envelope::new(3, json!(["mode", "debug"]))
        );
        assert!(Envelope::decode("[-4, 1]").unwrap().is_reply());

        assert!(matches!(
            Envelope::decode("{\"index\": 1}"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode("[\"1\", null]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode("[1, 2, 3]"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode("[1, "),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_outbound_shapes() {
        assert_eq!(
            Outbound::Call {
                function: "bufnr".into(),
                args: vec![json!("main.c"), json!(1)],
                reply_index: Some(-2),
            }
            .to_line(),
            r#"["call","bufnr",["main.c",1],-2]"#
        );
        assert_eq!(
            Outbound::Call {
                function: "setbufvar".into(),
                args: vec![json!(4), json!("&bl"), json!(1)],
                reply_index: None,
            }
            .to_line(),
            r#"["call","setbufvar",[4,"&bl",1]]"#
        );
        assert_eq!(
            Outbound::Expr {
                expr: "getcwd()".into(),
                reply_index: Some(-3),
            }
            .to_line(),
            r#"["expr","getcwd()",-3]"#
        );
        assert_eq!(
            Outbound::Ex {
                command: "sign unplace 7".into(),
            }
            .to_line(),
            r#"["ex","sign unplace 7"]"#
        );
        assert_eq!(
            Outbound::Notification(json!({"ready": true})).to_line(),
            r#"[0,{"ready":true}]"#
        );
    }
}
