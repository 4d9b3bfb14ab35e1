//! Envelope Codec
//!
//! JSON encoding and decoding of `[tag, ...args]` frames.
//!
//! ```json
//! ["connection", "ok", {"userId": 7}]
//! ["bod", {"acc": 1, "security": 2, "qty": 100, "avgPx": 9.5}]
//! ["Order", 11, 1, 2, "buy", 100, 9.6, "filled", 100, 9.6]
//! ["user_validation", 5, 3]
//! ```

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::domain::market::{AccountId, OrderEvent, OrderId, OrderStatus, SecurityId, Side};
use crate::infrastructure::upstream::messages::{UpstreamMessage, UpstreamRequest};
use crate::infrastructure::viewer::{ConnectionToken, ViewerAction};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON parsing failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is not an array starting with a string tag.
    #[error("expected a JSON array starting with a string tag")]
    NotEnvelope,

    /// Arguments do not fit the tag's schema.
    #[error("invalid '{tag}' payload: {reason}")]
    InvalidPayload {
        /// Frame tag.
        tag: String,
        /// What was wrong.
        reason: String,
    },
}

impl CodecError {
    pub(crate) fn payload(tag: &str, reason: impl ToString) -> Self {
        Self::InvalidPayload {
            tag: tag.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A frame split into its tag and positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Action tag.
    pub tag: String,
    /// Positional arguments.
    pub args: Vec<Value>,
}

impl Envelope {
    /// Split frame text.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the text is not JSON or not a tagged array.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let Value::Array(mut items) = serde_json::from_str(text)? else {
            return Err(CodecError::NotEnvelope);
        };
        if items.is_empty() {
            return Err(CodecError::NotEnvelope);
        }
        let Value::String(tag) = items.remove(0) else {
            return Err(CodecError::NotEnvelope);
        };
        Ok(Self { tag, args: items })
    }

    /// Serialize `[tag, ...args]`.
    #[must_use]
    pub fn encode(tag: &str, args: impl IntoIterator<Item = Value>) -> String {
        let mut items = vec![Value::String(tag.to_string())];
        items.extend(args);
        Value::Array(items).to_string()
    }
}

// =============================================================================
// Upstream Frames
// =============================================================================

/// Decode one upstream frame.
///
/// # Errors
///
/// Returns `CodecError` when the frame is not an envelope or a known tag's
/// arguments do not match its schema.
pub fn decode_upstream(text: &str) -> Result<UpstreamMessage, CodecError> {
    let Envelope { tag, mut args } = Envelope::decode(text)?;
    let tag = tag.as_str();

    let message = match tag {
        "connection" => UpstreamMessage::Connection {
            status: args
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            user_id: args
                .get(1)
                .and_then(|v| v.get("userId"))
                .and_then(Value::as_i64),
        },
        "security" => {
            let first = args.into_iter().next().unwrap_or(Value::Null);
            UpstreamMessage::Security(Box::new(from_value(tag, first)?))
        }
        "securities" => UpstreamMessage::Securities(lenient_records(tag, args)),
        "bod" => UpstreamMessage::Bod(records(tag, args)?),
        "pnl" => UpstreamMessage::Pnl(records(tag, args)?),
        "offline" => UpstreamMessage::Offline(records(tag, args)?),
        "md" => UpstreamMessage::MarketData(records(tag, args)?),
        "target" => UpstreamMessage::Target(records(tag, args)?),
        "order" => {
            let first = args.into_iter().next().unwrap_or(Value::Null);
            UpstreamMessage::Order(from_value(tag, first)?)
        }
        "Order" => UpstreamMessage::Order(compact_order(tag, args)?),
        "user_sub_account" | "user_sub_action" => {
            let user_id = args
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| CodecError::payload(tag, "missing user id"))?;
            let accounts = args.get_mut(1).map_or(Value::Null, Value::take);
            UpstreamMessage::UserSubAccount {
                user_id,
                accounts: from_value::<Vec<AccountId>>(tag, accounts)?,
            }
        }
        "user_validation" => {
            if args.len() < 2 {
                return Err(CodecError::payload(tag, "expected user id and token"));
            }
            let token = token_arg(tag, args.last())?;
            let user_id = args
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| CodecError::payload(tag, "missing user id"))?;
            UpstreamMessage::UserValidation { user_id, token }
        }
        _ if UpstreamMessage::RESERVED_TAGS.contains(&tag) => {
            UpstreamMessage::Reserved(tag.to_string())
        }
        _ => {
            if ViewerAction::is_action_tag(tag) {
                let token = token_arg(tag, args.last())?;
                args.pop();
                let action = ViewerAction::from_args(tag, &args)?;
                UpstreamMessage::Correlated { action, token }
            } else {
                UpstreamMessage::Unrecognized {
                    tag: tag.to_string(),
                    raw: text.to_string(),
                }
            }
        }
    };
    Ok(message)
}

/// Serialize one upstream request.
#[must_use]
pub fn encode_request(request: &UpstreamRequest) -> String {
    match request {
        UpstreamRequest::Login { username, password } => Envelope::encode(
            "login",
            [json!(username), json!(password), Value::Bool(true)],
        ),
        UpstreamRequest::Securities => Envelope::encode("securities", []),
        UpstreamRequest::Bod => Envelope::encode("bod", []),
        UpstreamRequest::Target => Envelope::encode("target", []),
        UpstreamRequest::Offline => Envelope::encode("offline", [json!(0)]),
        UpstreamRequest::Pnl => Envelope::encode("pnl", []),
        UpstreamRequest::Forward { tag, args, token } => Envelope::encode(
            tag,
            args.iter().cloned().chain(std::iter::once(json!(token))),
        ),
    }
}

fn from_value<T: DeserializeOwned>(tag: &str, value: Value) -> Result<T, CodecError> {
    serde_json::from_value(value).map_err(|e| CodecError::payload(tag, e))
}

/// Positional records; a single array argument is flattened.
fn records<T: DeserializeOwned>(tag: &str, args: Vec<Value>) -> Result<Vec<T>, CodecError> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            Value::Array(items) => {
                for item in items {
                    out.push(from_value(tag, item)?);
                }
            }
            other => out.push(from_value(tag, other)?),
        }
    }
    Ok(out)
}

/// Like [`records`], but malformed records are logged and skipped.
fn lenient_records<T: DeserializeOwned>(tag: &str, args: Vec<Value>) -> Vec<T> {
    args.into_iter()
        .flat_map(|arg| match arg {
            Value::Array(items) => items,
            other => vec![other],
        })
        .filter_map(|item| match from_value(tag, item) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed record");
                None
            }
        })
        .collect()
}

fn compact_order(tag: &str, args: Vec<Value>) -> Result<OrderEvent, CodecError> {
    type Compact = (OrderId, AccountId, SecurityId, Side, f64, f64, OrderStatus, f64, f64);

    if args.len() < 9 {
        return Err(CodecError::payload(tag, "expected 9 positional fields"));
    }
    let fields = Value::Array(args.into_iter().take(9).collect());
    let (id, acc, security, side, qty, price, status, last_qty, last_px): Compact =
        from_value(tag, fields)?;
    Ok(OrderEvent {
        id,
        acc,
        security,
        side,
        qty,
        price,
        status,
        last_qty,
        last_px,
    })
}

fn token_arg(tag: &str, value: Option<&Value>) -> Result<ConnectionToken, CodecError> {
    value
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .ok_or_else(|| CodecError::payload(tag, "missing connection token"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::OrderStatus;

    #[test]
    fn rejects_non_envelopes() {
        assert!(matches!(Envelope::decode("{}"), Err(CodecError::NotEnvelope)));
        assert!(matches!(Envelope::decode("[]"), Err(CodecError::NotEnvelope)));
        assert!(matches!(Envelope::decode("[1, 2]"), Err(CodecError::NotEnvelope)));
        assert!(matches!(Envelope::decode("not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn decodes_connection() {
        let msg = decode_upstream(r#"["connection", "ok", {"userId": 7}]"#).unwrap();
        assert_eq!(
            msg,
            UpstreamMessage::Connection {
                status: "ok".into(),
                user_id: Some(7)
            }
        );
        let msg = decode_upstream(r#"["connection"]"#).unwrap();
        assert!(matches!(msg, UpstreamMessage::Connection { status, .. } if status.is_empty()));
    }

    #[test]
    fn decodes_variadic_and_array_records() {
        let msg = decode_upstream(
            r#"["securities", {"id": 1, "symbol": "AAA"}, [{"id": 2, "symbol": "BBB", "type": "CS"}]]"#,
        )
        .unwrap();
        let UpstreamMessage::Securities(list) = msg else {
            panic!("expected securities");
        };
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].kind, "CS");

        let msg = decode_upstream(r#"["securities"]"#).unwrap();
        assert_eq!(msg, UpstreamMessage::Securities(Vec::new()));
    }

    #[test]
    fn bad_security_records_are_skipped() {
        let msg = decode_upstream(
            r#"["securities", {"id": 1, "symbol": "AAA"}, {"id": 2, "symbol": "BBB", "multiplier": null}, {"id": 3, "symbol": "CCC"}]"#,
        )
        .unwrap();
        let UpstreamMessage::Securities(list) = msg else {
            panic!("expected securities");
        };
        let ids: Vec<_> = list.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn decodes_both_order_forms() {
        let object = decode_upstream(
            r#"["order", {"id": 11, "acc": 1, "security": 2, "side": "buy", "qty": 100, "price": 9.6, "status": "filled", "lastQty": 100, "lastPx": 9.6}]"#,
        )
        .unwrap();
        let compact =
            decode_upstream(r#"["Order", 11, 1, 2, "buy", 100, 9.6, "filled", 100, 9.6]"#).unwrap();
        assert_eq!(object, compact);
        let UpstreamMessage::Order(event) = compact else {
            panic!("expected order");
        };
        assert_eq!(event.status, OrderStatus::Filled);

        assert!(decode_upstream(r#"["Order", 11, 1]"#).is_err());
    }

    #[test]
    fn decodes_user_messages() {
        assert_eq!(
            decode_upstream(r#"["user_sub_account", 5, [1, 2]]"#).unwrap(),
            UpstreamMessage::UserSubAccount {
                user_id: 5,
                accounts: vec![1, 2]
            }
        );
        assert_eq!(
            decode_upstream(r#"["user_validation", 5, 3]"#).unwrap(),
            UpstreamMessage::UserValidation { user_id: 5, token: 3 }
        );
        assert!(decode_upstream(r#"["user_validation", 5]"#).is_err());
    }

    #[test]
    fn decodes_correlated_actions_with_trailing_token() {
        let msg = decode_upstream(r#"["historicalRisk", "P", "R", "x", 9]"#).unwrap();
        assert_eq!(
            msg,
            UpstreamMessage::Correlated {
                action: ViewerAction::HistoricalRisk {
                    portfolio: "P".into(),
                    risk: "R".into(),
                    param: "x".into()
                },
                token: 9
            }
        );
    }

    #[test]
    fn reserved_and_unknown_tags() {
        assert_eq!(
            decode_upstream(r#"["Pnl", 1]"#).unwrap(),
            UpstreamMessage::Reserved("Pnl".into())
        );
        let raw = r#"["news", "hello"]"#;
        assert_eq!(
            decode_upstream(raw).unwrap(),
            UpstreamMessage::Unrecognized {
                tag: "news".into(),
                raw: raw.into()
            }
        );
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            decode_upstream(r#"["bod", {"acc": "x"}]"#),
            Err(CodecError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn encodes_requests() {
        assert_eq!(
            encode_request(&UpstreamRequest::Login {
                username: "admin".into(),
                password: "test".into()
            }),
            r#"["login","admin","test",true]"#
        );
        assert_eq!(encode_request(&UpstreamRequest::Securities), r#"["securities"]"#);
        assert_eq!(encode_request(&UpstreamRequest::Offline), r#"["offline",0]"#);
        assert_eq!(
            encode_request(&UpstreamRequest::Forward {
                tag: "validate_user".into(),
                args: vec![json!("u"), json!("p")],
                token: 4
            }),
            r#"["validate_user","u","p",4]"#
        );
    }
}
