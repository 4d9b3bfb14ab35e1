//! Viewer Request Types

use serde_json::Value;

use crate::infrastructure::upstream::codec::{CodecError, Envelope};

/// File and history actions answered on behalf of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerAction {
    /// `["riskFile", name]`
    RiskFile {
        /// File name.
        name: String,
    },
    /// `["saveRiskFile", name, content]`
    SaveRiskFile {
        /// File name.
        name: String,
        /// New content.
        content: String,
    },
    /// `["deleteRiskFile", name]`
    DeleteRiskFile {
        /// File name.
        name: String,
    },
    /// `["historicalRisk", portfolio, risk, param]`
    HistoricalRisk {
        /// Portfolio name.
        portfolio: String,
        /// Risk definition name.
        risk: String,
        /// Param name.
        param: String,
    },
}

impl ViewerAction {
    const TAGS: [&'static str; 4] =
        ["riskFile", "saveRiskFile", "deleteRiskFile", "historicalRisk"];

    /// Whether `tag` names an action.
    #[must_use]
    pub fn is_action_tag(tag: &str) -> bool {
        Self::TAGS.contains(&tag)
    }

    /// Wire tag.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::RiskFile { .. } => "riskFile",
            Self::SaveRiskFile { .. } => "saveRiskFile",
            Self::DeleteRiskFile { .. } => "deleteRiskFile",
            Self::HistoricalRisk { .. } => "historicalRisk",
        }
    }

    /// Decode the positional arguments of an action tag.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidPayload` when a required string argument
    /// is missing or `tag` is not an action.
    pub fn from_args(tag: &str, args: &[Value]) -> Result<Self, CodecError> {
        let text = |i: usize, what: &str| {
            args.get(i)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| CodecError::payload(tag, format!("missing {what}")))
        };
        match tag {
            "riskFile" => Ok(Self::RiskFile {
                name: text(0, "file name")?,
            }),
            "saveRiskFile" => Ok(Self::SaveRiskFile {
                name: text(0, "file name")?,
                content: text(1, "content")?,
            }),
            "deleteRiskFile" => Ok(Self::DeleteRiskFile {
                name: text(0, "file name")?,
            }),
            "historicalRisk" => Ok(Self::HistoricalRisk {
                portfolio: text(0, "portfolio name")?,
                risk: text(1, "risk name")?,
                param: text(2, "param name")?,
            }),
            _ => Err(CodecError::payload(tag, "not a viewer action")),
        }
    }
}

/// A decoded viewer frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerRequest {
    /// `["login", ...credentials]`, checked upstream.
    Login(Vec<Value>),
    /// File or history action.
    Action(ViewerAction),
    /// Anything else, forwarded upstream verbatim.
    Forward {
        /// Frame tag.
        tag: String,
        /// Positional arguments.
        args: Vec<Value>,
    },
}

impl ViewerRequest {
    /// Decode one viewer frame.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` for non-envelopes and malformed action arguments.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let Envelope { tag, args } = Envelope::decode(text)?;
        if tag == "login" {
            Ok(Self::Login(args))
        } else if ViewerAction::is_action_tag(&tag) {
            ViewerAction::from_args(&tag, &args).map(Self::Action)
        } else {
            Ok(Self::Forward { tag, args })
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_login_and_forwarded_frames() {
        assert_eq!(
            ViewerRequest::decode(r#"["login", "u", "p"]"#).unwrap(),
            ViewerRequest::Login(vec![json!("u"), json!("p")])
        );
        assert_eq!(
            ViewerRequest::decode(r#"["order", {"qty": 1}]"#).unwrap(),
            ViewerRequest::Forward {
                tag: "order".into(),
                args: vec![json!({"qty": 1})]
            }
        );
    }

    #[test]
    fn decodes_actions() {
        assert_eq!(
            ViewerRequest::decode(r#"["saveRiskFile", "a.ini", "[A]\nx=1\n"]"#).unwrap(),
            ViewerRequest::Action(ViewerAction::SaveRiskFile {
                name: "a.ini".into(),
                content: "[A]\nx=1\n".into()
            })
        );
        let action = ViewerAction::from_args("deleteRiskFile", &[json!("m.py")]).unwrap();
        assert_eq!(action.tag(), "deleteRiskFile");
    }

    #[test]
    fn malformed_actions_are_rejected() {
        assert!(ViewerRequest::decode(r#"["saveRiskFile", "a.ini"]"#).is_err());
        assert!(ViewerRequest::decode(r#"["historicalRisk", "P", 1, "x"]"#).is_err());
        assert!(ViewerRequest::decode("hello").is_err());
    }
}
