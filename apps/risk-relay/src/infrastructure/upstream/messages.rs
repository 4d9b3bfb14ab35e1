//! Upstream Message Types
//!
//! Every frame in either direction is a JSON array whose first element is a
//! string tag. Inbound frames are decoded into [`UpstreamMessage`] at the
//! boundary; outbound requests are built from [`UpstreamRequest`].

use serde_json::Value;

use crate::domain::market::{
    AccountId, BodRecord, MarketData, OrderEvent, PnlRecord, Security, TargetRecord, UserId,
};
use crate::infrastructure::viewer::{ConnectionToken, ViewerAction};

/// Tag a viewer `login` is rewritten to before it goes upstream.
pub const VALIDATE_USER_TAG: &str = "validate_user";

/// Status value of an accepted upstream login.
pub const CONNECTION_OK: &str = "ok";

/// A decoded upstream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    /// Login verdict: `["connection", status, {userId}]`.
    Connection {
        /// `"ok"` on success.
        status: String,
        /// Id of the relay's own upstream user.
        user_id: Option<UserId>,
    },
    /// One security.
    Security(Box<Security>),
    /// Security master.
    Securities(Vec<Security>),
    /// Beginning-of-day positions.
    Bod(Vec<BodRecord>),
    /// Realized P&L.
    Pnl(Vec<PnlRecord>),
    /// Replay of today's order events.
    Offline(Vec<OrderEvent>),
    /// One order event (`order` object or compact `Order` form).
    Order(OrderEvent),
    /// Quote updates.
    MarketData(Vec<MarketData>),
    /// Target quantities.
    Target(Vec<TargetRecord>),
    /// Accounts a user may see.
    UserSubAccount {
        /// User.
        user_id: UserId,
        /// Accounts.
        accounts: Vec<AccountId>,
    },
    /// Verdict on a viewer login.
    UserValidation {
        /// Positive on success.
        user_id: UserId,
        /// Session that asked.
        token: ConnectionToken,
    },
    /// Origin-correlated file or history action.
    Correlated {
        /// Action to serve.
        action: ViewerAction,
        /// Session that asked.
        token: ConnectionToken,
    },
    /// Known tag with no effect (`Pnl`, `sub_account`, ...).
    Reserved(String),
    /// Any other tag. `raw` is the original frame text.
    Unrecognized {
        /// Frame tag.
        tag: String,
        /// Frame text, forwarded verbatim.
        raw: String,
    },
}

impl UpstreamMessage {
    /// Tags that are accepted but have no effect.
    pub const RESERVED_TAGS: [&'static str; 5] =
        ["Pnl", "sub_account", "broker_account", "algo_def", "market"];

    /// Wire tag, used as a metric label.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Security(_) => "security",
            Self::Securities(_) => "securities",
            Self::Bod(_) => "bod",
            Self::Pnl(_) => "pnl",
            Self::Offline(_) => "offline",
            Self::Order(_) => "order",
            Self::MarketData(_) => "md",
            Self::Target(_) => "target",
            Self::UserSubAccount { .. } => "user_sub_account",
            Self::UserValidation { .. } => "user_validation",
            Self::Correlated { action, .. } => action.tag(),
            Self::Reserved(tag) => tag,
            Self::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// A request written to the upstream link.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamRequest {
    /// `["login", username, password, true]`
    Login {
        /// Login name.
        username: String,
        /// Password.
        password: String,
    },
    /// `["securities"]`
    Securities,
    /// `["bod"]`
    Bod,
    /// `["target"]`
    Target,
    /// `["offline", 0]`
    Offline,
    /// `["pnl"]`
    Pnl,
    /// A viewer request with the session token appended.
    Forward {
        /// Tag after rewriting.
        tag: String,
        /// Positional arguments as received.
        args: Vec<Value>,
        /// Originating session.
        token: ConnectionToken,
    },
}

impl UpstreamRequest {
    /// Requests that bootstrap model state once securities are known.
    #[must_use]
    pub fn bootstrap() -> Vec<Self> {
        vec![Self::Bod, Self::Target, Self::Offline, Self::Pnl]
    }
}

/// An entry on the shared queue fed by every viewer session.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRequest {
    /// Written to the upstream transport.
    Upstream(UpstreamRequest),
    /// Served on the hub against the model and file store.
    Correlated {
        /// Originating session.
        token: ConnectionToken,
        /// Action to serve.
        action: ViewerAction,
    },
}
