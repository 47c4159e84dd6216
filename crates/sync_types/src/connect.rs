use base64::{
    engine::general_purpose::URL_SAFE_NO_PAD,
    Engine as _,
};
use common::{
    knobs::MAX_HEADER_LENGTH,
    types::{
        ClientGroupId,
        ClientId,
        UserId,
        WsId,
    },
};

use crate::messages::InitConnectionBody;

/// Protocol version segment of the connect URL (`/sync/v3/connect`).
pub const PROTOCOL_VERSION: u32 = 3;

const RESERVED_PARAMS: &[&str] = &[
    "clientID",
    "clientGroupID",
    "userID",
    "baseCookie",
    "ts",
    "lmid",
    "wsid",
    "debugPerf",
];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConnectParamsError {
    #[error("Missing required parameter {0}")]
    MissingParam(&'static str),
    #[error("Invalid value for parameter {0}: {1}")]
    InvalidParam(&'static str, String),
    #[error("Unsupported protocol version {0}")]
    VersionNotSupported(u32),
}

/// Parameters of one sync connection, parsed from the connect URL's query
/// string. Unknown parameters are ignored; a reserved parameter supplied
/// more than once keeps its first value and warns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectParams {
    pub client_id: ClientId,
    pub client_group_id: ClientGroupId,
    pub user_id: Option<UserId>,
    pub base_cookie: Option<String>,
    pub ts: Option<u64>,
    pub lmid: u64,
    pub ws_id: Option<WsId>,
    pub debug_perf: bool,
}

impl ConnectParams {
    pub fn parse<I>(protocol_version: u32, pairs: I) -> Result<Self, ConnectParamsError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if protocol_version != PROTOCOL_VERSION {
            return Err(ConnectParamsError::VersionNotSupported(protocol_version));
        }

        let mut client_id = None;
        let mut client_group_id = None;
        let mut user_id = None;
        let mut base_cookie = None;
        let mut ts = None;
        let mut lmid = None;
        let mut ws_id = None;
        let mut debug_perf = None;

        for (name, value) in pairs {
            let slot: &mut Option<String> = match name.as_str() {
                "clientID" => &mut client_id,
                "clientGroupID" => &mut client_group_id,
                "userID" => &mut user_id,
                "baseCookie" => &mut base_cookie,
                "ts" => &mut ts,
                "lmid" => &mut lmid,
                "wsid" => &mut ws_id,
                "debugPerf" => &mut debug_perf,
                // Unknown parameters are ignored for forward compatibility.
                _ => continue,
            };
            if slot.is_some() {
                tracing::warn!("Duplicate reserved connect parameter {name}; dropping {value:?}");
                continue;
            }
            *slot = Some(value);
        }

        let client_id = client_id
            .filter(|s| !s.is_empty())
            .ok_or(ConnectParamsError::MissingParam("clientID"))?;
        let client_group_id = client_group_id
            .filter(|s| !s.is_empty())
            .ok_or(ConnectParamsError::MissingParam("clientGroupID"))?;
        let ts = match ts {
            None => None,
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|e| ConnectParamsError::InvalidParam("ts", e.to_string()))?,
            ),
        };
        let lmid = match lmid {
            None => 0,
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| ConnectParamsError::InvalidParam("lmid", e.to_string()))?,
        };

        Ok(Self {
            client_id: ClientId::from(client_id),
            client_group_id: ClientGroupId::from(client_group_id),
            user_id: user_id.map(UserId::from),
            base_cookie: base_cookie.filter(|s| !s.is_empty()),
            ts,
            lmid,
            ws_id: ws_id.map(WsId::from),
            debug_perf: matches!(debug_perf.as_deref(), Some("true") | Some("1")),
        })
    }

    pub fn is_reserved_param(name: &str) -> bool {
        RESERVED_PARAMS.contains(&name)
    }
}

/// The payload a client smuggles in the `Sec-WebSocket-Protocol` header:
/// either a full pre-connection `initConnection` body, or (when the encoded
/// body would exceed the header length cap) just the auth token, with
/// `initConnection` re-sent as the first application message.
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderPayload {
    InitConnection(InitConnectionBody),
    AuthToken(String),
}

/// Encode an initConnection body for the protocol header. Returns `None`
/// when the encoding exceeds the header cap and the caller must fall back
/// to a bare auth token.
pub fn encode_init_connection_header(body: &InitConnectionBody) -> Option<String> {
    let json = serde_json::to_string(body).ok()?;
    let encoded = URL_SAFE_NO_PAD.encode(json.as_bytes());
    if encoded.len() > *MAX_HEADER_LENGTH {
        return None;
    }
    Some(encoded)
}

pub fn decode_protocol_header(header: &str) -> HeaderPayload {
    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(header.as_bytes()) {
        if let Ok(body) = serde_json::from_slice::<InitConnectionBody>(&bytes) {
            return HeaderPayload::InitConnection(body);
        }
    }
    HeaderPayload::AuthToken(header.to_owned())
}
