use std::collections::BTreeMap;

use common::types::{
    ClientId,
    MutationId,
};
use serde::{
    de::Error as _,
    ser::SerializeTuple,
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    error::ErrorBody,
    inspect::{
        InspectDown,
        InspectUp,
    },
    patches::{
        DesiredQueryPatchOp,
        GotQueryPatchOp,
        MutationResponse,
        RowPatchOp,
        TransformErrorBody,
    },
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitConnectionBody {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub desired_queries_patch: Vec<DesiredQueryPatchOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_schema: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_query_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDesiredQueriesBody {
    pub desired_queries_patch: Vec<DesiredQueryPatchOp>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteClientsBody {
    pub client_ids: Vec<ClientId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedMutation {
    pub id: MutationId,
    pub name: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    pub mutations: Vec<PushedMutation>,
    #[serde(default)]
    pub push_version: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStartBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    pub base_cookie: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PokePartBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows_patch: Vec<RowPatchOp>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub desired_queries_patches: BTreeMap<ClientId, Vec<DesiredQueryPatchOp>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub got_queries_patch: Vec<GotQueryPatchOp>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_mutation_id_changes: BTreeMap<ClientId, u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations_patch: Vec<MutationResponse>,
}

impl PokePartBody {
    pub fn is_empty(&self) -> bool {
        self.rows_patch.is_empty()
            && self.desired_queries_patches.is_empty()
            && self.got_queries_patch.is_empty()
            && self.last_mutation_id_changes.is_empty()
            && self.mutations_patch.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEndBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    pub cookie: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedBody {
    #[serde(rename = "wsid")]
    pub ws_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Frames sent by the client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    InitConnection(InitConnectionBody),
    ChangeDesiredQueries(ChangeDesiredQueriesBody),
    DeleteClients(DeleteClientsBody),
    Push(PushBody),
    Pull(JsonValue),
    Ping,
    AckMutationResponses { ack_ids: Vec<MutationId> },
    Inspect(InspectUp),
}

impl ClientMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ClientMessage::InitConnection(..) => "initConnection",
            ClientMessage::ChangeDesiredQueries(..) => "changeDesiredQueries",
            ClientMessage::DeleteClients(..) => "deleteClients",
            ClientMessage::Push(..) => "push",
            ClientMessage::Pull(..) => "pull",
            ClientMessage::Ping => "ping",
            ClientMessage::AckMutationResponses { .. } => "ackMutationResponses",
            ClientMessage::Inspect(..) => "inspect",
        }
    }
}

/// Frames sent by the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Connected(ConnectedBody),
    Error(ErrorBody),
    Pong,
    PokeStart(PokeStartBody),
    PokePart(PokePartBody),
    PokeEnd(PokeEndBody),
    PullResponse(JsonValue),
    PushResponse(JsonValue),
    TransformError(TransformErrorBody),
    InspectResponse(InspectDown),
}

impl ServerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ServerMessage::Connected(..) => "connected",
            ServerMessage::Error(..) => "error",
            ServerMessage::Pong => "pong",
            ServerMessage::PokeStart(..) => "pokeStart",
            ServerMessage::PokePart(..) => "pokePart",
            ServerMessage::PokeEnd(..) => "pokeEnd",
            ServerMessage::PullResponse(..) => "pullResponse",
            ServerMessage::PushResponse(..) => "pushResponse",
            ServerMessage::TransformError(..) => "transformError",
            ServerMessage::InspectResponse(..) => "inspect",
        }
    }

    pub fn is_poke(&self) -> bool {
        matches!(
            self,
            ServerMessage::PokeStart(..) | ServerMessage::PokePart(..) | ServerMessage::PokeEnd(..)
        )
    }
}

fn serialize_frame<S, T>(serializer: S, tag: &str, body: &T) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: Serialize,
{
    let mut tuple = serializer.serialize_tuple(2)?;
    tuple.serialize_element(tag)?;
    tuple.serialize_element(body)?;
    tuple.end()
}

impl Serialize for ClientMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ClientMessage::InitConnection(body) => serialize_frame(serializer, self.tag(), body),
            ClientMessage::ChangeDesiredQueries(body) => {
                serialize_frame(serializer, self.tag(), body)
            },
            ClientMessage::DeleteClients(body) => serialize_frame(serializer, self.tag(), body),
            ClientMessage::Push(body) => serialize_frame(serializer, self.tag(), body),
            ClientMessage::Pull(body) => serialize_frame(serializer, self.tag(), body),
            ClientMessage::Ping => serialize_frame(serializer, self.tag(), &JsonValue::Object(Default::default())),
            ClientMessage::AckMutationResponses { ack_ids } => {
                let body = serde_json::json!({ "ackIDs": ack_ids });
                serialize_frame(serializer, self.tag(), &body)
            },
            ClientMessage::Inspect(body) => serialize_frame(serializer, self.tag(), body),
        }
    }
}

impl<'de> Deserialize<'de> for ClientMessage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, body): (String, JsonValue) = Deserialize::deserialize(deserializer)?;
        let message = match tag.as_str() {
            "initConnection" => {
                ClientMessage::InitConnection(serde_json::from_value(body).map_err(D::Error::custom)?)
            },
            "changeDesiredQueries" => ClientMessage::ChangeDesiredQueries(
                serde_json::from_value(body).map_err(D::Error::custom)?,
            ),
            "deleteClients" => {
                ClientMessage::DeleteClients(serde_json::from_value(body).map_err(D::Error::custom)?)
            },
            "push" => ClientMessage::Push(serde_json::from_value(body).map_err(D::Error::custom)?),
            "pull" => ClientMessage::Pull(body),
            "ping" => ClientMessage::Ping,
            "ackMutationResponses" => {
                #[derive(Deserialize)]
                struct Body {
                    #[serde(rename = "ackIDs", default)]
                    ack_ids: Vec<common::types::MutationId>,
                }
                let body: Body = serde_json::from_value(body).map_err(D::Error::custom)?;
                ClientMessage::AckMutationResponses {
                    ack_ids: body.ack_ids,
                }
            },
            "inspect" => ClientMessage::Inspect(serde_json::from_value(body).map_err(D::Error::custom)?),
            other => return Err(D::Error::custom(format!("Unknown client message tag {other}"))),
        };
        Ok(message)
    }
}

impl Serialize for ServerMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ServerMessage::Connected(body) => serialize_frame(serializer, self.tag(), body),
            ServerMessage::Error(body) => serialize_frame(serializer, self.tag(), body),
            ServerMessage::Pong => serialize_frame(serializer, self.tag(), &JsonValue::Object(Default::default())),
            ServerMessage::PokeStart(body) => serialize_frame(serializer, self.tag(), body),
            ServerMessage::PokePart(body) => serialize_frame(serializer, self.tag(), body),
            ServerMessage::PokeEnd(body) => serialize_frame(serializer, self.tag(), body),
            ServerMessage::PullResponse(body) => serialize_frame(serializer, self.tag(), body),
            ServerMessage::PushResponse(body) => serialize_frame(serializer, self.tag(), body),
            ServerMessage::TransformError(body) => serialize_frame(serializer, self.tag(), body),
            ServerMessage::InspectResponse(body) => serialize_frame(serializer, self.tag(), body),
        }
    }
}

impl<'de> Deserialize<'de> for ServerMessage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, body): (String, JsonValue) = Deserialize::deserialize(deserializer)?;
        let message = match tag.as_str() {
            "connected" => {
                ServerMessage::Connected(serde_json::from_value(body).map_err(D::Error::custom)?)
            },
            "error" => ServerMessage::Error(serde_json::from_value(body).map_err(D::Error::custom)?),
            "pong" => ServerMessage::Pong,
            "pokeStart" => {
                ServerMessage::PokeStart(serde_json::from_value(body).map_err(D::Error::custom)?)
            },
            "pokePart" => {
                ServerMessage::PokePart(serde_json::from_value(body).map_err(D::Error::custom)?)
            },
            "pokeEnd" => ServerMessage::PokeEnd(serde_json::from_value(body).map_err(D::Error::custom)?),
            "pullResponse" => ServerMessage::PullResponse(body),
            "pushResponse" => ServerMessage::PushResponse(body),
            "transformError" => {
                ServerMessage::TransformError(serde_json::from_value(body).map_err(D::Error::custom)?)
            },
            "inspect" => {
                ServerMessage::InspectResponse(serde_json::from_value(body).map_err(D::Error::custom)?)
            },
            other => return Err(D::Error::custom(format!("Unknown server message tag {other}"))),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    use super::{
        ClientMessage,
        PokeEndBody,
        PokePartBody,
        PokeStartBody,
        ServerMessage,
    };

    #[test]
    fn test_frame_is_two_tuple() {
        let msg = ServerMessage::PokeStart(PokeStartBody {
            poke_id: "p1".into(),
            base_cookie: Some("5:0".into()),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!(["pokeStart", {"pokeID": "p1", "baseCookie": "5:0"}])
        );
    }

    #[test]
    fn test_poke_sequence_roundtrip() {
        let frames = vec![
            ServerMessage::PokeStart(PokeStartBody {
                poke_id: "p1".into(),
                base_cookie: None,
            }),
            ServerMessage::PokePart(PokePartBody {
                poke_id: "p1".into(),
                last_mutation_id_changes: btreemap! {"c1".into() => 5},
                ..Default::default()
            }),
            ServerMessage::PokeEnd(PokeEndBody {
                poke_id: "p1".into(),
                cookie: "6:0".into(),
            }),
        ];
        for frame in frames {
            let encoded = serde_json::to_string(&frame).unwrap();
            let decoded: ServerMessage = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_ping_pong() {
        let encoded = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(encoded, r#"["ping",{}]"#);
        let decoded: ClientMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, ClientMessage::Ping);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let result: Result<ClientMessage, _> = serde_json::from_str(r#"["nonsense", {}]"#);
        assert!(result.is_err());
    }
}
