//! Wire protocol for the sync transport.
//!
//! Every frame on the full-duplex stream is a JSON 2-tuple `[tag, body]`.
//! Upstream (client to server) frames are [`ClientMessage`]; downstream
//! frames are [`ServerMessage`]. Bodies are camelCase JSON objects.

mod connect;
mod error;
mod inspect;
mod messages;
mod patches;

pub use connect::{
    decode_protocol_header,
    encode_init_connection_header,
    ConnectParams,
    ConnectParamsError,
    HeaderPayload,
    PROTOCOL_VERSION,
};
pub use error::{
    ErrorBody,
    ErrorKind,
};
pub use inspect::{
    AnalyzeQueryOptions,
    AnalyzeQueryRequest,
    AnalyzeQueryResult,
    InspectDown,
    InspectQueryRow,
    InspectUp,
};
pub use messages::{
    ChangeDesiredQueriesBody,
    ClientMessage,
    ConnectedBody,
    DeleteClientsBody,
    InitConnectionBody,
    PokeEndBody,
    PokePartBody,
    PokeStartBody,
    PushBody,
    PushedMutation,
    ServerMessage,
};
pub use patches::{
    DesiredQueryPatchOp,
    GotQueryPatchOp,
    MutationErrorKind,
    MutationResponse,
    MutationResult,
    QuerySpec,
    RowPatchOp,
    TransformErrorBody,
};
