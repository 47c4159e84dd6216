//! Poke assembly: translating one CVR transition into the three-message
//! sequence each connected client receives.
//!
//! A poke is `pokeStart`, 1..N `pokePart`, `pokeEnd`, sharing one pokeID.
//! Row patches are idempotent set operations keyed by `(table, pk)`;
//! clients with no visible delta receive no poke at all.

use std::collections::BTreeMap;

use common::{
    knobs::POKE_PART_MAX_ROWS,
    types::{
        ClientId,
        CvrVersion,
        QueryHash,
    },
    value::{
        RowData,
        RowKey,
    },
};
use cvr::Cvr;
use sync_types::{
    DesiredQueryPatchOp,
    GotQueryPatchOp,
    MutationResponse,
    PokeEndBody,
    PokePartBody,
    PokeStartBody,
    RowPatchOp,
    ServerMessage,
};

/// Everything one CVR transition changed, accumulated while applying
/// pipeline output and client patches. Row entries hold the latest content
/// seen in the batch, or `None` when the final change carried no data (a
/// removal).
#[derive(Default)]
pub(crate) struct PokeDeltas {
    pub rows: BTreeMap<RowKey, Option<RowData>>,
    pub got_queries: Vec<QueryHash>,
    pub desired_acks: BTreeMap<ClientId, Vec<DesiredQueryPatchOp>>,
    pub lmid_changes: BTreeMap<ClientId, u64>,
    pub mutation_results: BTreeMap<ClientId, Vec<MutationResponse>>,
}

impl PokeDeltas {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
            && self.got_queries.is_empty()
            && self.desired_acks.is_empty()
            && self.lmid_changes.is_empty()
            && self.mutation_results.is_empty()
    }
}

/// Build one client's poke message sequence, or `None` when nothing in the
/// transition is visible to it.
pub(crate) fn build_client_poke(
    client_id: &ClientId,
    base_cookie: Option<CvrVersion>,
    new_version: CvrVersion,
    poke_id: &str,
    prev_cvr: &Cvr,
    new_cvr: &Cvr,
    deltas: &PokeDeltas,
) -> Option<Vec<ServerMessage>> {
    let mut rows_patch = Vec::new();
    for (key, data) in &deltas.rows {
        let was_visible = prev_cvr.client_sees_row(client_id, key);
        let now_visible = new_cvr.client_sees_row(client_id, key);
        match (was_visible, now_visible) {
            (_, true) => {
                // Content (or first sight). No data means the batch only
                // shuffled refcounts; the client's copy is already current.
                if let Some(row) = data {
                    rows_patch.push(RowPatchOp::Put {
                        table: key.table.clone(),
                        id: key.pk.clone(),
                        value: row.clone(),
                    });
                }
            },
            (true, false) => rows_patch.push(RowPatchOp::Del {
                table: key.table.clone(),
                id: key.pk.clone(),
            }),
            (false, false) => {},
        }
    }

    let desired = new_cvr.desired_queries(client_id);
    let got_queries_patch: Vec<GotQueryPatchOp> = deltas
        .got_queries
        .iter()
        .filter(|hash| desired.contains(*hash))
        .map(|hash| GotQueryPatchOp::Put { hash: hash.clone() })
        .collect();
    let desired_ack = deltas.desired_acks.get(client_id).cloned();
    let mutations_patch = deltas
        .mutation_results
        .get(client_id)
        .cloned()
        .unwrap_or_default();
    let lmid_changes = deltas.lmid_changes.clone();

    if rows_patch.is_empty()
        && got_queries_patch.is_empty()
        && desired_ack.is_none()
        && mutations_patch.is_empty()
        && lmid_changes.is_empty()
    {
        return None;
    }

    let mut messages = vec![ServerMessage::PokeStart(PokeStartBody {
        poke_id: poke_id.to_owned(),
        base_cookie: base_cookie.map(|v| v.cookie()),
    })];

    // First part carries the metadata patches; rows stream in bounded
    // chunks so one giant hydration cannot produce an unbounded frame.
    let mut first = PokePartBody {
        poke_id: poke_id.to_owned(),
        got_queries_patch,
        last_mutation_id_changes: lmid_changes,
        mutations_patch,
        ..Default::default()
    };
    if let Some(ack) = desired_ack {
        first.desired_queries_patches.insert(client_id.clone(), ack);
    }
    let mut chunks = rows_patch.chunks(*POKE_PART_MAX_ROWS);
    if let Some(chunk) = chunks.next() {
        first.rows_patch = chunk.to_vec();
    }
    messages.push(ServerMessage::PokePart(first));
    for chunk in chunks {
        messages.push(ServerMessage::PokePart(PokePartBody {
            poke_id: poke_id.to_owned(),
            rows_patch: chunk.to_vec(),
            ..Default::default()
        }));
    }

    messages.push(ServerMessage::PokeEnd(PokeEndBody {
        poke_id: poke_id.to_owned(),
        cookie: new_version.cookie(),
    }));
    Some(messages)
}
