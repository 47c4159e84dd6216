use std::{
    collections::BTreeSet,
    sync::LazyLock,
};

use common::types::ClientGroupId;
use parking_lot::Mutex;

static AUTHENTICATED_GROUPS: LazyLock<Mutex<BTreeSet<ClientGroupId>>> =
    LazyLock::new(|| Mutex::new(BTreeSet::new()));

/// Process-wide set of client groups that have passed inspector
/// authentication. Lifetime spans the process; add/remove are idempotent.
pub struct AdminAuthSet;

impl AdminAuthSet {
    pub fn add(client_group_id: &ClientGroupId) {
        AUTHENTICATED_GROUPS.lock().insert(client_group_id.clone());
    }

    pub fn remove(client_group_id: &ClientGroupId) {
        AUTHENTICATED_GROUPS.lock().remove(client_group_id);
    }

    pub fn contains(client_group_id: &ClientGroupId) -> bool {
        AUTHENTICATED_GROUPS.lock().contains(client_group_id)
    }
}
