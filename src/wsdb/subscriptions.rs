//! Subscription dispatch for workspace state changes.
//!
//! Refresh code publishes raw deltas onto a channel and returns immediately;
//! a single consumer task resolves current state against the backing store
//! and invokes the registered callback. One consumer means notifications for
//! a single workspace arrive in the order the refreshes observed them, while
//! different workspaces may interleave arbitrarily.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use super::{WorkspaceDb, WorkspaceNonce};
use crate::key::ObjectKey;

/// Snapshot of a subscribed workspace delivered to the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceState {
    /// Current root, `None` once the workspace is gone.
    pub root: Option<ObjectKey>,
    pub nonce: WorkspaceNonce,
    pub immutable: bool,
    pub deleted: bool,
}

pub type SubscriptionCallback = Arc<dyn Fn(HashMap<String, WorkspaceState>) + Send + Sync>;

/// One observed change: full workspace name plus the nonce the backing store
/// reported, or `None` when the name disappeared.
pub(super) type Delta = Vec<(String, Option<WorkspaceNonce>)>;

pub(super) struct Notifier {
    sender: async_channel::Sender<Delta>,
    callback: Arc<Mutex<Option<SubscriptionCallback>>>,
}

impl Notifier {
    /// Spawns the consumer task; must run inside a tokio runtime.
    pub(super) fn spawn(backing: Arc<dyn WorkspaceDb>) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Delta>();
        let callback: Arc<Mutex<Option<SubscriptionCallback>>> = Arc::new(Mutex::new(None));
        tokio::spawn(dispatch_loop(backing, receiver, callback.clone()));
        Self { sender, callback }
    }

    pub(super) fn set_callback(&self, cb: SubscriptionCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(cb);
    }

    /// Hands a delta to the consumer without blocking the refresh path.
    pub(super) fn publish(&self, delta: Delta) {
        if delta.is_empty() {
            return;
        }
        // The channel is unbounded; send only fails once the consumer is
        // gone, at which point notifications are moot.
        let _ = self.sender.try_send(delta);
    }
}

async fn dispatch_loop(
    backing: Arc<dyn WorkspaceDb>,
    receiver: async_channel::Receiver<Delta>,
    callback: Arc<Mutex<Option<SubscriptionCallback>>>,
) {
    while let Ok(delta) = receiver.recv().await {
        let mut states = HashMap::new();
        for (name, nonce) in delta {
            states.insert(name.clone(), resolve(backing.as_ref(), &name, nonce).await);
        }
        let cb = callback.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(cb) = cb {
            cb(states);
        }
    }
}

async fn resolve(
    backing: &dyn WorkspaceDb,
    name: &str,
    nonce: Option<WorkspaceNonce>,
) -> WorkspaceState {
    let Some(nonce) = nonce else {
        return WorkspaceState {
            root: None,
            nonce: WorkspaceNonce::INVALID,
            immutable: false,
            deleted: true,
        };
    };

    let mut parts = name.splitn(3, '/');
    let (Some(typespace), Some(namespace), Some(workspace)) =
        (parts.next(), parts.next(), parts.next())
    else {
        warn!(name, "subscription name is not a workspace triple");
        return WorkspaceState { root: None, nonce, immutable: false, deleted: true };
    };

    match backing.workspace(typespace, namespace, workspace).await {
        Ok((root, current)) => {
            let immutable = backing
                .workspace_is_immutable(typespace, namespace, workspace)
                .await
                .unwrap_or(false);
            WorkspaceState { root: Some(root), nonce: current, immutable, deleted: false }
        }
        // Deleted between the refresh and our lookup.
        Err(_) => WorkspaceState { root: None, nonce, immutable: false, deleted: true },
    }
}
