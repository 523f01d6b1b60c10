// ── Cross-source identity ──
//
// Maps (source, server, external user id) to one internal user id so the
// same person is recognized across servers.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use tracing::warn;

use crate::error::CoreError;
use crate::model::{Source, UNRESOLVED_USER_ID};

/// Everything a resolver may use to find or create a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolveRequest {
    pub source: Source,
    pub server_id: String,
    pub external_user_id: String,
    pub username: Option<String>,
    pub friendly_name: Option<String>,
}

pub trait UserResolver: Send + Sync {
    fn resolve<'a>(&'a self, request: &'a ResolveRequest) -> BoxFuture<'a, Result<i64, CoreError>>;
}

/// Resolve the internal user id, falling back to [`UNRESOLVED_USER_ID`].
///
/// Resolution is skipped for an empty external id or a missing resolver.
/// Resolver errors are logged and never drop the event.
pub async fn resolve_user_id(resolver: Option<&dyn UserResolver>, request: &ResolveRequest) -> i64 {
    let Some(resolver) = resolver else {
        return UNRESOLVED_USER_ID;
    };
    if request.external_user_id.trim().is_empty() {
        return UNRESOLVED_USER_ID;
    }

    match resolver.resolve(request).await {
        Ok(id) => id,
        Err(e) => {
            warn!(
                source = %request.source,
                server_id = %request.server_id,
                external_user_id = %request.external_user_id,
                error = %e,
                "user resolution failed, continuing unresolved"
            );
            UNRESOLVED_USER_ID
        }
    }
}

// ── In-memory resolver ───────────────────────────────────────────────

type IdentityKey = (Source, String, String);

/// Process-local identity map. Ids are assigned sequentially from 1 on
/// first sight of a key; [`link`](Self::link) merges a key into an
/// existing user.
#[derive(Debug)]
pub struct MemoryIdentityMap {
    ids: DashMap<IdentityKey, i64>,
    names: DashMap<i64, String>,
    next: AtomicI64,
}

impl MemoryIdentityMap {
    pub fn new() -> Self {
        Self {
            ids: DashMap::new(),
            names: DashMap::new(),
            next: AtomicI64::new(1),
        }
    }

    /// Map an external account onto an existing internal user.
    pub fn link(
        &self,
        source: Source,
        server_id: impl Into<String>,
        external_user_id: impl Into<String>,
        user_id: i64,
    ) {
        self.ids
            .insert((source, server_id.into(), external_user_id.into()), user_id);
    }

    pub fn lookup(&self, source: Source, server_id: &str, external_user_id: &str) -> Option<i64> {
        self.ids
            .get(&(source, server_id.to_owned(), external_user_id.to_owned()))
            .map(|id| *id)
    }

    /// Best display name seen for a user.
    pub fn display_name(&self, user_id: i64) -> Option<String> {
        self.names.get(&user_id).map(|n| n.clone())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn resolve_now(&self, request: &ResolveRequest) -> i64 {
        let key = (
            request.source,
            request.server_id.clone(),
            request.external_user_id.clone(),
        );
        let id = *self
            .ids
            .entry(key)
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed));

        let hint = request
            .friendly_name
            .as_deref()
            .or(request.username.as_deref())
            .filter(|n| !n.is_empty());
        if let Some(name) = hint {
            self.names.entry(id).or_insert_with(|| name.to_owned());
        }
        id
    }
}

impl Default for MemoryIdentityMap {
    fn default() -> Self {
        Self::new()
    }
}

impl UserResolver for MemoryIdentityMap {
    fn resolve<'a>(&'a self, request: &'a ResolveRequest) -> BoxFuture<'a, Result<i64, CoreError>> {
        Box::pin(async move { Ok(self.resolve_now(request)) })
    }
}
