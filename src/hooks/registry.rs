// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistent hook attachments.
//!
//! The registry holds callbacks bound to hook points across forward calls.
//! Every forward evaluation (prefill and each decoding step) consults it,
//! so an attached callback fires until its [`HookHandle`] is dropped or
//! removed.  At most one callback may occupy a hook point at a time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::{HookFn, HookPoint, HookSpec, Intervention};
use crate::error::{Result, SteerError};

// ---------------------------------------------------------------------------
// HookId
// ---------------------------------------------------------------------------

/// Identifier of one attachment, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// HookRegistry
// ---------------------------------------------------------------------------

/// One active attachment.
struct Entry {
    /// Attachment id.
    id: HookId,
    /// Where the callback fires.
    point: HookPoint,
    /// The callback.
    hook: HookFn,
}

/// Callbacks attached to a model, in attachment order.
pub(crate) struct HookRegistry {
    /// Active attachments.
    entries: Mutex<Vec<Entry>>,
    /// Next id to hand out.
    next_id: AtomicU64,
}

impl HookRegistry {
    /// An empty registry.
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Lock the entry list.
    fn lock(&self) -> Result<MutexGuard<'_, Vec<Entry>>> {
        self.entries
            .lock()
            .map_err(|_| SteerError::Hook("hook registry lock poisoned".into()))
    }

    /// Attach `hook` at `point`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the point already has a callback.
    pub(crate) fn attach(&self, point: HookPoint, hook: HookFn) -> Result<HookId> {
        let mut entries = self.lock()?;
        if let Some(existing) = entries.iter().find(|e| e.point == point) {
            return Err(SteerError::Hook(format!(
                "hook point `{point}` is already occupied by {}",
                existing.id
            )));
        }
        let id = HookId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, %point, "hook attached");
        entries.push(Entry { id, point, hook });
        Ok(id)
    }

    /// Detach one attachment. Returns `false` if it was already gone.
    pub(crate) fn detach(&self, id: HookId) -> Result<bool> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() < before;
        if removed {
            tracing::debug!(%id, "hook detached");
        }
        Ok(removed)
    }

    /// Detach everything; returns how many attachments were removed.
    pub(crate) fn clear(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let n = entries.len();
        entries.clear();
        if n > 0 {
            tracing::debug!(count = n, "all hooks detached");
        }
        Ok(n)
    }

    /// Active attachments in attachment order.
    pub(crate) fn active(&self) -> Result<Vec<(HookId, HookPoint)>> {
        Ok(self
            .lock()?
            .iter()
            .map(|e| (e.id, e.point.clone()))
            .collect())
    }

    /// Number of active attachments.
    pub(crate) fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Append every attached callback to `spec` as a trailing
    /// [`Intervention::Callback`].
    pub(crate) fn extend_spec(&self, spec: &mut HookSpec) -> Result<()> {
        for entry in self.lock()?.iter() {
            spec.intervene(entry.point.clone(), Intervention::Callback(entry.hook.clone()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HookHandle
// ---------------------------------------------------------------------------

/// Scope guard for one attachment.
///
/// Dropping the handle detaches the callback, on normal exit, early return
/// or unwinding alike.  Call [`keep`](Self::keep) to opt out and manage the
/// attachment by id with [`SteerModel::remove_hook`](crate::SteerModel::remove_hook).
#[must_use = "dropping a HookHandle immediately detaches its hook"]
pub struct HookHandle {
    /// Registry the hook lives in; weak so a handle never keeps a model alive.
    registry: Weak<HookRegistry>,
    /// Attachment id.
    id: HookId,
    /// Where the hook is attached.
    point: HookPoint,
    /// Whether drop should detach.
    armed: bool,
}

impl HookHandle {
    /// Attach `hook` at `point` and return its guard.
    pub(crate) fn attach(registry: &Arc<HookRegistry>, point: HookPoint, hook: HookFn) -> Result<Self> {
        let id = registry.attach(point.clone(), hook)?;
        Ok(Self {
            registry: Arc::downgrade(registry),
            id,
            point,
            armed: true,
        })
    }

    /// Attachment id.
    pub const fn id(&self) -> HookId {
        self.id
    }

    /// Where the hook is attached.
    pub const fn point(&self) -> &HookPoint {
        &self.point
    }

    /// Detach now, reporting failures instead of logging them.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the registry lock is poisoned.
    pub fn remove(mut self) -> Result<()> {
        self.armed = false;
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id)?;
        }
        Ok(())
    }

    /// Disarm the guard and leave the hook attached.
    ///
    /// The caller takes over the obligation to detach it later.
    #[must_use = "the returned id is the only way to detach the hook"]
    pub fn keep(mut self) -> HookId {
        self.armed = false;
        self.id
    }
}

impl fmt::Debug for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandle")
            .field("id", &self.id)
            .field("point", &self.point)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            if let Err(e) = registry.detach(self.id) {
                tracing::error!(id = %self.id, point = %self.point, "failed to detach hook: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
