// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage for in-flight and recently finished migration contexts.
//!
//! The registry is two-level. A process-wide mutex guards the map from VM ID
//! to entry and is only held long enough to look up, insert, or remove an
//! entry. Each entry then guards its context with its own async mutex, which
//! the coordinator holds for the whole of an operation on that VM. This keeps
//! calls for different VMs independent while serializing calls for the same
//! VM.
//!
//! Each entry also mirrors whether its context is still active (not in a
//! terminal phase) in an atomic flag, so a new prepare can detect an
//! overlapping migration without queueing behind the per-VM lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use crate::types::{MigrationContext, MigrationPhase, VmId};

pub(crate) struct Entry {
    ctx: Arc<tokio::sync::Mutex<MigrationContext>>,
    active: AtomicBool,
}

/// Exclusive access to one VM's migration context.
///
/// Phase changes must go through [`ContextGuard::set_phase`] so the entry's
/// active flag stays in step with the context.
pub(crate) struct ContextGuard {
    entry: Arc<Entry>,
    ctx: OwnedMutexGuard<MigrationContext>,

    /// The finished entry this one displaced, if it was newly inserted.
    replaced: Option<Arc<Entry>>,
}

impl ContextGuard {
    pub(crate) fn set_phase(&mut self, phase: MigrationPhase) {
        self.ctx.set_phase(phase);
        self.entry.active.store(!phase.is_terminal(), Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> MigrationContext {
        self.ctx.clone()
    }
}

impl std::ops::Deref for ContextGuard {
    type Target = MigrationContext;

    fn deref(&self) -> &MigrationContext {
        &self.ctx
    }
}

impl std::ops::DerefMut for ContextGuard {
    fn deref_mut(&mut self) -> &mut MigrationContext {
        &mut self.ctx
    }
}

/// A VM already has a migration that has not finished.
#[derive(Debug)]
pub(crate) struct AlreadyActive;

#[derive(Default)]
pub struct MigrationRegistry {
    entries: Mutex<BTreeMap<VmId, Arc<Entry>>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<VmId, Arc<Entry>>> {
        // No code path panics while holding this lock, so a poisoned map is
        // still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `ctx` for its VM and returns it locked, unless the VM
    /// already has an active migration. A finished context for the VM is
    /// replaced, and comes back if the new one is discarded.
    pub(crate) fn insert_new(
        &self,
        ctx: MigrationContext,
    ) -> Result<ContextGuard, AlreadyActive> {
        let vm_id = ctx.vm_id;
        let active = !ctx.phase.is_terminal();
        let locked = Arc::new(tokio::sync::Mutex::new(ctx));
        let guard = locked
            .clone()
            .try_lock_owned()
            .expect("a freshly created mutex is unlocked");
        let entry = Arc::new(Entry { ctx: locked, active: AtomicBool::new(active) });

        let mut entries = self.entries();
        if let Some(existing) = entries.get(&vm_id) {
            if existing.active.load(Ordering::Acquire) {
                return Err(AlreadyActive);
            }
        }
        let replaced = entries.insert(vm_id, entry.clone());
        Ok(ContextGuard { entry, ctx: guard, replaced })
    }

    /// Removes `guard`'s context from the registry, provided it has not been
    /// replaced in the meantime, and reinstates the finished context it
    /// displaced.
    pub(crate) fn discard(&self, guard: ContextGuard) {
        let vm_id = guard.vm_id;
        let mut entries = self.entries();
        if entries.get(&vm_id).is_some_and(|e| Arc::ptr_eq(e, &guard.entry)) {
            match guard.replaced.clone() {
                Some(previous) => entries.insert(vm_id, previous),
                None => entries.remove(&vm_id),
            };
        }
    }

    /// Locks and returns the context for `vm_id`, waiting for any operation
    /// already in progress on that VM.
    pub(crate) async fn lock(&self, vm_id: VmId) -> Option<ContextGuard> {
        let entry = self.entries().get(&vm_id).cloned()?;
        let ctx = entry.ctx.clone().lock_owned().await;
        Some(ContextGuard { entry, ctx, replaced: None })
    }

    /// Returns a snapshot of `vm_id`'s migration.
    pub async fn get(&self, vm_id: VmId) -> Option<MigrationContext> {
        self.lock(vm_id).await.map(|guard| guard.snapshot())
    }

    /// Returns snapshots of all migrations that have not finished.
    pub async fn list_active(&self) -> Vec<MigrationContext> {
        let active: Vec<Arc<Entry>> = self
            .entries()
            .values()
            .filter(|e| e.active.load(Ordering::Acquire))
            .cloned()
            .collect();

        let mut out = Vec::with_capacity(active.len());
        for entry in active {
            let ctx = entry.ctx.lock().await;
            // The migration may have finished while we waited for it.
            if !ctx.phase.is_terminal() {
                out.push(ctx.clone());
            }
        }
        out
    }

    /// Drops finished migrations that completed before `cutoff` and returns
    /// how many were dropped. Entries that are locked are skipped: someone is
    /// still looking at them.
    pub fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.active.load(Ordering::Acquire) {
                return true;
            }
            match entry.ctx.try_lock() {
                Ok(ctx) => !ctx.completed_at.is_some_and(|at| at < cutoff),
                Err(_) => true,
            }
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
