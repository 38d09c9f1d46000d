use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use super::error::LockError;
use super::leader::{LeaderElection, LeaderEvent, LeaderListener};
use super::repository::{GuardInner, LockBackend, LockGuard, LockTable};

type Contender = (u64, UnboundedSender<LeaderEvent>);

#[derive(Default)]
struct GroupState {
    leader: Option<Contender>,
    waiting: VecDeque<Contender>,
}

type GroupTable = Arc<Mutex<HashMap<String, GroupState>>>;

/// Mutual exclusion between tasks of one process.
///
/// Locks live in a process-wide table of per-key async mutexes; the table is guarded by its
/// own mutex and entries disappear once nobody holds or waits for them. Leader election is
/// "first contender wins": later contenders queue up and are promoted in arrival order.
#[derive(Default)]
pub struct InProcessLockBackend {
    locks: LockTable,
    groups: GroupTable,
    next_contender: AtomicU64,
}

impl InProcessLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn table_len(&self) -> usize {
        lock_table(&self.locks).len()
    }
}

fn lock_table<T>(table: &Mutex<T>) -> MutexGuard<'_, T> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Table entry reference held while waiting; prunes the entry if the wait is abandoned.
struct PendingEntry {
    key: String,
    table: LockTable,
    entry: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if self.entry.take().is_some() {
            let mut table = lock_table(&self.table);
            if table
                .get(&self.key)
                .is_some_and(|entry| Arc::strong_count(entry) == 1)
            {
                table.remove(&self.key);
            }
        }
    }
}

#[async_trait]
impl LockBackend for InProcessLockBackend {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        let mut pending = {
            let mut table = lock_table(&self.locks);
            let entry = table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            PendingEntry {
                key: key.to_string(),
                table: self.locks.clone(),
                entry: Some(entry),
            }
        };

        let entry = pending
            .entry
            .clone()
            .ok_or_else(|| LockError::Backend("lock table entry vanished".into()))?;
        let guard = entry.lock_owned().await;
        // the owned guard keeps the entry alive from here on
        pending.entry = None;

        debug!(key = %key, "Acquired in-process lock");
        Ok(LockGuard::new(
            key,
            GuardInner::Local {
                guard: Some(guard),
                table: self.locks.clone(),
            },
        ))
    }

    async fn start_leader_election(
        &self,
        group: &str,
        listener: LeaderListener,
    ) -> Result<LeaderElection, LockError> {
        let id = self.next_contender.fetch_add(1, Ordering::SeqCst);
        let groups = self.groups.clone();
        let group_name = group.to_string();

        Ok(LeaderElection::spawn(group, listener, move |events, cancel| {
            {
                let mut table = lock_table(&groups);
                let state = table.entry(group_name.clone()).or_default();
                if state.leader.is_none() {
                    let _ = events.send(LeaderEvent::Elected);
                    state.leader = Some((id, events.clone()));
                    debug!(group = %group_name, contender = id, "In-process contender elected");
                } else {
                    state.waiting.push_back((id, events.clone()));
                    debug!(group = %group_name, contender = id, "In-process contender waiting");
                }
            }

            async move {
                cancel.cancelled().await;
                withdraw(&groups, &group_name, id);
            }
        }))
    }
}

fn withdraw(groups: &GroupTable, group: &str, id: u64) {
    let mut table = lock_table(groups);
    let Some(state) = table.get_mut(group) else {
        return;
    };

    match &state.leader {
        Some((leader, events)) if *leader == id => {
            let _ = events.send(LeaderEvent::Deposed);
            state.leader = state.waiting.pop_front();
            if let Some((next, events)) = &state.leader {
                let _ = events.send(LeaderEvent::Elected);
                debug!(group = %group, contender = next, "In-process leadership handed over");
            }
        }
        _ => state.waiting.retain(|(waiting, _)| *waiting != id),
    }

    if state.leader.is_none() && state.waiting.is_empty() {
        table.remove(group);
    }
}
