// ABOUTME: Keyed async mutex enforcing a single writer per conversation
// ABOUTME: Lock entries are dropped once no guard or waiter references them
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Pierre Fitness Intelligence

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Per-conversation write locks shared by the orchestrator and the token accountant
#[derive(Clone, Default)]
pub struct ConversationLocks {
    locks: Arc<LockMap>,
}

impl ConversationLocks {
    /// Create an empty lock map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to `conversation_id`
    pub async fn acquire(&self, conversation_id: &str) -> ConversationWriteGuard {
        let mutex = self
            .locks
            .entry(conversation_id.to_owned())
            .or_default()
            .clone();
        let guard = mutex.lock_owned().await;

        ConversationWriteGuard {
            conversation_id: conversation_id.to_owned(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of conversations with a live lock entry
    #[must_use]
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive write access to one conversation, released on drop
pub struct ConversationWriteGuard {
    conversation_id: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ConversationWriteGuard {
    /// Conversation this guard protects
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for ConversationWriteGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Map entry plus nobody else: no holder and no waiter left
        self.locks
            .remove_if(&self.conversation_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl std::fmt::Debug for ConversationWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationWriteGuard")
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = ConversationLocks::new();
        {
            let guard = locks.acquire("c1").await;
            assert_eq!(guard.conversation_id(), "c1");
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_second_writer_waits() {
        let locks = ConversationLocks::new();
        let first = locks.acquire("c1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("c1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_distinct_conversations_do_not_block() {
        let locks = ConversationLocks::new();
        let _a = locks.acquire("a").await;
        let _b = locks.acquire("b").await;
        assert_eq!(locks.active(), 2);
    }
}
