//! Stateful property testing for offline writes and reconciliation.
//!
//! Drives a community chat cache against an in-memory backend that goes on
//! and off line, with other clients inserting and deleting rows. The model
//! tracks:
//!
//! - Which messages the remote holds
//! - Which local messages were never confirmed
//! - Which local messages have a push queued in the outbox
//! - What the cache must show after each reconcile

mod common;

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::Runtime;

use murmur_cache::merge::is_well_formed;
use murmur_cache::{CollectionKey, RecordDraft, SyncConfig};
use murmur_remote::{FailureMode, RemoteBackend};

use common::{Harness, foreign_row, harness};

const TABLE: &str = "community_messages";

/// Operations against the chat cache and its backend.
#[derive(Debug, Clone)]
pub enum ChatOperation {
    /// Post a message locally.
    CreateLocal { label: String },
    /// Another client posts a message.
    ExternalInsert { label: String },
    /// Another client deletes a message.
    ExternalDelete { label: String },
    GoOffline,
    GoOnline,
    /// Fetch and merge the remote collection.
    Reconcile,
    /// Work through queued remote writes.
    FlushOutbox,
}

/// Reference model of the chat system.
#[derive(Clone, Debug, Default)]
pub struct ChatModel {
    pub online: bool,
    /// Labels stored remotely.
    pub remote: BTreeSet<String>,
    /// Labels the cache shows.
    pub cached: BTreeSet<String>,
    /// Local labels not yet confirmed by the remote.
    pub unpushed: BTreeSet<String>,
    /// Unpushed labels with a push waiting in the outbox.
    pub queued: BTreeSet<String>,
    /// Source of unique labels.
    pub counter: usize,
}

pub struct ChatSystem;

impl ReferenceStateMachine for ChatSystem {
    type State = ChatModel;
    type Transition = ChatOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(ChatModel {
            online: true,
            ..ChatModel::default()
        })
        .boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let local = format!("local {}", state.counter);
        let foreign = format!("foreign {}", state.counter);
        let toggle = if state.online {
            ChatOperation::GoOffline
        } else {
            ChatOperation::GoOnline
        };

        if state.online && !state.remote.is_empty() {
            let remote: Vec<String> = state.remote.iter().cloned().collect();
            prop_oneof![
                3 => Just(ChatOperation::CreateLocal { label: local }),
                2 => Just(ChatOperation::ExternalInsert { label: foreign }),
                1 => proptest::sample::select(remote)
                    .prop_map(|label| ChatOperation::ExternalDelete { label }),
                1 => Just(toggle),
                3 => Just(ChatOperation::Reconcile),
                3 => Just(ChatOperation::FlushOutbox),
            ]
            .boxed()
        } else {
            prop_oneof![
                3 => Just(ChatOperation::CreateLocal { label: local }),
                2 => Just(ChatOperation::ExternalInsert { label: foreign }),
                1 => Just(toggle),
                3 => Just(ChatOperation::Reconcile),
                3 => Just(ChatOperation::FlushOutbox),
            ]
            .boxed()
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            ChatOperation::CreateLocal { label } => {
                state.counter += 1;
                state.cached.insert(label.clone());
                state.unpushed.insert(label.clone());
                state.queued.insert(label.clone());
            }
            ChatOperation::ExternalInsert { label } => {
                state.counter += 1;
                state.remote.insert(label.clone());
            }
            ChatOperation::ExternalDelete { label } => {
                state.remote.remove(label);
            }
            ChatOperation::GoOffline => state.online = false,
            ChatOperation::GoOnline => state.online = true,
            ChatOperation::Reconcile => {
                if state.online {
                    state.cached = state.remote.union(&state.unpushed).cloned().collect();
                    state.queued.extend(state.unpushed.iter().cloned());
                }
            }
            ChatOperation::FlushOutbox => {
                if state.online {
                    for label in &state.queued {
                        state.remote.insert(label.clone());
                        state.unpushed.remove(label);
                    }
                }
                // Failed pushes are dropped until the next reconcile
                state.queued.clear();
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            ChatOperation::ExternalDelete { label } => state.online && state.remote.contains(label),
            ChatOperation::GoOffline => state.online,
            ChatOperation::GoOnline => !state.online,
            _ => true,
        }
    }
}

/// Test harness that wraps the real caches and reconciler with a tokio
/// runtime.
pub struct ChatTestHarness {
    runtime: Runtime,
    system: Harness,
}

impl ChatTestHarness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let config = SyncConfig {
            // Keep scheduled retries out of the way of the model
            retry_delay: Duration::from_secs(3600),
            ..SyncConfig::default()
        };
        Self {
            runtime,
            system: harness(config),
        }
    }

    fn apply_operation(&self, op: &ChatOperation) {
        let Harness {
            caches,
            backend,
            reconciler,
        } = &self.system;

        self.runtime.block_on(async {
            match op {
                ChatOperation::CreateLocal { label } => {
                    caches
                        .community
                        .create(RecordDraft::text(label.as_str()))
                        .expect("create never needs the network");
                }
                ChatOperation::ExternalInsert { label } => {
                    backend.insert_external(TABLE, &foreign_row("u2", label, Utc::now()));
                }
                ChatOperation::ExternalDelete { label } => {
                    let row = backend
                        .rows(TABLE)
                        .into_iter()
                        .find(|r| r.content == *label)
                        .expect("deleted label exists remotely");
                    backend
                        .delete_record(TABLE, &row.id)
                        .await
                        .expect("backend is online");
                }
                ChatOperation::GoOffline => backend.set_mode(FailureMode::Offline),
                ChatOperation::GoOnline => backend.set_mode(FailureMode::Online),
                ChatOperation::Reconcile => {
                    let _ = reconciler.reconcile(CollectionKey::CommunityMessages).await;
                }
                ChatOperation::FlushOutbox => {
                    reconciler.flush_outbox().await;
                }
            }
        });
    }

    fn verify_invariants(&self, model: &ChatModel) {
        let cache = &self.system.caches.community;
        let records = cache.snapshot();

        // Invariant 1: the cache shows exactly what the model expects
        let shown: BTreeSet<String> = records.iter().map(|r| r.content.clone()).collect();
        assert_eq!(shown, model.cached, "cached labels diverged");

        // Invariant 2: no record appears twice, under any id
        assert_eq!(shown.len(), records.len(), "duplicate records in cache");
        assert!(
            is_well_formed(&records, cache.order()),
            "cache out of order or has duplicate ids"
        );
        let mut keys = HashSet::new();
        assert!(
            records
                .iter()
                .filter_map(|r| r.client_key)
                .all(|k| keys.insert(k)),
            "duplicate idempotency keys in cache"
        );

        // Invariant 3: unconfirmed records match the model
        let unconfirmed: BTreeSet<String> =
            cache.unconfirmed().into_iter().map(|r| r.content).collect();
        assert_eq!(unconfirmed, model.unpushed, "unconfirmed records diverged");

        // Invariant 4: retried pushes never duplicate remote rows
        let remote: Vec<String> = self
            .system
            .backend
            .rows(TABLE)
            .into_iter()
            .map(|r| r.content)
            .collect();
        let unique: BTreeSet<String> = remote.iter().cloned().collect();
        assert_eq!(unique.len(), remote.len(), "duplicate rows remotely");
        assert_eq!(unique, model.remote, "remote rows diverged");
    }
}

impl StateMachineTest for ChatTestHarness {
    type SystemUnderTest = Self;
    type Reference = ChatSystem;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn chat_reconcile_state_machine_test(sequential 1..50 => ChatTestHarness);
}

// Additional targeted tests

#[test]
fn test_reconcile_twice_is_idempotent() {
    let runtime = Runtime::new().unwrap();
    let Harness {
        caches,
        backend,
        reconciler,
    } = harness(SyncConfig::default());

    for i in 0..5 {
        backend.insert_external(TABLE, &foreign_row("u2", &format!("m{i}"), Utc::now()));
    }
    caches.community.create(RecordDraft::text("mine")).unwrap();

    runtime.block_on(async {
        let first = reconciler
            .reconcile(CollectionKey::CommunityMessages)
            .await
            .unwrap();
        let second = reconciler
            .reconcile(CollectionKey::CommunityMessages)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn offline_writes_converge_after_reconnect(count in 1usize..12, foreign in 0usize..6) {
        let runtime = Runtime::new().unwrap();
        let Harness { caches, backend, reconciler } = harness(SyncConfig {
            retry_delay: Duration::from_secs(3600),
            ..SyncConfig::default()
        });

        backend.set_mode(FailureMode::Offline);
        for i in 0..count {
            caches.community.create(RecordDraft::text(format!("offline {i}"))).unwrap();
        }
        for i in 0..foreign {
            backend.insert_external(TABLE, &foreign_row("u2", &format!("foreign {i}"), Utc::now()));
        }

        runtime.block_on(async {
            // Pushes fail while offline and leave local state alone
            reconciler.flush_outbox().await;
            prop_assert_eq!(caches.community.unconfirmed().len(), count);

            backend.set_mode(FailureMode::Online);
            reconciler.reconcile(CollectionKey::CommunityMessages).await.unwrap();
            reconciler.flush_outbox().await;
            let merged = reconciler.reconcile(CollectionKey::CommunityMessages).await.unwrap();

            prop_assert_eq!(merged.len(), count + foreign);
            prop_assert!(caches.community.unconfirmed().is_empty());
            prop_assert_eq!(backend.rows(TABLE).len(), count + foreign);
            Ok::<(), TestCaseError>(())
        })?;
    }
}
