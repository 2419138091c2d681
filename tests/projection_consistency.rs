//! Integration tests for projection consistency under concurrent writers
//!
//! Everything runs against the in-memory store so the execution log and
//! fault injection are available.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hangout_projections::coordinator::MemberRemoval;
use hangout_projections::model::keys::{ATTENDANCE_PREFIX, VOTE_PREFIX};
use hangout_projections::model::{
    CounterField, Group, Hangout, HangoutAttribute, HangoutPointer, InterestLevel, InterestStatus,
    ItemKey, NewHangout, Poll, PollOption, Record, SeriesDetails, SeriesPointer, StoreItem,
    Visibility, Vote,
};
use hangout_projections::store::{Condition, OpKind, QueryPage, TimeQuery, WriteIntent};
use hangout_projections::{
    Config, Engine, FeedDirection, GroupMembershipGate, ItemStore, MemoryStore, ProjectionError,
    Result, SyncOutcome,
};

const NOW: i64 = 1_000_000;

fn hangout(id: &str, start: Option<i64>, end: Option<i64>) -> Hangout {
    Hangout {
        hangout_id: id.into(),
        title: id.to_uppercase(),
        description: None,
        start_timestamp: start,
        end_timestamp: end,
        location: None,
        visibility: Visibility::InviteOnly,
        associated_groups: vec!["g1".into()],
        series_id: None,
        carpool_enabled: false,
        created_at: 0,
    }
}

fn engine_with(store: Arc<MemoryStore>, config: Config) -> Engine {
    Engine::new(store, config)
}

/// Group g1 holding H1 and H2 in series S, and standalone H3
async fn seed_series(engine: &Engine) -> String {
    engine
        .create_hangout("alice", hangout("h1", Some(NOW + 100), Some(NOW + 200)))
        .await
        .unwrap();
    engine
        .create_hangout("alice", hangout("h3", Some(NOW + 150), None))
        .await
        .unwrap();
    let series = engine
        .promote_to_series(
            "alice",
            "h1",
            NewHangout {
                hangout_id: Some("h2".into()),
                title: "Second night".into(),
                start_timestamp: Some(NOW + 300),
                end_timestamp: Some(NOW + 400),
                ..Default::default()
            },
            SeriesDetails {
                series_id: Some("s".into()),
                title: "Festival".into(),
                description: None,
            },
        )
        .await
        .unwrap();
    series.series_id
}

/// Concurrent syncs of one pointer lose no mutation and the final version
/// counts every successful write
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_syncs_lose_nothing() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(
        store.clone(),
        Config {
            max_sync_attempts: 64,
            ..Config::default()
        },
    );
    engine
        .create_hangout("alice", hangout("h1", Some(NOW), None))
        .await
        .unwrap();
    let initial = engine.hangout_pointer("g1", "h1").await.unwrap().unwrap().version;

    let writers = 8;
    let mut handles = Vec::new();
    for i in 0..writers {
        let synchronizer = engine.synchronizer.clone();
        handles.push(tokio::spawn(async move {
            let attribute = HangoutAttribute {
                attribute_id: format!("a{}", i),
                hangout_id: "h1".into(),
                name: format!("writer {}", i),
                value: i.to_string(),
            };
            synchronizer
                .sync_hangout_pointer(
                    "g1",
                    "h1",
                    move |pointer| {
                        pointer.attributes.push(attribute.clone());
                        Ok(())
                    },
                    "concurrent attribute",
                )
                .await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        if let SyncOutcome::Applied(_) = handle.await.unwrap().unwrap() {
            applied += 1;
        }
    }
    assert_eq!(applied, writers);

    let pointer = engine.hangout_pointer("g1", "h1").await.unwrap().unwrap();
    assert_eq!(pointer.version, initial + writers as u64);
    assert_eq!(pointer.value.attributes.len(), writers);
}

/// Two concurrent +1 increments land as two blind increments
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_increments_commute() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), Config::default());
    engine
        .create_hangout("alice", hangout("h1", Some(NOW), None))
        .await
        .unwrap();
    store.clear_operations();

    let a = engine.counters.clone();
    let b = engine.counters.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.adjust_participant_count("g1", "h1", 1).await }),
        tokio::spawn(async move { b.adjust_participant_count("g1", "h1", 1).await }),
    );
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();

    let pointer = engine.hangout_pointer("g1", "h1").await.unwrap().unwrap();
    assert_eq!(pointer.value.participant_count, 2);

    let increments = store
        .operations()
        .into_iter()
        .filter(|op| matches!(op.kind, OpKind::Increment { delta: 1, .. }) && op.applied)
        .count();
    assert_eq!(increments, 2);

    // Order does not matter
    for delta in [3, -1, -2, 1] {
        engine
            .counters
            .adjust_participant_count("g1", "h1", delta)
            .await
            .unwrap();
    }
    let pointer = engine.hangout_pointer("g1", "h1").await.unwrap().unwrap();
    assert_eq!(pointer.value.participant_count, 3);
}

/// A structural batch that fails at any item leaves no trace
#[tokio::test]
async fn test_failed_promotion_is_invisible() {
    for fail_at in [0, 1, 3, 5] {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), Config::default());
        engine
            .create_hangout("alice", hangout("h1", Some(NOW + 100), None))
            .await
            .unwrap();
        let rows_before = store.len();
        let canonical_before = store.get(&ItemKey::hangout("h1")).await.unwrap().unwrap();

        store.fail_next_transaction_at(fail_at);
        let result = engine
            .promote_to_series(
                "alice",
                "h1",
                NewHangout {
                    hangout_id: Some("h2".into()),
                    title: "Again".into(),
                    start_timestamp: Some(NOW + 300),
                    ..Default::default()
                },
                SeriesDetails {
                    series_id: Some("s".into()),
                    title: "Series".into(),
                    description: None,
                },
            )
            .await;
        assert!(matches!(result, Err(ProjectionError::TransactionCanceled { .. })), "fail_at {}", fail_at);

        assert_eq!(store.len(), rows_before);
        assert_eq!(store.get(&ItemKey::hangout("h1")).await.unwrap().unwrap(), canonical_before);
        assert!(store.get(&ItemKey::series("s")).await.unwrap().is_none());
        assert!(store.get(&ItemKey::series_pointer("g1", "s")).await.unwrap().is_none());
        assert!(store.get(&ItemKey::hangout("h2")).await.unwrap().is_none());
    }
}

/// Series members collapse into one series entry next to standalone hangouts
#[tokio::test]
async fn test_series_collapses_in_feed() {
    let engine = engine_with(Arc::new(MemoryStore::new()), Config::default());
    let series_id = seed_series(&engine).await;

    let page = engine
        .feed("alice", "g1", NOW, None, None, FeedDirection::Forward)
        .await
        .unwrap();
    let mut ids: Vec<&str> = page.entries.iter().map(|e| e.entity_id()).collect();
    ids.sort();
    assert_eq!(ids, vec![series_id.as_str(), "h3"]);

    // Same rows, same entries
    let again = engine
        .feed("alice", "g1", NOW, None, None, FeedDirection::Forward)
        .await
        .unwrap();
    assert_eq!(page, again);
}

/// Removing every member with Delete leaves no series rows behind
#[tokio::test]
async fn test_removing_last_member_cascades() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), Config::default());
    let series_id = seed_series(&engine).await;

    let first = engine
        .remove_member("alice", &series_id, "h2", MemberRemoval::Delete)
        .await
        .unwrap();
    assert!(!first.series_deleted);
    assert!(first.hangout_deleted);

    let series = engine.series_pointer("g1", &series_id).await.unwrap().unwrap();
    assert_eq!(series.value.hangout_ids, vec!["h1".to_string()]);
    assert_eq!(series.value.parts.len(), 1);

    let last = engine
        .remove_member("alice", &series_id, "h1", MemberRemoval::Delete)
        .await
        .unwrap();
    assert!(last.series_deleted);

    for key in [
        ItemKey::series(&series_id),
        ItemKey::series_pointer("g1", &series_id),
        ItemKey::hangout("h1"),
        ItemKey::hangout_pointer("g1", "h1"),
        ItemKey::hangout("h2"),
        ItemKey::hangout_pointer("g1", "h2"),
    ] {
        assert!(store.get(&key).await.unwrap().is_none(), "{} still present", key);
    }

    // The standalone hangout is untouched
    let page = engine
        .feed("alice", "g1", NOW, None, None, FeedDirection::Forward)
        .await
        .unwrap();
    let ids: Vec<&str> = page.entries.iter().map(|e| e.entity_id()).collect();
    assert_eq!(ids, vec!["h3"]);
}

/// A member edit flows through to the series pointer's embedded part
#[tokio::test]
async fn test_member_edit_reaches_series_part() {
    let engine = engine_with(Arc::new(MemoryStore::new()), Config::default());
    let series_id = seed_series(&engine).await;

    let mut edited = hangout("h2", Some(NOW + 300), Some(NOW + 400));
    edited.title = "Closing night".into();
    engine.update_hangout("alice", edited).await.unwrap();

    let series: SeriesPointer = engine.series_pointer("g1", &series_id).await.unwrap().unwrap().value;
    let part: &HangoutPointer = series.parts.iter().find(|p| p.hangout_id == "h2").unwrap();
    assert_eq!(part.title, "Closing night");
    assert_eq!(part.series_id.as_deref(), Some(series_id.as_str()));
}

/// Membership gate guards reads and edits
#[tokio::test]
async fn test_engine_gates_by_membership() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone(), Config::default())
        .with_gate(Arc::new(GroupMembershipGate::new(store.clone())));
    store
        .put(
            ItemKey::group("g1"),
            StoreItem::Group(Group {
                group_id: "g1".into(),
                group_name: "Crew".into(),
                member_ids: vec!["alice".into()],
                public: false,
                created_at: 0,
            }),
            Condition::NotExists,
        )
        .await
        .unwrap();

    assert!(matches!(
        engine.create_hangout("mallory", hangout("h1", Some(NOW), None)).await,
        Err(ProjectionError::Unauthorized(_))
    ));
    engine
        .create_hangout("alice", hangout("h1", Some(NOW + 10), None))
        .await
        .unwrap();

    assert!(matches!(
        engine.feed("mallory", "g1", NOW, None, None, FeedDirection::Forward).await,
        Err(ProjectionError::Unauthorized(_))
    ));
    let page = engine
        .feed("alice", "g1", NOW, None, None, FeedDirection::Forward)
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);

    assert!(matches!(
        engine.delete_hangout("mallory", "h1").await,
        Err(ProjectionError::Unauthorized(_))
    ));
}

/// Memory store whose reads of per-user rows (RSVPs, votes) stall, so two
/// concurrent updates from the same user both read before either writes
struct SlowUserRowReads {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

impl SlowUserRowReads {
    fn stalls(key: &ItemKey) -> bool {
        key.sk.starts_with(ATTENDANCE_PREFIX) || key.sk.starts_with(VOTE_PREFIX)
    }
}

#[async_trait]
impl ItemStore for SlowUserRowReads {
    fn max_transaction_items(&self) -> usize {
        self.inner.max_transaction_items()
    }

    async fn get(&self, key: &ItemKey) -> Result<Option<Record>> {
        let row = self.inner.get(key).await?;
        if Self::stalls(key) {
            tokio::time::sleep(self.delay).await;
        }
        Ok(row)
    }

    async fn put(&self, key: ItemKey, item: StoreItem, condition: Condition) -> Result<Record> {
        self.inner.put(key, item, condition).await
    }

    async fn delete(&self, key: &ItemKey, condition: Condition) -> Result<bool> {
        self.inner.delete(key, condition).await
    }

    async fn increment(&self, key: &ItemKey, field: CounterField, delta: i64) -> Result<Record> {
        self.inner.increment(key, field, delta).await
    }

    async fn transact(&self, intents: Vec<WriteIntent>) -> Result<()> {
        self.inner.transact(intents).await
    }

    async fn query_window(&self, query: &TimeQuery) -> Result<QueryPage> {
        self.inner.query_window(query).await
    }

    async fn query_partition(&self, pk: &str, sk_prefix: &str) -> Result<Vec<Record>> {
        self.inner.query_partition(pk, sk_prefix).await
    }
}

/// Two overlapping updates from one user apply their count change once
#[tokio::test]
async fn test_same_user_updates_count_once() {
    let store = Arc::new(SlowUserRowReads {
        inner: Arc::new(MemoryStore::new()),
        delay: Duration::from_millis(20),
    });
    let engine = Engine::new(store, Config::default());
    engine
        .create_hangout("alice", hangout("h1", Some(NOW + 100), None))
        .await
        .unwrap();
    engine
        .create_poll(
            "alice",
            Poll {
                poll_id: "p1".into(),
                hangout_id: "h1".into(),
                title: "Bring?".into(),
                options: vec![
                    PollOption { option_id: "food".into(), text: "Food".into() },
                    PollOption { option_id: "drinks".into(), text: "Drinks".into() },
                ],
                active: true,
                created_at: 0,
            },
        )
        .await
        .unwrap();

    let going = |notes: &str| InterestLevel {
        hangout_id: "h1".into(),
        user_id: "bob".into(),
        display_name: "Bob".into(),
        status: InterestStatus::Going,
        notes: Some(notes.into()),
    };
    let (a, b) = tokio::join!(
        engine.set_interest("bob", going("first tap")),
        engine.set_interest("bob", going("second tap")),
    );
    assert_eq!(a.unwrap() + b.unwrap(), 1);

    let vote = |option: &str| Vote {
        hangout_id: "h1".into(),
        poll_id: "p1".into(),
        option_id: option.into(),
        user_id: "bob".into(),
    };
    let (a, b) = tokio::join!(engine.cast_vote("bob", vote("food")), engine.cast_vote("bob", vote("drinks")));
    a.unwrap();
    b.unwrap();

    let pointer = engine.hangout_pointer("g1", "h1").await.unwrap().unwrap().value;
    assert_eq!(pointer.participant_count, 1);
    assert_eq!(pointer.polls[0].total_votes, 1);

    // Incremental state agrees with a rebuild from canonical rows
    let rebuilt = engine.resync_hangout("g1", "h1").await.unwrap().value;
    assert_eq!(rebuilt.participant_count, pointer.participant_count);
    assert_eq!(rebuilt.polls, pointer.polls);
}
