//! Tests for the multi-sub-queue primitive: sub-queue transitions, timers,
//! ordering, dependencies and re-parameterisation.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use drover::queue::{ItemDef, ItemState, Queue, QueueError, TtrAction};

fn def(key: &str, priority: u8) -> ItemDef<String> {
    ItemDef::new(key, key.to_string(), priority, Duration::from_secs(60))
}

fn delayed_def(key: &str, delay: Duration) -> ItemDef<String> {
    let mut d = def(key, 0);
    d.delay = delay;
    d
}

#[tokio::test]
async fn add_places_items_in_the_right_sub_queue() {
    let q: Queue<String> = Queue::new("test");

    q.add(def("ready", 0)).await.unwrap();
    q.add(delayed_def("delayed", Duration::from_secs(60)))
        .await
        .unwrap();
    let mut dependent = def("dependent", 0);
    dependent.dependencies = vec!["ready".to_string()];
    q.add(dependent).await.unwrap();

    assert_eq!(q.get("ready").await.unwrap().state, ItemState::Ready);
    assert_eq!(q.get("delayed").await.unwrap().state, ItemState::Delay);
    assert_eq!(q.get("dependent").await.unwrap().state, ItemState::Dependent);

    let stats = q.stats().await;
    assert_eq!((stats.ready, stats.delayed, stats.dependent), (1, 1, 1));
}

#[tokio::test]
async fn reserve_filters_by_reserve_group() {
    let q: Queue<String> = Queue::new("test");
    let mut a = def("a", 0);
    a.reserve_group = "group-a".to_string();
    let mut b = def("b", 0);
    b.reserve_group = "group-b".to_string();
    q.add_many(vec![a, b]).await.unwrap();

    let got = q.reserve(Some("group-b")).await.unwrap();
    assert_eq!(got.key, "b");
    assert_eq!(
        q.reserve(Some("group-b")).await.unwrap_err(),
        QueueError::NothingReady
    );

    // group-less reserve takes anything still ready
    assert_eq!(q.reserve(None).await.unwrap().key, "a");
}

#[tokio::test]
async fn delayed_items_become_ready_when_the_delay_elapses() {
    let q: Queue<String> = Queue::new("test");
    q.add(delayed_def("slow", Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(q.reserve(None).await.unwrap_err(), QueueError::NothingReady);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(q.get("slow").await.unwrap().state, ItemState::Ready);
    assert_eq!(q.reserve(None).await.unwrap().key, "slow");
}

#[tokio::test]
async fn ttr_expiry_returns_reserved_items_to_ready() {
    let q: Queue<String> = Queue::new("test");
    let mut d = def("flaky", 0);
    d.ttr = Duration::from_millis(100);
    q.add(d).await.unwrap();

    q.reserve(None).await.unwrap();
    assert_eq!(q.get("flaky").await.unwrap().state, ItemState::Run);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(q.get("flaky").await.unwrap().state, ItemState::Ready);
}

#[tokio::test]
async fn ttr_callback_can_keep_items_running() {
    let q: Queue<String> = Queue::new("test");
    let expiries = Arc::new(StdMutex::new(0usize));
    let seen = expiries.clone();
    q.set_ttr_callback(Arc::new(move |_data| {
        *seen.lock().unwrap() += 1;
        TtrAction::KeepRunning
    }));

    let mut d = def("sticky", 0);
    d.ttr = Duration::from_millis(100);
    q.add(d).await.unwrap();
    q.reserve(None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(q.get("sticky").await.unwrap().state, ItemState::Run);
    assert!(*expiries.lock().unwrap() >= 1);
}

#[tokio::test]
async fn touch_rearms_the_ttr() {
    let q: Queue<String> = Queue::new("test");
    let mut d = def("job", 0);
    d.ttr = Duration::from_millis(250);
    q.add(d).await.unwrap();
    q.reserve(None).await.unwrap();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        q.touch("job").await.unwrap();
    }
    // kept alive well past the original ttr
    assert_eq!(q.get("job").await.unwrap().state, ItemState::Run);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(q.get("job").await.unwrap().state, ItemState::Ready);
    assert_eq!(
        q.touch("job").await.unwrap_err(),
        QueueError::WrongSubQueue
    );
}

#[tokio::test]
async fn release_passes_through_the_delay_sub_queue() {
    let q: Queue<String> = Queue::new("test");
    q.add(def("job", 0)).await.unwrap();
    q.reserve(None).await.unwrap();

    q.set_delay("job", Duration::from_millis(100)).await.unwrap();
    q.release("job").await.unwrap();
    assert_eq!(q.get("job").await.unwrap().state, ItemState::Delay);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(q.get("job").await.unwrap().state, ItemState::Ready);
}

#[tokio::test]
async fn release_with_zero_delay_is_immediately_ready() {
    let q: Queue<String> = Queue::new("test");
    q.add(def("job", 0)).await.unwrap();
    q.reserve(None).await.unwrap();

    q.set_delay("job", Duration::ZERO).await.unwrap();
    q.release("job").await.unwrap();
    assert_eq!(q.get("job").await.unwrap().state, ItemState::Ready);
}

#[tokio::test]
async fn bury_and_kick_cycle() {
    let q: Queue<String> = Queue::new("test");
    q.add(def("job", 0)).await.unwrap();
    q.reserve(None).await.unwrap();

    q.bury("job").await.unwrap();
    assert_eq!(q.get("job").await.unwrap().state, ItemState::Bury);
    // buried items are not reservable
    assert_eq!(q.reserve(None).await.unwrap_err(), QueueError::NothingReady);
    // and cannot be released or touched
    assert_eq!(
        q.release("job").await.unwrap_err(),
        QueueError::WrongSubQueue
    );

    q.kick("job").await.unwrap();
    assert_eq!(q.get("job").await.unwrap().state, ItemState::Ready);
}

#[tokio::test]
async fn remove_resolves_dependencies() {
    let q: Queue<String> = Queue::new("test");
    q.add_many(vec![def("a", 0), def("b", 0)]).await.unwrap();
    let mut c = def("c", 0);
    c.dependencies = vec!["a".to_string(), "b".to_string()];
    q.add(c).await.unwrap();

    assert_eq!(q.get("c").await.unwrap().state, ItemState::Dependent);

    q.remove("a").await.unwrap();
    assert_eq!(q.get("c").await.unwrap().state, ItemState::Dependent);

    q.remove("b").await.unwrap();
    assert_eq!(q.get("c").await.unwrap().state, ItemState::Ready);
    assert!(q.get("a").await.is_none());
}

#[tokio::test]
async fn change_key_follows_dependency_edges() {
    let q: Queue<String> = Queue::new("test");
    q.add(def("dep", 0)).await.unwrap();
    let mut waiter = def("waiter", 0);
    waiter.dependencies = vec!["dep".to_string()];
    q.add(waiter).await.unwrap();

    q.change_key("dep", "renamed").await.unwrap();
    assert!(q.get("dep").await.is_none());
    assert_eq!(q.get("renamed").await.unwrap().state, ItemState::Ready);

    // resolving under the new name still frees the waiter
    q.remove("renamed").await.unwrap();
    assert_eq!(q.get("waiter").await.unwrap().state, ItemState::Ready);
}

#[tokio::test]
async fn change_key_rejects_collisions() {
    let q: Queue<String> = Queue::new("test");
    q.add_many(vec![def("a", 0), def("b", 0)]).await.unwrap();
    assert_eq!(
        q.change_key("a", "b").await.unwrap_err(),
        QueueError::AlreadyExists
    );
    assert_eq!(
        q.change_key("missing", "c").await.unwrap_err(),
        QueueError::NotFound
    );
}

#[tokio::test]
async fn update_changes_priority_ordering() {
    let q: Queue<String> = Queue::new("test");
    q.add_many(vec![def("first", 0), def("second", 0)])
        .await
        .unwrap();

    // bump "second" above "first"
    q.update(
        "second",
        "",
        "second".to_string(),
        9,
        Duration::ZERO,
        Duration::from_secs(60),
        Vec::new(),
    )
    .await
    .unwrap();

    assert_eq!(q.reserve(None).await.unwrap().key, "second");
    assert_eq!(q.reserve(None).await.unwrap().key, "first");
}

#[tokio::test]
async fn update_moves_items_between_dependent_and_ready() {
    let q: Queue<String> = Queue::new("test");
    q.add_many(vec![def("dep", 0), def("target", 0)])
        .await
        .unwrap();

    // gains a dependency: ready -> dependent
    q.update(
        "target",
        "",
        "target".to_string(),
        0,
        Duration::ZERO,
        Duration::from_secs(60),
        vec!["dep".to_string()],
    )
    .await
    .unwrap();
    assert_eq!(q.get("target").await.unwrap().state, ItemState::Dependent);

    // loses it again: dependent -> ready
    q.update(
        "target",
        "",
        "target".to_string(),
        0,
        Duration::ZERO,
        Duration::from_secs(60),
        Vec::new(),
    )
    .await
    .unwrap();
    assert_eq!(q.get("target").await.unwrap().state, ItemState::Ready);
}

#[tokio::test]
async fn ready_added_callback_sees_whole_batches() {
    let q: Queue<String> = Queue::new("test");
    let batches: Arc<StdMutex<Vec<Vec<String>>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = batches.clone();
    q.set_ready_added_callback(Arc::new(move |batch| {
        let sink = sink.clone();
        Box::pin(async move {
            let mut keys: Vec<String> = batch.into_iter().map(|s| s.key).collect();
            keys.sort();
            sink.lock().unwrap().push(keys);
        })
    }));

    q.add_many(vec![def("a", 0), def("b", 0), def("c", 0)])
        .await
        .unwrap();

    for _ in 0..100 {
        if !batches.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1, "one batch for one add_many");
    assert_eq!(batches[0], vec!["a", "b", "c"]);
}

#[tokio::test]
async fn all_items_and_destroy() {
    let q: Queue<String> = Queue::new("test");
    q.add_many(vec![def("a", 0), def("b", 0)]).await.unwrap();
    assert_eq!(q.all_items().await.len(), 2);

    q.destroy().await;
    assert!(q.all_items().await.is_empty());
    assert_eq!(q.add(def("c", 0)).await.unwrap_err(), QueueError::Closed);
}
