use coordination::{test_utils::counting_listener, ElectionGroup, InMemoryElectionGroup};
use proptest::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_no_participants_no_leader() {
    let group = InMemoryElectionGroup::new("1");
    assert_eq!(group.leader(), None);
}

#[tokio::test]
async fn test_single_participant_is_leader() {
    let group = InMemoryElectionGroup::new("1");
    group.add_participant("1").await.unwrap();
    assert_eq!(group.leader().as_deref(), Some("1"));
}

#[tokio::test]
async fn test_second_participant_doesnt_change_leader() {
    let group = InMemoryElectionGroup::new("1");
    group.add_participant("1").await.unwrap();
    group.add_participant("2").await.unwrap();
    assert_eq!(group.leader().as_deref(), Some("1"));
}

#[tokio::test]
async fn test_remove_leader_participant() {
    let group = InMemoryElectionGroup::new("1");
    group.add_participant("1").await.unwrap();
    group.add_participant("2").await.unwrap();
    group.remove_participant("1").await.unwrap();
    assert_eq!(group.leader().as_deref(), Some("2"));
}

#[tokio::test]
async fn test_remove_non_leader_participant() {
    let group = InMemoryElectionGroup::new("1");
    group.add_participant("1").await.unwrap();
    group.add_participant("2").await.unwrap();
    group.remove_participant("2").await.unwrap();
    assert_eq!(group.leader().as_deref(), Some("1"));
}

#[tokio::test]
async fn test_listener_called_on_leader_changed() {
    let group = InMemoryElectionGroup::new("1");
    let (listener, calls) = counting_listener();
    group.register_listener(listener);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    group.add_participant("1").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Leader unchanged.
    group.add_participant("2").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    group.remove_participant("1").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_remove_listener() {
    let group = InMemoryElectionGroup::new("1");
    let (listener, calls) = counting_listener();
    group.register_listener(listener.clone());

    group.add_participant("1").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    group.unregister_listener(&listener);
    group.remove_participant("1").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_listeners_fire_in_registration_order() {
    let group = InMemoryElectionGroup::new("1");
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for name in ["first", "second", "third"] {
        let order = order.clone();
        group.register_listener(Arc::new(move || order.lock().push(name)));
    }
    group.add_participant("1").await.unwrap();
    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_listener_reads_leader_during_notification() {
    let group = Arc::new(InMemoryElectionGroup::new("1"));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let observed = Arc::downgrade(&group);
    let record = seen.clone();
    group.register_listener(Arc::new(move || {
        if let Some(group) = observed.upgrade() {
            record.lock().push(group.leader());
        }
    }));

    group.add_participant("1").await.unwrap();
    group.add_participant("2").await.unwrap();
    group.remove_participant("1").await.unwrap();

    assert_eq!(
        *seen.lock(),
        vec![Some("1".to_string()), Some("2".to_string())]
    );
}

#[tokio::test]
async fn test_removing_absent_participant_is_noop() {
    let group = InMemoryElectionGroup::new("1");
    let (listener, calls) = counting_listener();
    group.register_listener(listener);
    group.remove_participant("ghost").await.unwrap();
    assert_eq!(group.leader(), None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

#[test]
fn test_equals_and_hash_follow_id() {
    let group = InMemoryElectionGroup::new("1");
    assert_eq!(group, InMemoryElectionGroup::new("1"));
    assert_ne!(group, InMemoryElectionGroup::new("2"));
    assert_eq!(hash_of(&group), hash_of(&InMemoryElectionGroup::new("1")));

    let a: Arc<dyn ElectionGroup> = Arc::new(InMemoryElectionGroup::new("1"));
    let b: Arc<dyn ElectionGroup> = Arc::new(InMemoryElectionGroup::new("1"));
    assert_eq!(a, b);
    assert_eq!(hash_of(&*a), hash_of(&*b));
}

#[tokio::test]
async fn test_concurrent_joins_elect_exactly_one_leader() {
    let group = Arc::new(InMemoryElectionGroup::new("1"));
    let (listener, calls) = counting_listener();
    group.register_listener(listener);

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let group = group.clone();
            tokio::spawn(async move { group.add_participant(&i.to_string()).await })
        })
        .collect();
    for result in futures::future::join_all(handles).await {
        result.unwrap().unwrap();
    }

    let participants = group.participants();
    assert_eq!(participants.len(), 32);
    assert_eq!(group.leader(), participants.first().cloned());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[derive(Debug, Clone)]
enum Step {
    Join(u8),
    Leave(u8),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u8..5).prop_map(Step::Join),
        (0u8..5).prop_map(Step::Leave),
    ]
}

proptest! {
    #[test]
    fn leader_is_first_surviving_participant(steps in proptest::collection::vec(step(), 0..40)) {
        let group = InMemoryElectionGroup::new("model");
        let (listener, calls) = counting_listener();
        group.register_listener(listener);

        let mut model: Vec<String> = Vec::new();
        let mut changes = 0;
        for step in steps {
            let before = model.first().cloned();
            match step {
                Step::Join(p) => {
                    model.push(p.to_string());
                    tokio_test::block_on(group.add_participant(&p.to_string())).unwrap();
                }
                Step::Leave(p) => {
                    if let Some(idx) = model.iter().position(|m| *m == p.to_string()) {
                        model.remove(idx);
                    }
                    tokio_test::block_on(group.remove_participant(&p.to_string())).unwrap();
                }
            }
            if model.first().cloned() != before {
                changes += 1;
            }
            prop_assert_eq!(group.leader(), model.first().cloned());
        }
        prop_assert_eq!(calls.load(Ordering::SeqCst), changes);
        prop_assert_eq!(group.participants(), model);
    }
}
