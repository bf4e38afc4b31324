//! Integration tests for the admission scheduler.
//!
//! These tests validate:
//! 1. Items that do not fit block until capacity is released
//! 2. A head item short on capacity is skipped for a later item that fits
//! 3. Unschedulable items are dropped without touching capacity
//! 4. Unconfirmed teardown withholds capacity
//! 5. Blocked workers observe a drained queue
//! 6. Per-family capacity is never exceeded under concurrent load

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError};
use parking_lot::Mutex;
use rand::Rng;

use instance_harvest::core::{
    AdmissionScheduler, AuditAction, FamilyId, InMemoryAuditSink, PendingItem, QuotaTable,
    SharedAuditSink, Teardown, TryAcquire, WorkItem,
};

fn family(id: &str) -> FamilyId {
    FamilyId::new(id)
}

fn item(instance_type: &str, fam: &str, cost: u32) -> PendingItem {
    PendingItem::new(WorkItem::new(instance_type), Some(family(fam)), Some(cost))
}

const WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(100);

#[test]
fn test_second_item_waits_for_release() {
    let scheduler = Arc::new(AdmissionScheduler::new(
        QuotaTable::from_limits([(family("f"), 10)]),
        [item("c5.2xlarge", "f", 6), item("c5.xlarge", "f", 5)],
    ));

    let first = scheduler.acquire().unwrap();
    assert_eq!(first.cost(), 6);
    assert_eq!(scheduler.remaining(&family("f")), Some(4));

    let (tx, rx) = unbounded();
    let waiter = {
        let scheduler = Arc::clone(&scheduler);
        thread::spawn(move || {
            let admission = scheduler.acquire();
            let _ = tx.send(admission.as_ref().map(|a| a.cost()));
            admission
        })
    };

    // Cost 5 does not fit in 4 remaining.
    assert_eq!(rx.recv_timeout(SETTLE), Err(RecvTimeoutError::Timeout));

    scheduler.release(first, Teardown::Confirmed).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(5));
    assert_eq!(scheduler.remaining(&family("f")), Some(5));

    let second = waiter.join().unwrap().unwrap();
    scheduler.release(second, Teardown::Confirmed).unwrap();
    assert_eq!(scheduler.remaining(&family("f")), Some(10));
    assert!(scheduler.acquire().is_none());
}

#[test]
fn test_short_head_item_is_skipped_not_dropped() {
    let scheduler = AdmissionScheduler::new(
        QuotaTable::from_limits([(family("a"), 4), (family("b"), 4)]),
        [
            item("c5.xlarge", "a", 4),
            item("m5.xlarge", "a", 4),
            item("g4dn.small", "b", 1),
        ],
    );

    let first = scheduler.acquire().unwrap();
    assert_eq!(first.item().instance_type(), "c5.xlarge");
    assert_eq!(scheduler.remaining(&family("a")), Some(0));

    // m5.xlarge fits the family but not what is left of it; the scan moves on.
    let second = scheduler.acquire().unwrap();
    assert_eq!(second.item().instance_type(), "g4dn.small");
    assert!(matches!(scheduler.try_acquire(), TryAcquire::Blocked));
    assert_eq!(scheduler.pending_len(), 1);
    assert_eq!(scheduler.stats().dropped, 0);

    scheduler.release(first, Teardown::Confirmed).unwrap();
    let third = scheduler.acquire().unwrap();
    assert_eq!(third.item().instance_type(), "m5.xlarge");
    assert_eq!(scheduler.remaining(&family("a")), Some(0));
    assert_eq!(scheduler.remaining(&family("b")), Some(3));

    scheduler.release(second, Teardown::Confirmed).unwrap();
    scheduler.release(third, Teardown::Confirmed).unwrap();
    assert!(scheduler.acquire().is_none());
}

#[test]
fn test_unknown_family_is_dropped_without_debit() {
    let scheduler = AdmissionScheduler::new(
        QuotaTable::from_limits([(family("f"), 10)]),
        [
            PendingItem::new(WorkItem::new("zz9.mystery"), None, Some(2)),
            item("c5.large", "f", 2),
        ],
    );

    let admission = scheduler.acquire().unwrap();
    assert_eq!(admission.item().instance_type(), "c5.large");
    assert_eq!(scheduler.remaining(&family("f")), Some(8));
    assert_eq!(scheduler.stats().dropped, 1);
    assert_eq!(scheduler.pending_len(), 0);

    scheduler.release(admission, Teardown::Confirmed).unwrap();
    assert!(scheduler.acquire().is_none());
}

#[test]
fn test_unconfirmed_teardown_withholds_capacity() {
    let scheduler = AdmissionScheduler::new(
        QuotaTable::from_limits([(family("f"), 5)]),
        [item("m5.large", "f", 3), item("m5.large", "f", 3)],
    );

    let held = scheduler.acquire().unwrap();
    assert_eq!(scheduler.remaining(&family("f")), Some(2));
    assert!(matches!(scheduler.try_acquire(), TryAcquire::Blocked));

    scheduler.release(held, Teardown::Unconfirmed).unwrap();
    assert_eq!(scheduler.remaining(&family("f")), Some(2));

    // Nothing outstanding can ever free the 3 units, so the second item is
    // dropped instead of blocking forever.
    assert!(matches!(scheduler.try_acquire(), TryAcquire::Drained));
    let stats = scheduler.stats();
    assert_eq!(stats.admitted, 1);
    assert_eq!(stats.withheld, 1);
    assert_eq!(stats.released, 0);
    assert_eq!(stats.dropped, 1);
    assert_eq!(scheduler.remaining(&family("f")), Some(2));
}

#[test]
fn test_blocked_workers_see_drained_queue() {
    let scheduler = Arc::new(AdmissionScheduler::new(
        QuotaTable::from_limits([(family("f"), 4)]),
        [item("r5.xlarge", "f", 4), item("r5.xlarge", "f", 4)],
    ));
    let held = scheduler.acquire().unwrap();

    let (tx, rx) = unbounded();
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let tx = tx.clone();
            thread::spawn(move || {
                let admission = scheduler.acquire();
                let got = admission.is_some();
                if let Some(a) = admission {
                    scheduler.release(a, Teardown::Confirmed).unwrap();
                }
                tx.send(got).unwrap();
            })
        })
        .collect();
    drop(tx);

    assert_eq!(rx.recv_timeout(SETTLE), Err(RecvTimeoutError::Timeout));
    scheduler.release(held, Teardown::Confirmed).unwrap();

    let mut results = vec![rx.recv_timeout(WAIT).unwrap(), rx.recv_timeout(WAIT).unwrap()];
    results.sort_unstable();
    assert_eq!(results, [false, true]);
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(scheduler.remaining(&family("f")), Some(4));
}

#[test]
fn test_release_passes_baton_to_every_fitting_waiter() {
    let scheduler = Arc::new(AdmissionScheduler::new(
        QuotaTable::from_limits([(family("f"), 4)]),
        [
            item("t3.xlarge", "f", 4),
            item("t3.large", "f", 2),
            item("t3.large", "f", 2),
        ],
    ));
    let held = scheduler.acquire().unwrap();

    let (tx, rx) = unbounded();
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let tx = tx.clone();
            thread::spawn(move || {
                let admission = scheduler.acquire().unwrap();
                tx.send(admission.cost()).unwrap();
                admission
            })
        })
        .collect();

    assert_eq!(rx.recv_timeout(SETTLE), Err(RecvTimeoutError::Timeout));
    scheduler.release(held, Teardown::Confirmed).unwrap();

    // One release frees room for both waiting items.
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
    assert_eq!(scheduler.remaining(&family("f")), Some(0));

    for w in workers {
        let a = w.join().unwrap();
        scheduler.release(a, Teardown::Confirmed).unwrap();
    }
    assert!(scheduler.acquire().is_none());
}

#[test]
fn test_audit_trail_records_decisions() {
    let buffer = Arc::new(Mutex::new(InMemoryAuditSink::new(16)));
    let scheduler = AdmissionScheduler::new(
        QuotaTable::from_limits([(family("f"), 4)]),
        [
            item("c5.large", "f", 2),
            item("c5.4xlarge", "f", 16),
            item("c5.large", "f", 2),
        ],
    )
    .with_audit(Box::new(SharedAuditSink::new(Arc::clone(&buffer))));

    let a = scheduler.acquire().unwrap();
    let b = scheduler.acquire().unwrap();
    scheduler.release(a, Teardown::Confirmed).unwrap();
    scheduler.release(b, Teardown::Unconfirmed).unwrap();

    let actions: Vec<AuditAction> = buffer.lock().events().iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        [
            AuditAction::Admit,
            AuditAction::Drop,
            AuditAction::Admit,
            AuditAction::Release,
            AuditAction::Withhold,
        ]
    );
}

#[test]
fn test_concurrent_load_never_exceeds_family_limit() {
    const WORKERS: usize = 8;
    const ITEMS: usize = 300;
    let limits: HashMap<&str, u32> = [("f1", 10), ("f2", 7), ("f3", 3)].into_iter().collect();

    let mut rng = rand::rng();
    let families = ["f1", "f2", "f3"];
    let items: Vec<PendingItem> = (0..ITEMS)
        .map(|i| {
            let fam = families[rng.random_range(0..families.len())];
            item(&format!("x{i}.large"), fam, rng.random_range(1..=8))
        })
        .collect();

    let scheduler = Arc::new(AdmissionScheduler::new(
        QuotaTable::from_limits(limits.iter().map(|(f, l)| (family(f), *l))),
        items,
    ));
    // Units held per family, including withheld ones.
    let held: Arc<Mutex<HashMap<FamilyId, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let limits = Arc::new(limits);

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let held = Arc::clone(&held);
            let limits = Arc::clone(&limits);
            thread::spawn(move || {
                let mut rng = rand::rng();
                while let Some(admission) = scheduler.acquire() {
                    let fam = admission.family().clone();
                    {
                        let mut held = held.lock();
                        let units = held.entry(fam.clone()).or_default();
                        *units += admission.cost();
                        assert!(*units <= limits[fam.as_str()], "{fam} over limit: {units}");
                    }
                    thread::sleep(Duration::from_micros(rng.random_range(0..200)));

                    let teardown = if rng.random_bool(0.05) {
                        Teardown::Unconfirmed
                    } else {
                        *held.lock().entry(fam).or_default() -= admission.cost();
                        Teardown::Confirmed
                    };
                    scheduler.release(admission, teardown).unwrap();
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    let stats = scheduler.stats();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.admitted + stats.dropped, ITEMS as u64);
    assert_eq!(stats.admitted, stats.released + stats.withheld);

    let held = held.lock();
    for (fam, limit) in limits.iter() {
        let withheld = held.get(&family(fam)).copied().unwrap_or_default();
        assert_eq!(scheduler.remaining(&family(fam)), Some(limit - withheld));
    }
}
