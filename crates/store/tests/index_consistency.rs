#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use smallvec::smallvec;
use tern_core::{DeltaKind, IndexValues, Resource};
use tern_store::{DeltaQueue, Indexer, Indexers, Lister, Store, NAMESPACE_INDEX};

#[derive(Debug, Clone, PartialEq)]
struct Net {
    ns: String,
    name: String,
    class: String,
    zones: Vec<String>,
}

impl Resource for Net {
    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> Option<&str> { Some(&self.ns) }
    fn resource_version(&self) -> Option<&str> { None }
}

fn class_index(n: &Net) -> IndexValues { smallvec![n.class.clone()] }
fn zone_index(n: &Net) -> IndexValues { n.zones.iter().cloned().collect() }

fn net(i: u32, step: u32) -> Net {
    let zones = (0..(i + step) % 3).map(|z| format!("z{}", (z + step) % 4)).collect();
    Net { ns: format!("ns{}", i % 3), name: format!("n{}", i), class: format!("c{}", (i * step) % 5), zones }
}

/// Recompute every bucket from scratch and compare with the live indices.
fn assert_consistent(ix: &Indexer<Net>) {
    let fns: [(&str, fn(&Net) -> IndexValues); 3] =
        [("class", class_index), ("zone", zone_index), (NAMESPACE_INDEX, tern_store::namespace_index::<Net>)];
    for (name, f) in fns {
        let mut want: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for o in ix.list() {
            for v in f(&o) { want.entry(v).or_default().insert(o.key()); }
        }
        let values: Vec<String> = ix.list_index_values(name);
        assert_eq!(values, want.keys().cloned().collect::<Vec<_>>(), "bucket set for index {}", name);
        for (v, keys) in want {
            let got: BTreeSet<String> = ix.index_keys(name, &v).expect("index exists").into_iter().collect();
            assert_eq!(got, keys, "bucket {}={}", name, v);
        }
    }
}

#[test]
fn indices_track_every_mutation() {
    let ix = Indexer::new(Indexers::namespaced().with("class", class_index).with("zone", zone_index));
    for step in 0..6u32 {
        for i in 0..20u32 {
            let n = net(i, step);
            let key = n.key();
            if (i + step) % 7 == 0 {
                ix.delete(&key);
            } else if step % 2 == 0 {
                ix.add(&key, Arc::new(n));
            } else {
                ix.update(&key, Arc::new(n));
            }
        }
        assert_consistent(&ix);
    }
}

#[test]
fn lister_delegates_to_indexer() {
    let ix = Arc::new(Indexer::new(Indexers::namespaced().with("class", class_index)));
    for i in 0..6 {
        let n = net(i, 1);
        ix.add(&n.key(), Arc::new(n));
    }
    let lister = Lister::new(ix.clone());
    assert_eq!(lister.len(), 6);
    assert_eq!(lister.get("ns1/n1").map(|n| n.name.clone()), Some("n1".to_string()));
    assert!(lister.get_namespaced("ns0", "n0").is_some());
    assert!(lister.get("ns9/n1").is_none());

    let mut in_ns0: Vec<String> = lister.list_in_namespace("ns0").expect("indexed").iter().map(|n| n.name.clone()).collect();
    in_ns0.sort();
    assert_eq!(in_ns0, vec!["n0", "n3"]);
    assert!(lister.list_by_index("missing", "x").is_err());

    ix.delete("ns0/n0");
    assert_eq!(lister.list_in_namespace("ns0").expect("indexed").len(), 1);
}

#[tokio::test]
async fn replayed_state_leaves_indices_unchanged() {
    let ix = Arc::new(Indexer::new(Indexers::namespaced().with("class", class_index).with("zone", zone_index)));
    let q = DeltaQueue::new(ix.clone() as Arc<dyn Store<Net>>);
    q.replace((0..12).map(|i| net(i, 2)).collect(), "1");
    let snapshot = |ix: &Indexer<Net>| {
        let mut v: Vec<(String, Vec<String>)> =
            ix.list_index_values("zone").into_iter().map(|z| (z.clone(), sorted(ix.index_keys("zone", &z).unwrap()))).collect();
        v.sort();
        v
    };
    let mut before = None;
    for round in 0..3 {
        drain(&q, &ix).await;
        assert_consistent(&ix);
        assert_eq!(ix.len(), 12);
        let now = snapshot(&ix);
        if let Some(prev) = before.replace(now.clone()) {
            assert_eq!(prev, now, "round {}", round);
        }
        assert_eq!(q.resync(), 12);
    }
    // a re-List with the same objects is just as idempotent
    q.replace((0..12).map(|i| net(i, 2)).collect(), "2");
    drain(&q, &ix).await;
    assert_consistent(&ix);
    assert_eq!(before, Some(snapshot(&ix)));
}

async fn drain(q: &DeltaQueue<Net>, ix: &Indexer<Net>) {
    while !q.is_empty() {
        let run = q.pop().await.expect("queue open");
        for delta in run.deltas {
            assert_ne!(delta.kind, DeltaKind::Deleted);
            ix.update(&run.key, delta.object);
        }
        q.done(&run.key);
    }
}

fn sorted(mut keys: Vec<String>) -> Vec<String> {
    keys.sort();
    keys
}
