use kovan_splitmap::{Key, SplitMap, TableError};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_distinct_puts() {
    let map = Arc::new(SplitMap::new());
    let threads = 8u32;
    let per_thread = 2_000u32;

    let mut handles = vec![];
    for t in 0..threads {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..per_thread {
                let key = t * per_thread + i;
                m.put(key, key).unwrap();
                m.put(key, key * 2).unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.len(), (threads * per_thread) as usize);
    for key in 0..threads * per_thread {
        assert_eq!(map.get(&key).unwrap(), Some(key * 2));
    }
    assert_eq!(map.get(&(threads * per_thread)).unwrap(), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_growth_from_tiny_table() {
    let map = Arc::new(SplitMap::with_bits(0));
    let barrier = Arc::new(Barrier::new(4));

    let mut handles = vec![];
    for t in 0..4u32 {
        let m = map.clone();
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            for i in 0..5_000u32 {
                let key = i * 4 + t;
                m.put(key, !key).unwrap();
                assert_eq!(m.get(&key).unwrap(), Some(!key));
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert!(map.bits() >= 15);
    for key in 0..20_000u32 {
        assert_eq!(map.get(&key).unwrap(), Some(!key));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_same_key_converges() {
    let map = Arc::new(SplitMap::new());
    let barrier = Arc::new(Barrier::new(8));

    let mut handles = vec![];
    for t in 0..8u64 {
        let m = map.clone();
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            for i in 0..2_000u64 {
                m.put(String::from("shared"), t * 2_000 + i).unwrap();
                assert!(m.get(&String::from("shared")).unwrap().is_some());
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.len(), 1);
    let resident: Vec<_> = map.iter().collect();
    assert_eq!(resident.len(), 1);
    assert_eq!(resident[0].0, "shared");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_insert_remove_cycle() {
    let map = Arc::new(SplitMap::new());

    let mut handles = vec![];
    for t in 0..4u32 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..2_000u32 {
                let key = t * 2_000 + i;
                m.put(key, key).unwrap();
                if i % 2 == 0 {
                    assert_eq!(m.remove(&key).unwrap(), Some(key));
                }
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.len(), 4_000);
    for t in 0..4u32 {
        for i in 0..2_000u32 {
            let key = t * 2_000 + i;
            assert_eq!(map.contains_key(&key).unwrap(), i % 2 != 0);
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_racing_deletes_report_once() {
    let map = Arc::new(SplitMap::new());
    for i in 0..1_000u32 {
        map.put(i, i).unwrap();
    }

    let barrier = Arc::new(Barrier::new(4));
    let mut handles = vec![];
    for _ in 0..4 {
        let m = map.clone();
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            let mut won = vec![];
            for i in 0..1_000u32 {
                if m.delete(&i).unwrap() {
                    won.push(i);
                }
            }
            won
        }));
    }

    let mut all = vec![];
    for h in handles {
        all.extend(h.join().unwrap());
    }

    all.sort_unstable();
    assert_eq!(all, (0..1_000u32).collect::<Vec<_>>());
    assert!(map.is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_readers_during_churn() {
    let map = Arc::new(SplitMap::new());
    for i in 0..512u32 {
        map.put(i, i).unwrap();
    }

    let mut handles = vec![];
    for t in 0..2u32 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for round in 0..200u32 {
                for i in (t..512).step_by(2) {
                    if round % 2 == 0 {
                        m.delete(&i).unwrap();
                    } else {
                        m.put(i, i).unwrap();
                    }
                }
            }
        }));
    }
    for _ in 0..4 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..200 {
                for i in 0..512u32 {
                    if let Some(v) = m.get(&i).unwrap() {
                        assert_eq!(v, i);
                    }
                }
                for (k, v) in m.iter() {
                    assert_eq!(k, v);
                }
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    // Both writers end on an insert round.
    for i in 0..512u32 {
        assert_eq!(map.get(&i).unwrap(), Some(i));
    }
}

/// Keys that collide in groups of four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Grouped(u32);

impl Key for Grouped {
    fn key_hash(&self) -> u32 {
        self.0 / 4
    }

    fn key_eq(&self, other: &Self) -> Result<bool, TableError> {
        Ok(self.0 == other.0)
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_concurrent_colliding_keys() {
    let map = Arc::new(SplitMap::with_bits(1));

    let mut handles = vec![];
    for t in 0..4u32 {
        let m = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..1_000u32 {
                let key = Grouped(i * 4 + t);
                m.put(key, key.0).unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.len(), 4_000);
    let keys: HashSet<_> = map.iter().map(|(k, _)| k).collect();
    assert_eq!(keys.len(), 4_000);
    for k in 0..4_000u32 {
        assert_eq!(map.get(&Grouped(k)).unwrap(), Some(k));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_each_value_handed_back_once() {
    for _ in 0..50 {
        let map = Arc::new(SplitMap::new());
        map.put(7u32, 0u64).unwrap();
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = vec![];
        for t in 0..3u64 {
            let m = map.clone();
            let b = barrier.clone();
            handles.push(thread::spawn(move || {
                b.wait();
                let mut previous = vec![];
                for i in 0..500u64 {
                    if let Some(old) = m.insert(7, 1 + t * 500 + i).unwrap() {
                        previous.push(old);
                    }
                }
                previous
            }));
        }
        {
            let m = map.clone();
            let b = barrier.clone();
            handles.push(thread::spawn(move || {
                b.wait();
                let mut removed = vec![];
                for _ in 0..1_500 {
                    if let Some(old) = m.remove(&7).unwrap() {
                        removed.push(old);
                    }
                }
                removed
            }));
        }

        let mut returned = vec![];
        for h in handles {
            returned.extend(h.join().unwrap());
        }
        if let Some(last) = map.get(&7).unwrap() {
            returned.push(last);
        }

        // Every written value is either replaced, removed or still resident,
        // and never more than one of those.
        returned.sort_unstable();
        assert_eq!(returned, (0..=1_500u64).collect::<Vec<_>>());
    }
}
