//! Several writers fill a split-ordered map while it grows underneath them.

use kovan_splitmap::SplitMap;
use std::sync::Arc;
use std::thread;

fn main() {
    let map = Arc::new(SplitMap::new());
    println!(
        "start: {} buckets, growth ratio {}",
        map.capacity(),
        map.growth_ratio()
    );

    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..10_000u32 {
                    let key = format!("writer-{}-{}", t, i);
                    map.put(key, i).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    println!(
        "after writes: {} entries, {} buckets ({} materialised)",
        map.len(),
        map.capacity(),
        map.initialized_buckets()
    );

    let key = String::from("writer-2-1234");
    match map.get(&key) {
        Ok(Some(value)) => println!("{} -> {}", key, value),
        Ok(None) => println!("{} missing", key),
        Err(e) => println!("lookup failed: {}", e),
    }

    let removed = map.remove(&key).unwrap();
    println!("removed {:?}, {} entries left", removed, map.len());
}
