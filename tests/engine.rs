use std::cmp::Ordering;

use ccache::{Cache, CacheConfig, CacheError, Entry, OpStats};

/// One size class of capacity 64 holding exactly `nodes` nodes.
fn single_class(nodes: usize) -> CacheConfig {
    let mut cfg = CacheConfig {
        min_size: 64,
        max_size: 64,
        align_size: 8,
        hashitem: 16,
        prealloc_num: nodes,
        ..CacheConfig::default()
    };
    cfg.datasize = cfg.prealloc_bytes();
    cfg
}

fn open(cfg: &CacheConfig) -> Cache {
    Cache::open_with(cfg, None).unwrap()
}

fn keys(cache: &Cache) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    cache.visit(|e| out.push(e.key.to_vec()));
    out.sort();
    out
}

#[test]
fn fresh_cache_is_empty() {
    let cache = open(&CacheConfig::default());
    assert_eq!(cache.visit(|_| panic!("no entries expected")), 0);
    let stats = cache.stats();
    assert_eq!(stats.find, OpStats::default());
    assert_eq!(stats.insert, OpStats::default());
    assert_eq!(stats.update, OpStats::default());
    assert_eq!(stats.set, OpStats::default());
    assert_eq!(stats.erase, OpStats::default());
    assert!(cache.is_empty());
    cache.verify().unwrap();
}

#[test]
fn insert_then_find_round_trips() {
    let cache = open(&CacheConfig::default());
    cache.insert(b"alpha", b"first value", None).unwrap();
    cache.insert(b"", b"empty key", None).unwrap();
    cache.insert(b"beta", b"", None).unwrap();

    assert_eq!(cache.find(b"alpha").unwrap(), b"first value");
    assert_eq!(cache.find(b"").unwrap(), b"empty key");
    assert_eq!(cache.find(b"beta").unwrap(), b"");
    assert_eq!(cache.len(), 3);
    cache.verify().unwrap();
}

#[test]
fn insert_never_overwrites() {
    let cache = open(&CacheConfig::default());
    cache.insert(b"k", b"one", None).unwrap();
    assert!(matches!(
        cache.insert(b"k", b"two", None),
        Err(CacheError::AlreadyExists)
    ));
    assert_eq!(cache.find(b"k").unwrap(), b"one");

    let stats = cache.stats().insert;
    assert_eq!(stats, OpStats { total: 2, success: 1, fail: 1 });
}

#[test]
fn repeated_miss_only_counts_failures() {
    let cache = open(&CacheConfig::default());
    cache.insert(b"present", b"v", None).unwrap();

    for _ in 0..5 {
        assert!(matches!(cache.find(b"absent"), Err(CacheError::NotFound)));
    }
    assert_eq!(cache.stats().find, OpStats { total: 5, success: 0, fail: 5 });
    assert_eq!(keys(&cache), vec![b"present".to_vec()]);
    cache.verify().unwrap();
}

#[test]
fn find_promotes_so_the_untouched_key_is_evicted() {
    let cache = open(&single_class(2));
    cache.insert(b"a", b"1", None).unwrap();
    cache.insert(b"b", b"2", None).unwrap();
    assert_eq!(cache.find(b"a").unwrap(), b"1");

    let mut evicted = Vec::new();
    let mut on_evict = |e: Entry<'_>| evicted.push((e.key.to_vec(), e.value.to_vec()));
    cache.insert(b"c", b"3", Some(&mut on_evict)).unwrap();
    assert_eq!(evicted, vec![(b"b".to_vec(), b"2".to_vec())]);

    assert!(matches!(cache.find(b"b"), Err(CacheError::NotFound)));
    assert_eq!(cache.find(b"a").unwrap(), b"1");
    assert_eq!(cache.find(b"c").unwrap(), b"3");
    cache.verify().unwrap();
}

#[test]
fn overflowing_by_one_evicts_the_least_recent() {
    let n = 8;
    let cache = open(&single_class(n));
    for i in 0..n {
        cache.insert(format!("key{i}").as_bytes(), b"v", None).unwrap();
    }
    // Touch everything except key3, in a scrambled order.
    for i in [5, 0, 7, 1, 6, 2, 4] {
        cache.find(format!("key{i}").as_bytes()).unwrap();
    }

    let mut evicted = Vec::new();
    let mut on_evict = |e: Entry<'_>| evicted.push(e.key.to_vec());
    cache.insert(b"extra", b"v", Some(&mut on_evict)).unwrap();
    assert_eq!(evicted, vec![b"key3".to_vec()]);
    assert_eq!(cache.len(), n);
    cache.verify().unwrap();
}

#[test]
fn eviction_without_callback_just_reclaims() {
    let cache = open(&single_class(1));
    cache.insert(b"old", b"1", None).unwrap();
    cache.insert(b"new", b"2", None).unwrap();
    assert!(matches!(cache.find(b"old"), Err(CacheError::NotFound)));
    assert_eq!(cache.find(b"new").unwrap(), b"2");
}

#[test]
fn update_and_set_promote_too() {
    let cache = open(&single_class(3));
    cache.insert(b"a", b"1", None).unwrap();
    cache.insert(b"b", b"2", None).unwrap();
    cache.insert(b"c", b"3", None).unwrap();
    cache.update(b"a", b"9").unwrap();
    cache.set(b"b", b"8", None, None).unwrap();

    cache.insert(b"d", b"4", None).unwrap();
    assert!(matches!(cache.find(b"c"), Err(CacheError::NotFound)));
    assert_eq!(cache.find(b"a").unwrap(), b"9");
    assert_eq!(cache.find(b"b").unwrap(), b"8");
}

#[test]
fn update_reports_missing_and_mismatched_sizes() {
    let cache = open(&CacheConfig::default());
    assert!(matches!(cache.update(b"nope", b"x"), Err(CacheError::NotFound)));

    cache.insert(b"k", b"abc", None).unwrap();
    assert!(matches!(
        cache.update(b"k", b"abcd"),
        Err(CacheError::SizeMismatch {
            stored_key: 1,
            stored_value: 3,
            key: 1,
            value: 4
        })
    ));
    cache.update(b"k", b"xyz").unwrap();
    assert_eq!(cache.find(b"k").unwrap(), b"xyz");
    assert_eq!(cache.stats().update, OpStats { total: 3, success: 1, fail: 2 });
}

#[test]
fn set_twice_keeps_one_entry_with_the_second_value() {
    let cache = open(&CacheConfig::default());
    cache.set(b"k", b"first", None, None).unwrap();
    cache.set(b"k", b"second!", None, None).unwrap();

    assert_eq!(cache.find(b"k").unwrap(), b"second!");
    assert_eq!(keys(&cache), vec![b"k".to_vec()]);
    assert_eq!(cache.stats().set, OpStats { total: 2, success: 2, fail: 0 });
}

#[test]
fn set_runs_the_update_callback_on_existing_keys() {
    let cache = open(&CacheConfig::default());
    cache.insert(b"counter", b"1", None).unwrap();

    let mut append = |stored: Entry<'_>, value: &mut Vec<u8>| {
        let mut merged = stored.value.to_vec();
        merged.extend_from_slice(value);
        *value = merged;
    };
    let stored = cache.set(b"counter", b"2", None, Some(&mut append)).unwrap();
    assert_eq!(stored, b"12");
    assert_eq!(cache.find(b"counter").unwrap(), b"12");

    // Absent key: inserted as given, callback not consulted.
    let mut never = |_: Entry<'_>, _: &mut Vec<u8>| panic!("no existing entry");
    cache.set(b"fresh", b"x", None, Some(&mut never)).unwrap();
    assert_eq!(cache.find(b"fresh").unwrap(), b"x");
}

#[test]
fn set_rejects_values_beyond_the_slot() {
    let cfg = CacheConfig {
        min_size: 16,
        max_size: 128,
        align_size: 16,
        ..CacheConfig::default()
    };
    let cache = open(&cfg);
    cache.insert(b"k", b"short", None).unwrap();

    let big = vec![b'x'; 40];
    assert!(matches!(
        cache.set(b"k", &big, None, None),
        Err(CacheError::ValueTooLarge { size: 41, limit: 16 })
    ));
    assert_eq!(cache.find(b"k").unwrap(), b"short");
    assert_eq!(cache.stats().set.fail, 1);
    cache.verify().unwrap();
}

#[test]
fn erase_frees_the_node_for_reuse() {
    let cache = open(&single_class(1));
    cache.insert(b"k", b"value", None).unwrap();
    assert_eq!(cache.erase(b"k").unwrap(), b"value");
    assert!(matches!(cache.find(b"k"), Err(CacheError::NotFound)));
    assert!(matches!(cache.erase(b"k"), Err(CacheError::NotFound)));

    let mut evictions = 0;
    let mut on_evict = |_: Entry<'_>| evictions += 1;
    cache.insert(b"other", b"v", Some(&mut on_evict)).unwrap();
    assert_eq!(evictions, 0);
    assert_eq!(cache.stats().erase, OpStats { total: 2, success: 1, fail: 1 });
    cache.verify().unwrap();
}

#[test]
fn oversized_entries_are_rejected_not_truncated() {
    let cache = open(&single_class(2));
    let value = vec![0u8; 64];
    assert!(matches!(
        cache.insert(b"k", &value, None),
        Err(CacheError::ValueTooLarge { size: 65, limit: 64 })
    ));
    assert!(cache.is_empty());
}

#[test]
fn out_of_space_when_no_class_can_fit_even_after_draining() {
    // Two classes, no preallocation, room to carve one small node only.
    let mut cfg = CacheConfig {
        min_size: 32,
        max_size: 64,
        align_size: 32,
        hashitem: 8,
        prealloc_num: 0,
        ..CacheConfig::default()
    };
    cfg.datasize = 96;
    let cache = open(&cfg);

    cache.insert(b"small", b"v", None).unwrap();
    let mut victims = Vec::new();
    let mut on_evict = |e: Entry<'_>| victims.push(e.key.to_vec());
    let big = vec![1u8; 50];
    assert!(matches!(
        cache.insert(b"big", &big, Some(&mut on_evict)),
        Err(CacheError::OutOfSpace { requested: 53 })
    ));
    assert_eq!(victims, vec![b"small".to_vec()]);
    assert!(cache.is_empty());
    cache.verify().unwrap();

    // The reclaimed small node still serves small entries.
    cache.insert(b"again", b"v", None).unwrap();
}

#[test]
fn full_class_evicts_even_when_a_larger_class_has_room() {
    // Classes 16 and 64, one node each.
    let mut cfg = CacheConfig {
        min_size: 16,
        max_size: 64,
        align_size: 48,
        hashitem: 8,
        prealloc_num: 1,
        ..CacheConfig::default()
    };
    cfg.datasize = cfg.prealloc_bytes();
    let cache = open(&cfg);

    cache.insert(b"a", b"1", None).unwrap();
    let mut evicted = Vec::new();
    let mut on_evict = |e: Entry<'_>| evicted.push(e.key.to_vec());
    cache.insert(b"b", b"2", Some(&mut on_evict)).unwrap();

    assert_eq!(evicted, vec![b"a".to_vec()]);
    assert!(matches!(cache.find(b"a"), Err(CacheError::NotFound)));
    assert_eq!(cache.find(b"b").unwrap(), b"2");
    let classes = cache.class_stats();
    assert_eq!((classes[0].total, classes[0].free), (1, 0));
    assert_eq!((classes[1].total, classes[1].free), (1, 1));
    cache.verify().unwrap();
}

#[test]
fn visit_sees_every_entry_without_promoting() {
    let cache = open(&single_class(3));
    for k in [b"x", b"y", b"z"] {
        cache.insert(k, b"v", None).unwrap();
    }

    let mut seen = Vec::new();
    let count = cache.visit(|e| {
        assert_eq!(e.capacity, 64);
        assert_eq!(e.size_class, 0);
        seen.push(e.key.to_vec());
    });
    assert_eq!(count, 3);
    seen.sort();
    assert_eq!(seen, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
    assert_eq!(cache.stats().visits, 1);

    // "x" is still the eviction victim.
    cache.insert(b"w", b"v", None).unwrap();
    assert!(matches!(cache.find(b"x"), Err(CacheError::NotFound)));
}

#[test]
fn custom_comparator_controls_key_equality() {
    // Equal when the first byte matches; every key lands in one bucket so
    // the comparator alone decides.
    let cfg = CacheConfig {
        hashitem: 1,
        ..CacheConfig::default()
    };
    let first_byte = |a: &[u8], b: &[u8]| a.first().cmp(&b.first());
    let cache = Cache::open_with(&cfg, Some(Box::new(first_byte))).unwrap();

    cache.insert(b"apple", b"1", None).unwrap();
    assert!(matches!(
        cache.insert(b"avocado", b"2", None),
        Err(CacheError::AlreadyExists)
    ));
    assert_eq!(cache.find(b"apricot").unwrap(), b"1");
    assert_eq!(first_byte(b"b", b"a"), Ordering::Greater);
}

#[test]
fn no_promotion_mode_evicts_in_write_order() {
    let mut cfg = single_class(2);
    cfg.promote_on_find = false;
    let cache = open(&cfg);

    cache.insert(b"a", b"1", None).unwrap();
    cache.insert(b"b", b"2", None).unwrap();
    assert_eq!(cache.find(b"a").unwrap(), b"1");
    cache.insert(b"c", b"3", None).unwrap();

    assert!(matches!(cache.find(b"a"), Err(CacheError::NotFound)));
    assert_eq!(cache.find(b"b").unwrap(), b"2");
    assert_eq!(cache.stats().find, OpStats { total: 3, success: 2, fail: 1 });
}

#[test]
fn clear_returns_everything_to_the_free_lists() {
    let cache = open(&single_class(4));
    for i in 0..4u8 {
        cache.insert(&[i], b"v", None).unwrap();
    }
    cache.find(&[0]).unwrap();
    cache.clear();

    assert!(cache.is_empty());
    assert_eq!(cache.stats().find, OpStats::default());
    assert_eq!(cache.class_stats()[0].free, 4);
    cache.verify().unwrap();

    for i in 0..4u8 {
        cache.insert(&[i], b"w", None).unwrap();
    }
    assert_eq!(cache.find(&[3]).unwrap(), b"w");
}

#[test]
fn node_accounting_holds_through_churn() {
    let mut cfg = CacheConfig {
        min_size: 8,
        max_size: 64,
        align_size: 8,
        hashitem: 13,
        prealloc_num: 2,
        ..CacheConfig::default()
    };
    cfg.datasize = cfg.prealloc_bytes() + 1024;
    let cache = open(&cfg);

    for round in 0..200usize {
        let key = format!("k{}", round % 37);
        let value = vec![round as u8; round % 50];
        match round % 4 {
            0 | 1 => {
                let _ = cache.insert(key.as_bytes(), &value, None);
            }
            2 => {
                let _ = cache.erase(key.as_bytes());
            }
            _ => {
                let _ = cache.set(key.as_bytes(), &value, None, None);
            }
        }
        cache.verify().unwrap();
    }

    let classes = cache.class_stats();
    let carved: usize = classes.iter().map(|c| c.total).sum();
    let free: usize = classes.iter().map(|c| c.free).sum();
    assert_eq!(free + cache.len(), carved);
}

#[test]
fn heap_cache_ignores_init_false() {
    let cfg = CacheConfig {
        init: false,
        ..single_class(2)
    };
    let cache = open(&cfg);
    assert!(cache.is_empty());
    cache.insert(b"k", b"v", None).unwrap();
    assert_eq!(cache.find(b"k").unwrap(), b"v");
}

#[test]
fn unrepresentable_geometry_is_a_config_error() {
    let huge_class = CacheConfig {
        min_size: 0xFFFF_FFF8,
        max_size: 0xFFFF_FFF8,
        align_size: 8,
        prealloc_num: 0,
        datasize: 64 << 10,
        ..CacheConfig::default()
    };
    let huge_area = CacheConfig {
        datasize: usize::MAX,
        ..CacheConfig::default()
    };
    for cfg in [huge_class, huge_area] {
        assert!(matches!(
            Cache::open_with(&cfg, None),
            Err(CacheError::Config(_))
        ));
    }
}
