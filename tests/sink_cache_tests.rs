use burn_rolling_sink::cache::{CacheEntry, SinkCache};
use burn_rolling_sink::RollingSinkError;

fn fill(cache: &mut SinkCache<usize>, blocks: usize) {
    for i in 0..blocks {
        cache.insert(CacheEntry::new(i, i * 10)).unwrap();
    }
}

#[test]
fn sink_survives_fifty_blocks_and_size_stays_bounded() {
    let mut cache = SinkCache::new(2, 5).unwrap();
    for i in 0..50 {
        cache.insert(CacheEntry::new(i, i)).unwrap();
        assert!(cache.len() <= 7, "cache grew to {} at block {i}", cache.len());
    }
    assert_eq!(cache.len(), 7);
    assert_eq!(cache.snapshot().block_indices(), vec![0, 1, 45, 46, 47, 48, 49]);
    assert_eq!(cache.stats().evictions, 43);
    assert_eq!(cache.stats().peak_len, 7);
}

#[test]
fn snapshot_is_sink_then_window_in_ascending_order() {
    let mut cache = SinkCache::new(1, 3).unwrap();
    fill(&mut cache, 6);
    let snapshot = cache.snapshot();
    assert_eq!(snapshot.block_indices(), vec![0, 3, 4, 5]);
    let states: Vec<usize> = snapshot.iter().map(|e| *e.state()).collect();
    assert_eq!(states, vec![0, 30, 40, 50]);
    assert!(cache.sink_frozen());
}

#[test]
fn rolled_positions_stay_within_capacity() {
    let mut cache = SinkCache::new(1, 6).unwrap();
    fill(&mut cache, 40);
    let snapshot = cache.snapshot();
    assert_eq!(snapshot.rolled_positions(), (0..7).collect::<Vec<_>>());
    assert_eq!(snapshot.next_position(), 7);
}

#[test]
fn below_capacity_nothing_is_evicted() {
    let mut cache = SinkCache::new(2, 5).unwrap();
    fill(&mut cache, 4);
    assert_eq!(cache.snapshot().block_indices(), vec![0, 1, 2, 3]);
    assert_eq!(cache.stats().evictions, 0);
}

#[test]
fn sink_zero_is_a_plain_sliding_window() {
    let mut cache = SinkCache::new(0, 3).unwrap();
    fill(&mut cache, 10);
    assert_eq!(cache.snapshot().block_indices(), vec![7, 8, 9]);
}

#[test]
fn out_of_order_insert_is_rejected() {
    let mut cache = SinkCache::new(1, 2).unwrap();
    cache.insert(CacheEntry::new(3, 0)).unwrap();
    let err = cache.insert(CacheEntry::new(2, 0)).unwrap_err();
    assert!(matches!(err, RollingSinkError::CacheOrder { index: 2, last: 3 }));
}

#[test]
fn reset_empties_both_regions_and_unfreezes_sink() {
    let mut cache = SinkCache::new(2, 2).unwrap();
    fill(&mut cache, 9);
    cache.reset();
    assert!(cache.is_empty());
    assert!(cache.snapshot().is_empty());
    assert_eq!(cache.stats().insertions, 0);

    // A new request may start again from block 0 and refills the sink.
    fill(&mut cache, 3);
    assert_eq!(cache.snapshot().block_indices(), vec![0, 1, 2]);
}

#[test]
fn zero_capacity_is_a_configuration_error() {
    assert!(matches!(
        SinkCache::<()>::new(0, 0),
        Err(RollingSinkError::Configuration(_))
    ));
}
