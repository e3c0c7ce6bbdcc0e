use connect_load::buffers::{BufferPool, PoolError};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn test_rejects_empty_layout() {
    assert_eq!(
        BufferPool::new(0, 4).unwrap_err(),
        PoolError::InvalidLayout {
            segment_len: 0,
            count: 4
        }
    );
    assert!(matches!(
        BufferPool::new(256, 0),
        Err(PoolError::InvalidLayout { .. })
    ));
}

#[test]
fn test_live_segments_never_overlap() {
    let pool = BufferPool::new(64, 16).unwrap();
    let segments: Vec<_> = (0..16).map(|_| pool.take().unwrap()).collect();

    let mut ranges: Vec<(usize, usize)> = segments
        .iter()
        .map(|s| (s.offset(), s.offset() + s.len()))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping segments: {:?}", pair);
    }
    assert!(segments.iter().all(|s| s.len() == 64));
    assert_eq!(pool.outstanding(), 16);
    assert_eq!(pool.available(), 0);
}

#[test]
fn test_take_on_exhausted_pool_is_an_error() {
    let pool = BufferPool::new(8, 2).unwrap();
    let _a = pool.take().unwrap();
    let _b = pool.take().unwrap();
    assert_eq!(
        pool.take().unwrap_err(),
        PoolError::Exhausted { capacity: 2 }
    );
}

#[test]
fn test_returned_segment_can_be_taken_again() {
    let pool = BufferPool::new(16, 1).unwrap();
    let segment = pool.take().unwrap();
    let offset = segment.offset();
    assert!(pool.take().is_err());

    pool.put(segment).unwrap();
    assert_eq!(pool.available(), 1);
    assert_eq!(pool.take().unwrap().offset(), offset);
}

#[test]
fn test_dropping_a_segment_returns_it() {
    let pool = BufferPool::new(16, 3).unwrap();
    {
        let _held = pool.take().unwrap();
        assert_eq!(pool.outstanding(), 1);
    }
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.available(), 3);
}

#[test]
fn test_foreign_segment_is_rejected() {
    let ours = BufferPool::new(16, 1).unwrap();
    let theirs = BufferPool::new(16, 1).unwrap();

    let segment = theirs.take().unwrap();
    assert_eq!(ours.put(segment), Err(PoolError::Foreign));
    // The rejected segment still went home.
    assert_eq!(theirs.available(), 1);
    assert_eq!(ours.available(), 1);
}

#[test]
fn test_writes_stay_inside_their_segment() {
    let pool = BufferPool::new(4, 3).unwrap();
    let mut a = pool.take().unwrap();
    let mut b = pool.take().unwrap();
    a.copy_from_slice(&[1, 1, 1, 1]);
    b.copy_from_slice(&[2, 2, 2, 2]);
    assert_eq!(&a[..], &[1, 1, 1, 1]);
    assert_eq!(&b[..], &[2, 2, 2, 2]);
}

#[test]
fn test_concurrent_take_and_return_keeps_segments_exclusive() {
    const THREADS: usize = 8;
    let pool = Arc::new(BufferPool::new(32, THREADS).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for round in 0..2_000 {
                    let mut segment = pool.take().expect("one segment per thread");
                    let stamp = (t * 31 + round) as u8;
                    segment.fill(stamp);
                    thread::yield_now();
                    assert!(segment.iter().all(|b| *b == stamp), "segment shared");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.available(), THREADS);
    let held: Vec<_> = (0..THREADS).map(|_| pool.take().unwrap()).collect();
    let offsets: HashSet<_> = held.iter().map(|s| s.offset()).collect();
    assert_eq!(offsets.len(), THREADS);
}
