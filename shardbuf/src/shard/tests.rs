use super::*;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(2);

fn wait_until_blocked(shard: &Shard<u64>, producers: usize, consumers: usize) {
  let deadline = Instant::now() + TEST_TIMEOUT;
  while shard.blocked() != (producers, consumers) {
    assert!(Instant::now() < deadline, "workers never blocked");
    thread::sleep(Duration::from_millis(1));
  }
}

#[test]
fn new_shard_starts_empty() {
  let shard = Shard::<u64>::new(3, 4);
  let stats = shard.stats();
  assert_eq!(stats.id, 3);
  assert_eq!(stats.capacity, 4);
  assert_eq!(stats.free, 4);
  assert_eq!(stats.occupied, 0);
  assert_eq!(stats.len, 0);
  assert!(stats.is_conserved());
  assert!(shard.is_empty());
}

#[test]
#[should_panic(expected = "at least 1")]
fn zero_capacity_is_rejected() {
  let _ = Shard::<u64>::new(0, 0);
}

#[test]
fn dequeue_order_matches_enqueue_order() {
  let shard = Shard::new(0, 3);
  for v in [10u64, 20, 30] {
    shard.enqueue(v).unwrap();
  }
  assert_eq!(shard.dequeue().unwrap(), 10);
  shard.enqueue(40).unwrap();
  assert_eq!(shard.dequeue().unwrap(), 20);
  assert_eq!(shard.dequeue().unwrap(), 30);
  assert_eq!(shard.dequeue().unwrap(), 40);

  let stats = shard.stats();
  assert_eq!(stats.enqueued, 4);
  assert_eq!(stats.dequeued, 4);
  // Four steps around a ring of three.
  assert_eq!(stats.write_cursor, 1);
  assert_eq!(stats.read_cursor, 1);
  assert!(stats.is_conserved());
}

#[test]
fn try_operations_report_full_and_empty() {
  let shard = Shard::new(5, 1);
  assert_eq!(shard.try_dequeue(), Err(ShardError::Empty { shard: 5 }));
  shard.try_enqueue(1u64).unwrap();
  assert_eq!(shard.try_enqueue(2), Err(ShardError::Full { shard: 5 }));
  assert_eq!(shard.try_dequeue(), Ok(1));
}

#[test]
fn single_slot_shard_alternates() {
  let shard = Arc::new(Shard::new(0, 1));
  let stats = shard.stats();
  assert_eq!((stats.free, stats.occupied), (1, 0));

  let producer = {
    let shard = shard.clone();
    thread::spawn(move || {
      for v in 0..50u64 {
        shard.enqueue(v).unwrap();
        // With one slot, a producer can never be more than one item ahead.
        assert!(shard.len() <= 1);
      }
    })
  };

  for expected in 0..50u64 {
    assert_eq!(shard.dequeue().unwrap(), expected);
  }
  producer.join().unwrap();

  let stats = shard.stats();
  assert_eq!((stats.free, stats.occupied), (1, 0));
}

#[test]
fn enqueue_blocks_while_full() {
  let shard = Arc::new(Shard::new(0, 1));
  shard.enqueue(1u64).unwrap();

  let shard_clone = shard.clone();
  let handle = thread::spawn(move || shard_clone.enqueue(2));

  wait_until_blocked(&shard, 1, 0);
  assert!(!handle.is_finished(), "enqueue should have blocked");
  // Blocked workers hold no permits, so the books balance.
  assert!(shard.stats().is_conserved());

  assert_eq!(shard.dequeue().unwrap(), 1);
  handle.join().unwrap().unwrap();
  assert_eq!(shard.dequeue().unwrap(), 2);
}

#[test]
fn dequeue_timeout_on_empty_shard() {
  let shard = Shard::<u64>::new(1, 2);
  assert_eq!(
    shard.dequeue_timeout(Duration::from_millis(30)),
    Err(ShardError::Timeout { shard: 1 })
  );
  shard.enqueue_timeout(9, Duration::from_millis(30)).unwrap();
  shard.enqueue_timeout(9, Duration::from_millis(30)).unwrap();
  assert_eq!(
    shard.enqueue_timeout(9, Duration::from_millis(30)),
    Err(ShardError::Timeout { shard: 1 })
  );
  assert_eq!(shard.dequeue_timeout(Duration::from_millis(30)), Ok(9));
}

#[test]
fn close_wakes_blocked_consumer() {
  let shard = Arc::new(Shard::<u64>::new(2, 4));
  let shard_clone = shard.clone();
  let handle = thread::spawn(move || shard_clone.dequeue());

  wait_until_blocked(&shard, 0, 1);
  assert!(shard.close());
  assert!(!shard.close());
  assert!(shard.is_closed());

  assert_eq!(handle.join().unwrap(), Err(ShardError::Closed { shard: 2 }));
  assert_eq!(shard.enqueue(1), Err(ShardError::Closed { shard: 2 }));
}

#[test]
fn tally_tracks_both_sides() {
  let shard = Shard::new(0, 4);
  shard.enqueue(7u64).unwrap();
  shard.enqueue(7).unwrap();
  shard.enqueue(8).unwrap();
  shard.dequeue().unwrap();

  let tally = shard.take_tally();
  assert_eq!(tally.produced(&7), 2);
  assert_eq!(tally.produced(&8), 1);
  assert_eq!(tally.consumed(&7), 1);
  assert_eq!(tally.consumed(&8), 0);
  assert!(shard.take_tally().is_empty());
}

#[test]
fn concurrent_pair_preserves_fifo() {
  let shard = Arc::new(Shard::new(0, 2));
  let items = 2_000u64;

  let producer = {
    let shard = shard.clone();
    thread::spawn(move || {
      for v in 0..items {
        shard.enqueue(v).unwrap();
      }
    })
  };
  let consumer = {
    let shard = shard.clone();
    thread::spawn(move || (0..items).map(|_| shard.dequeue().unwrap()).collect::<Vec<_>>())
  };

  producer.join().unwrap();
  let received = consumer.join().unwrap();
  assert_eq!(received, (0..items).collect::<Vec<_>>());
  assert!(shard.stats().is_conserved());
}

#[tokio::test]
async fn async_round_trip() {
  let shard = Arc::new(Shard::new(0, 1));
  shard.enqueue_async(1u64).await.unwrap();

  let shard_clone = shard.clone();
  let pending = tokio::spawn(async move { shard_clone.enqueue_async(2).await });

  assert_eq!(shard.dequeue_async().await.unwrap(), 1);
  timeout(TEST_TIMEOUT, pending)
    .await
    .expect("async enqueue never completed")
    .unwrap()
    .unwrap();
  assert_eq!(shard.dequeue_async().await.unwrap(), 2);
}

#[tokio::test]
async fn async_dequeue_sees_close() {
  let shard = Arc::new(Shard::<u64>::new(4, 1));
  let shard_clone = shard.clone();
  let pending = tokio::spawn(async move { shard_clone.dequeue_async().await });

  tokio::time::sleep(Duration::from_millis(20)).await;
  shard.close();
  let res = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
  assert_eq!(res, Err(ShardError::Closed { shard: 4 }));
}
