use elasticsync_engine::{WAKE_QUEUE_CAPACITY, WakeQueue};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn tokens_are_consumed_one_at_a_time() {
    let queue = WakeQueue::new(10);
    assert_eq!(queue.push(3), 3);
    assert_eq!(queue.pending(), 3);

    assert!(queue.wait().await);
    assert!(queue.wait().await);
    assert_eq!(queue.pending(), 1);
}

#[test]
fn push_saturates_at_capacity() {
    let queue = WakeQueue::default();
    assert_eq!(queue.capacity(), WAKE_QUEUE_CAPACITY);
    assert_eq!(queue.push(900), 900);
    assert_eq!(queue.push(200), 100);
    assert_eq!(queue.push(1), 0);
    assert_eq!(queue.pending(), WAKE_QUEUE_CAPACITY);
}

#[tokio::test]
async fn close_releases_waiters() {
    let queue = Arc::new(WakeQueue::new(4));
    let waiter = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    queue.close();
    assert!(!waiter.await.unwrap());
    assert!(queue.is_closed());
    assert_eq!(queue.push(1), 0);
}

#[tokio::test]
async fn waiter_wakes_on_push() {
    let queue = Arc::new(WakeQueue::new(4));
    let waiter = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    queue.push(1);
    assert!(waiter.await.unwrap());
    assert_eq!(queue.pending(), 0);
}
