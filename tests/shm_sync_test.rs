use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use audio_cblk::{CblkConfig, Direction, ShmCondvar, ShmMutex, TrackRegion, WaitOutcome};

#[test]
fn try_lock_fails_while_held() {
    let mutex = ShmMutex::new();
    let guard = mutex.try_lock().expect("free mutex");
    assert!(mutex.is_locked());
    assert!(mutex.try_lock().is_none());
    assert!(mutex.lock_timeout(Duration::from_millis(20)).is_none());
    drop(guard);
    assert!(!mutex.is_locked());
    assert!(mutex.try_lock().is_some());
}

#[test]
fn mutex_serializes_increments() {
    let mutex = ShmMutex::new();
    let counter = AtomicU32::new(0);
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..10_000 {
                    let _guard = mutex.lock();
                    // Deliberately non-atomic read-modify-write.
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                }
            });
        }
    });
    assert_eq!(counter.load(Ordering::Relaxed), 40_000);
}

#[test]
fn condvar_wait_times_out_without_a_signal() {
    let mutex = ShmMutex::new();
    let cv = ShmCondvar::new();
    let mut guard = mutex.lock();
    let started = Instant::now();
    let outcome = cv.wait_timeout(&mut guard, Duration::from_millis(30));
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(30));
    // The lock is held again after the wait.
    assert!(mutex.try_lock().is_none());
}

#[test]
fn progress_wakes_a_waiter_in_another_mapping() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("wake.cblk");
    let server =
        TrackRegion::create_file(&path, CblkConfig::new(128, 48_000, 4), Direction::Input)
            .unwrap();
    let client = TrackRegion::open_file(&path).unwrap();

    thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            let cblk = client.control_block();
            let mut guard = cblk.lock();
            let started = Instant::now();
            while cblk.frames_ready(Direction::Input).unwrap() == 0 {
                cblk.wait_for_progress(&mut guard, Duration::from_secs(2));
                assert!(started.elapsed() < Duration::from_secs(2), "missed wakeup");
            }
            started.elapsed()
        });
        thread::sleep(Duration::from_millis(30));
        server
            .control_block()
            .step_server(Direction::Input, 32)
            .unwrap();
        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_millis(1_000));
    });
}

#[test]
fn wait_gives_up_on_a_lock_taken_while_asleep() {
    let mutex = ShmMutex::new();
    let cv = ShmCondvar::new();
    let mut guard = mutex.lock();

    thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(5));
            let held = mutex.lock();
            thread::sleep(Duration::from_millis(300));
            drop(held);
        });
        let started = Instant::now();
        let outcome = cv.wait_timeout(&mut guard, Duration::from_millis(60));
        assert_eq!(outcome, WaitOutcome::LockLost);
        assert!(outcome.timed_out());
        assert!(!guard.is_held());
        assert!(started.elapsed() < Duration::from_millis(250));
        // A lost guard does not sleep again.
        assert_eq!(
            cv.wait_timeout(&mut guard, Duration::from_secs(5)),
            WaitOutcome::LockLost
        );
    });

    // Dropping a guard that lost the lock must not release someone else's.
    drop(guard);
    assert!(!mutex.is_locked());
    let again = mutex.try_lock().expect("free once the holder left");
    drop(again);
}
