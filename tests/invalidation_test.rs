use std::fs::OpenOptions;
use std::thread;
use std::time::{Duration, Instant};

use audio_cblk::region::{LAYOUT_VERSION, REGION_MAGIC};
use audio_cblk::{
    CblkConfig, CblkError, CblkFlags, ClientProxy, Direction, ServerProxy, TimeoutPolicy,
    TrackRegion, TrackState,
};
use memmap2::MmapMut;

// Region header is 64 bytes; `user` sits 8 bytes into the block.
const USER_COUNTER_OFFSET: usize = 64 + 8;

#[test]
fn corrupted_counter_invalidates_the_block() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("corrupt.cblk");
    let region =
        TrackRegion::create_file(&path, CblkConfig::new(100, 48_000, 4), Direction::Output)
            .unwrap();
    let cblk = region.control_block();
    cblk.step_user(Direction::Output, 10).unwrap();

    // Scribble over the client counter through an unrelated mapping.
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let mut raw = unsafe { MmapMut::map_mut(&file).unwrap() };
    raw[USER_COUNTER_OFFSET..USER_COUNTER_OFFSET + 4].copy_from_slice(&5_000u32.to_ne_bytes());

    match cblk.frames_ready(Direction::Output) {
        Err(CblkError::Inconsistent {
            filled,
            frame_count,
            ..
        }) => {
            assert_eq!(filled, 5_000);
            assert_eq!(frame_count, 100);
        }
        other => panic!("expected inconsistency, got {other:?}"),
    }
    assert!(cblk.flags().contains(CblkFlags::INVALID));
    assert_eq!(cblk.state(), TrackState::Invalid);
    assert!(matches!(
        cblk.step_server(Direction::Output, 1),
        Err(CblkError::Invalidated)
    ));
    assert!(matches!(cblk.restart(), Err(CblkError::Invalidated)));
}

#[test]
fn invalidate_wakes_a_blocked_client() {
    let region =
        TrackRegion::create_anonymous(CblkConfig::new(64, 48_000, 4), Direction::Input).unwrap();
    let policy = TimeoutPolicy::default()
        .with_startup_timeout_ms(5_000)
        .with_wait_period_ms(2_000);
    let mut client = ClientProxy::new(region.inline_track().unwrap(), Direction::Input, policy);
    let server = ServerProxy::new(region.inline_track().unwrap(), Direction::Input, policy);

    let started = Instant::now();
    thread::scope(|scope| {
        let waiter = scope.spawn(move || client.obtain_buffer(16, true));
        thread::sleep(Duration::from_millis(50));
        server.invalidate();
        let result = waiter.join().expect("waiter panicked");
        assert!(matches!(result, Err(CblkError::Invalidated)));
    });
    assert!(
        started.elapsed() < Duration::from_millis(1_500),
        "waiter should wake on invalidation, not on its timeout"
    );
}

#[test]
fn invalidate_does_not_wait_on_a_dead_lock_holder() {
    let region =
        TrackRegion::create_anonymous(CblkConfig::new(64, 48_000, 4), Direction::Output).unwrap();
    let server = ServerProxy::new(
        region.inline_track().unwrap(),
        Direction::Output,
        TimeoutPolicy::default(),
    );
    let cblk = region.control_block();

    // A peer that crashed inside its critical section never unlocks.
    std::mem::forget(cblk.lock());

    let started = Instant::now();
    server.invalidate();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(cblk.state(), TrackState::Invalid);
    assert!(cblk.is_locked());
}

#[test]
fn capture_restore_has_a_single_restorer() {
    let region =
        TrackRegion::create_anonymous(CblkConfig::new(64, 48_000, 4), Direction::Input).unwrap();
    let policy = TimeoutPolicy::default().with_restore_timeout_ms(2_000);
    let first = ClientProxy::new(region.inline_track().unwrap(), Direction::Input, policy);
    let second = ClientProxy::new(region.inline_track().unwrap(), Direction::Input, policy);
    region.control_block().invalidate();

    let second = &second;
    thread::scope(|scope| {
        let mut follower = None;
        let restored = first.restore(|| {
            // Joins while the restore is in flight, so it must wait.
            follower = Some(scope.spawn(move || second.restore(|| Ok("should not run"))));
            thread::sleep(Duration::from_millis(50));
            Ok("replacement")
        });
        assert!(matches!(restored, Ok(Some("replacement"))));
        let follower = follower.expect("restorer ran").join().unwrap();
        assert!(matches!(follower, Ok(None)));
    });

    let flags = region.control_block().flags();
    assert!(flags.contains(CblkFlags::RESTORED));
    assert!(!flags.contains(CblkFlags::RESTORING));
}

#[test]
fn attach_rejects_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.bin");
    std::fs::write(&path, vec![0xA5u8; 4096]).unwrap();
    assert!(matches!(
        TrackRegion::open_file(&path),
        Err(CblkError::BadRegion(_))
    ));

    let path = dir.path().join("short.bin");
    std::fs::write(&path, REGION_MAGIC).unwrap();
    assert!(matches!(
        TrackRegion::open_file(&path),
        Err(CblkError::BadRegion(_))
    ));
    assert_eq!(LAYOUT_VERSION, 1);
}

#[test]
fn external_buffers_are_resolved_per_process() {
    let config = CblkConfig::new(16, 48_000, 4).with_external_buffers(7);
    let region = TrackRegion::create_anonymous(config, Direction::Output).unwrap();
    assert_eq!(region.len(), TrackRegion::required_len(&config));
    assert!(matches!(
        region.inline_track(),
        Err(CblkError::BadRegion(_))
    ));

    let mut storage = vec![0u8; 16 * 4];
    let track = region
        .track(audio_cblk::BufferStorage::External(&mut storage))
        .unwrap();
    assert_eq!(track.produce(Direction::Output, &[[9i16, 9]; 3]).unwrap(), 3);
    let address = track.buffer_address(0, 0);
    assert_eq!(unsafe { (address.as_ptr() as *const i16).read_unaligned() }, 9);
    assert_eq!(&storage[..4], &9i16.to_ne_bytes().repeat(2)[..]);
}
