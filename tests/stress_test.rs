use std::thread;

use audio_cblk::{CblkConfig, Direction, Side, TrackRegion};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const FRAME_COUNT: u32 = 96;
const TOTAL_FRAMES: i32 = 200_000;

type Frame = [i32; 2];

fn run_interleaving(direction: Direction, seed: u64) {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("stress.cblk");
    let config = CblkConfig::new(FRAME_COUNT, 48_000, std::mem::size_of::<Frame>() as u8);
    let server = TrackRegion::create_file(&path, config, direction).unwrap();
    let client = TrackRegion::open_file(&path).unwrap();
    let (producer_region, consumer_region) = match direction.producer() {
        Side::Client => (&client, &server),
        Side::Server => (&server, &client),
    };

    thread::scope(|scope| {
        scope.spawn(|| {
            let track = producer_region.inline_track().unwrap();
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut next = 0i32;
            while next < TOTAL_FRAMES {
                let len = rng.random_range(1..=40).min(TOTAL_FRAMES - next);
                let block: Vec<Frame> = (next..next + len).map(|n| [n, -n]).collect();
                let written = track.produce(direction, &block).unwrap();
                next += written as i32;
                if written == 0 || rng.random_bool(0.1) {
                    thread::yield_now();
                }
            }
        });

        scope.spawn(|| {
            let track = consumer_region.inline_track().unwrap();
            let mut rng = SmallRng::seed_from_u64(seed ^ 0x5eed);
            let mut expected = 0i32;
            let mut block = vec![[0i32; 2]; 40];
            while expected < TOTAL_FRAMES {
                // Whatever the producer is doing, the consumer sees a whole count.
                let ready = track.control_block().frames_ready(direction).unwrap();
                assert!(ready <= FRAME_COUNT);
                let len = rng.random_range(1..=40usize);
                let read = track.consume(direction, &mut block[..len]).unwrap();
                for frame in &block[..read] {
                    assert_eq!(*frame, [expected, -expected], "frame out of order");
                    expected += 1;
                }
                if read == 0 {
                    thread::yield_now();
                }
            }
        });
    });

    let cblk = client.control_block();
    assert!(!cblk.is_invalid());
    assert_eq!(cblk.positions().user, TOTAL_FRAMES as u32);
    assert_eq!(cblk.positions().server, TOTAL_FRAMES as u32);
}

#[test]
fn randomized_playback_interleavings_preserve_order() {
    for seed in [1, 7, 42] {
        run_interleaving(Direction::Output, seed);
    }
}

#[test]
fn randomized_capture_interleavings_preserve_order() {
    for seed in [3, 11] {
        run_interleaving(Direction::Input, seed);
    }
}
