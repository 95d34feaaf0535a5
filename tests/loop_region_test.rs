use audio_cblk::{
    CblkConfig, CblkError, ClientProxy, ControlBlock, Direction, LoopState, ServerProxy, Side,
    TimeoutPolicy, TrackRegion,
};

fn playback_block(frame_count: u32) -> ControlBlock {
    ControlBlock::new(CblkConfig::new(frame_count, 44_100, 4)).expect("valid config")
}

fn set_loop(cblk: &ControlBlock, start: u32, end: u32, count: i32) -> Result<(), CblkError> {
    let guard = cblk.lock();
    cblk.set_loop(&guard, start, end, count)
}

#[test]
fn loop_replays_twice_then_runs_to_ring_end() {
    let cblk = playback_block(100);
    cblk.step_user(Direction::Output, 10).unwrap();
    cblk.step_server(Direction::Output, 10).unwrap();
    set_loop(&cblk, 10, 50, 2).expect("loop fits");

    // First crossing jumps back to the loop start.
    assert_eq!(cblk.step_user(Direction::Output, 40).unwrap(), 40);
    assert_eq!(cblk.side_offset(Side::Client), 10);
    assert_eq!(cblk.loop_state().count, 1);
    assert_eq!(cblk.step_server(Direction::Output, 40).unwrap(), 40);
    assert_eq!(cblk.side_offset(Side::Server), 10);

    // Second crossing uses up the repeats.
    assert_eq!(cblk.step_user(Direction::Output, 40).unwrap(), 40);
    assert_eq!(cblk.side_offset(Side::Client), 10);
    assert_eq!(cblk.loop_state().count, 0);
    assert_eq!(cblk.step_server(Direction::Output, 40).unwrap(), 40);
    assert_eq!(cblk.side_offset(Side::Server), 10);

    // Third crossing passes straight through loop_end.
    assert_eq!(cblk.step_user(Direction::Output, 40).unwrap(), 40);
    assert_eq!(cblk.side_offset(Side::Client), 50);
    assert_eq!(cblk.frames_free(Direction::Output).unwrap(), 60);
    assert_eq!(cblk.step_user(Direction::Output, 60).unwrap(), 60);
    assert_eq!(cblk.frames_free(Direction::Output).unwrap(), 0);
    assert_eq!(cblk.frames_ready(Direction::Output).unwrap(), 100);
    assert_eq!(cblk.side_offset(Side::Client), 10);
}

#[test]
fn producer_is_bounded_to_loop_length_while_looping() {
    let cblk = playback_block(100);
    set_loop(&cblk, 0, 30, 3).unwrap();

    assert_eq!(cblk.frames_free(Direction::Output).unwrap(), 30);
    // Asking for more than the loop length is clamped.
    assert_eq!(cblk.step_user(Direction::Output, 80).unwrap(), 30);
    assert_eq!(cblk.frames_free(Direction::Output).unwrap(), 0);
    assert_eq!(cblk.loop_state().count, 2);

    for _ in 0..3 {
        assert_eq!(cblk.step_server(Direction::Output, 30).unwrap(), 30);
        assert_eq!(cblk.step_user(Direction::Output, 30).unwrap(), 30);
    }
    assert_eq!(cblk.loop_state().count, 0);
    assert_eq!(cblk.step_server(Direction::Output, 30).unwrap(), 30);
    // All laps replayed, so the whole ring is usable again.
    assert_eq!(cblk.frames_free(Direction::Output).unwrap(), 100);
}

#[test]
fn infinite_loop_runs_until_cleared() {
    let cblk = playback_block(64);
    set_loop(&cblk, 8, 24, -1).unwrap();
    cblk.step_user(Direction::Output, 8).unwrap();
    cblk.step_server(Direction::Output, 8).unwrap();

    for _ in 0..50 {
        assert_eq!(cblk.step_user(Direction::Output, 16).unwrap(), 16);
        assert_eq!(cblk.step_server(Direction::Output, 16).unwrap(), 16);
        assert_eq!(cblk.side_offset(Side::Client), 8);
        assert_eq!(cblk.side_offset(Side::Server), 8);
    }
    assert_eq!(cblk.loop_state().count, -1);

    {
        let guard = cblk.lock();
        cblk.clear_loop(&guard);
    }
    assert_eq!(cblk.step_user(Direction::Output, 16).unwrap(), 16);
    assert_eq!(cblk.side_offset(Side::Client), 24);
}

#[test]
fn invalid_loops_are_rejected() {
    let cblk = playback_block(100);
    assert!(matches!(
        set_loop(&cblk, 50, 50, 1),
        Err(CblkError::InvalidLoop(_))
    ));
    assert!(matches!(
        set_loop(&cblk, 10, 101, 1),
        Err(CblkError::InvalidLoop(_))
    ));

    cblk.step_user(Direction::Output, 60).unwrap();
    assert!(matches!(
        set_loop(&cblk, 10, 50, 1),
        Err(CblkError::InvalidLoop(_))
    ));
    assert_eq!(cblk.loop_state(), LoopState::default());

    // A zero count only disables looping.
    set_loop(&cblk, 0, 0, 0).unwrap();
    assert_eq!(cblk.loop_state().count, 0);
}

#[test]
fn flush_rewinds_positions_and_loop() {
    let cblk = playback_block(32);
    set_loop(&cblk, 0, 16, 4).unwrap();
    cblk.step_user(Direction::Output, 16).unwrap();
    cblk.step_server(Direction::Output, 5).unwrap();

    {
        let guard = cblk.lock();
        cblk.flush(&guard);
    }
    let positions = cblk.positions();
    assert_eq!((positions.user, positions.server), (0, 0));
    assert_eq!((positions.user_laps, positions.server_laps), (0, 0));
    assert_eq!(cblk.loop_state(), LoopState::default());
    assert_eq!(cblk.frames_free(Direction::Output).unwrap(), 32);
}

#[test]
fn zero_frame_advance_is_a_noop() {
    let cblk = playback_block(16);
    assert_eq!(cblk.step_user(Direction::Output, 0).unwrap(), 0);
    assert_eq!(cblk.step_server(Direction::Output, 0).unwrap(), 0);
    assert_eq!(cblk.positions().user, 0);
}

fn byte_ring(frame_count: u32) -> TrackRegion {
    TrackRegion::create_anonymous(CblkConfig::new(frame_count, 48_000, 1), Direction::Output)
        .expect("anonymous region")
}

#[test]
fn loop_set_at_loop_end_lands_new_frames_at_loop_start() {
    let region = byte_ring(100);
    let track = region.inline_track().unwrap();
    let cblk = region.control_block();

    let body: Vec<u8> = (0..50).collect();
    assert_eq!(track.produce_bytes(Direction::Output, &body).unwrap(), 50);
    set_loop(cblk, 0, 50, 1).expect("producer sits on loop_end");

    let mut first = [0u8; 50];
    assert_eq!(track.consume_bytes(Direction::Output, &mut first).unwrap(), 50);
    assert_eq!(first.as_slice(), body.as_slice());

    // The producer's next frames belong at loop_start, not at loop_end.
    let (_, run) = track.next_run(Direction::Output, Side::Client).unwrap();
    assert_eq!(cblk.contiguous_run(Direction::Output, Side::Client).unwrap(), (0, run));
    let fresh: Vec<u8> = (100..120).collect();
    assert_eq!(track.produce_bytes(Direction::Output, &fresh[..10]).unwrap(), 10);
    assert_eq!(track.produce_bytes(Direction::Output, &fresh[10..]).unwrap(), 10);

    let mut second = [0u8; 20];
    assert_eq!(track.consume_bytes(Direction::Output, &mut second).unwrap(), 20);
    assert_eq!(second.as_slice(), fresh.as_slice());
    assert_eq!(cblk.side_offset(Side::Client), cblk.side_offset(Side::Server));
}

#[test]
fn loop_body_replays_across_mismatched_chunk_sizes() {
    let region = byte_ring(100);
    let track = region.inline_track().unwrap();
    let cblk = region.control_block();

    let body: Vec<u8> = (1..=50).collect();
    track.produce_bytes(Direction::Output, &body).unwrap();
    set_loop(cblk, 0, 50, 2).unwrap();

    // Replaying laps only steps the producer; the samples stay in place.
    let mut replayed = 0u32;
    let mut heard = Vec::new();
    while heard.len() < 150 {
        let mut chunk = [0u8; 7];
        let want = (150 - heard.len()).min(chunk.len());
        let got = track.consume_bytes(Direction::Output, &mut chunk[..want]).unwrap();
        heard.extend_from_slice(&chunk[..got]);

        let free = cblk.frames_free(Direction::Output).unwrap();
        let step = free.min(13).min(100 - replayed);
        replayed += cblk.step_user(Direction::Output, step).unwrap();
        assert!(got > 0 || step > 0, "ring stalled at {} frames", heard.len());
    }

    let expected: Vec<u8> = body.iter().copied().cycle().take(150).collect();
    assert_eq!(heard, expected);
    assert_eq!(cblk.loop_state().count, 0);
    let positions = cblk.positions();
    assert_eq!((positions.user_laps, positions.server_laps), (2, 2));
}

#[test]
fn mixer_follows_a_loop_configured_after_the_body() {
    let region =
        TrackRegion::create_anonymous(CblkConfig::new(64, 48_000, 4), Direction::Output).unwrap();
    let policy = TimeoutPolicy::default();
    let mut client = ClientProxy::new(region.inline_track().unwrap(), Direction::Output, policy);
    let mut server = ServerProxy::new(region.inline_track().unwrap(), Direction::Output, policy);

    let body: Vec<[i16; 2]> = (0..32).map(|i| [i, -i]).collect();
    assert_eq!(client.write(&body).unwrap(), 32);
    client.set_loop(0, 32, 1).unwrap();
    client.force_ready();

    let mut out = vec![[0i16; 2]; 32];
    assert_eq!(server.mix(&mut out).unwrap(), 32);
    assert_eq!(out, body);

    let lap: Vec<[i16; 2]> = (100..116).map(|i| [i, i]).collect();
    assert_eq!(client.write(&lap).unwrap(), 16);
    let mut out = vec![[0i16; 2]; 16];
    assert_eq!(server.mix(&mut out).unwrap(), 16);
    assert_eq!(out, lap);
}
