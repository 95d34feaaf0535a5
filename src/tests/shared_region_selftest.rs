use dasp_signal::Signal;

use crate::{
    CblkConfig, CblkFlags, ClientProxy, Direction, ServerProxy, TimeoutPolicy, TrackRegion,
    TrackState,
};

const SAMPLE_RATE: u32 = 48_000;
const FRAME_COUNT: u32 = 1_024;
const BLOCK: usize = 256;

type Stereo = [f32; 2];

fn tone(frames: usize) -> Vec<Stereo> {
    let mut sine = dasp_signal::rate(SAMPLE_RATE as f64).const_hz(1_000.0).sine();
    (0..frames)
        .map(|_| {
            let sample = (sine.next() * 0.5) as f32;
            [sample, -sample]
        })
        .collect()
}

#[test]
fn sine_crosses_two_mappings_intact() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("track0.cblk");
    let config = CblkConfig::new(FRAME_COUNT, SAMPLE_RATE, std::mem::size_of::<Stereo>() as u8);

    let server_region =
        TrackRegion::create_file(&path, config, Direction::Output).expect("create region");
    let client_region = TrackRegion::open_file(&path).expect("attach region");
    assert_ne!(
        server_region.cblk_address(),
        client_region.cblk_address(),
        "mappings should live at different addresses"
    );

    let policy = TimeoutPolicy::default();
    let mut client = ClientProxy::new(
        client_region.inline_track().expect("client track"),
        Direction::Output,
        policy,
    );
    let mut server = ServerProxy::new(
        server_region.inline_track().expect("server track"),
        Direction::Output,
        policy,
    );
    assert_eq!(server.control_block().state(), TrackState::Constructed);

    let input = tone(SAMPLE_RATE as usize / 10);
    let mut recorded = Vec::with_capacity(input.len());
    let mut scratch = vec![[0.0f32; 2]; BLOCK];

    client.force_ready();
    for chunk in input.chunks(BLOCK) {
        let written = client.write(chunk).expect("client write");
        assert_eq!(written, chunk.len());

        let mixed = server.mix(&mut scratch).expect("server mix");
        assert_eq!(mixed, chunk.len());
        recorded.extend_from_slice(&scratch[..mixed]);
    }

    assert_eq!(recorded, input, "samples must cross the ring bit-exact");
    let cblk = client.control_block();
    assert_eq!(cblk.state(), TrackState::Active);
    assert!(cblk.flags().contains(CblkFlags::STARTED));
    assert_eq!(cblk.frames_ready(Direction::Output).unwrap(), 0);
    let positions = cblk.positions();
    assert_eq!(positions.user, input.len() as u32);
    assert_eq!(positions.server, input.len() as u32);
}

#[test]
fn capture_tone_reaches_client() {
    let config = CblkConfig::new(FRAME_COUNT, SAMPLE_RATE, std::mem::size_of::<Stereo>() as u8);
    let region = TrackRegion::create_anonymous(config, Direction::Input).expect("anon region");
    let policy = TimeoutPolicy::default();
    let mut server = ServerProxy::new(region.inline_track().unwrap(), Direction::Input, policy);
    let mut client = ClientProxy::new(region.inline_track().unwrap(), Direction::Input, policy);

    let input = tone(3 * FRAME_COUNT as usize);
    let mut recorded = vec![[0.0f32; 2]; input.len()];
    let mut read = 0;
    for chunk in input.chunks(BLOCK) {
        assert_eq!(server.capture(chunk).unwrap(), chunk.len());
        read += client.read(&mut recorded[read..read + chunk.len()]).unwrap();
    }

    assert_eq!(read, input.len());
    assert_eq!(recorded, input);
    assert!(!client.control_block().flags().contains(CblkFlags::UNDERRUN_OVERRUN));
}

#[test]
fn wrong_frame_type_is_rejected() {
    let config = CblkConfig::new(64, SAMPLE_RATE, 8);
    let region = TrackRegion::create_anonymous(config, Direction::Output).unwrap();
    let track = region.inline_track().unwrap();
    let mono = [[0.25f32; 1]; 4];
    match track.produce(Direction::Output, &mono) {
        Err(crate::CblkError::FrameSizeMismatch { expected, found }) => {
            assert_eq!(expected, 8);
            assert_eq!(found, 4);
        }
        other => panic!("expected a frame size mismatch, got {other:?}"),
    }
}
