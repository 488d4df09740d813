/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! End-to-end checks through the public session API.

use lhdc_sink::engine::encode_sub_header;
use lhdc_sink::packet::{LatencyClass, PacketHeader};
use lhdc_sink::{
    ChannelMode, CodecVersion, DecodePath, LhdcError, LhdcSession, MediaHeader, OffloadConfig,
    ProtocolGeneration, ReferenceEngine, StreamConfig, SyncMask, SyncTarget,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_test_session(config: StreamConfig) -> LhdcSession {
    init_logging();
    LhdcSession::new(config, Box::new(ReferenceEngine::new())).unwrap()
}

fn create_test_frame(len: usize, split: bool, fill: u8) -> Vec<u8> {
    let mut frame = encode_sub_header(len, split, true).to_vec();
    frame.resize(len, fill);
    frame
}

fn create_test_packet(
    generation: ProtocolGeneration,
    seq: u8,
    latency: Option<LatencyClass>,
    frames: &[Vec<u8>],
) -> Vec<u8> {
    let header = PacketHeader {
        frame_count: frames.len() as u8,
        sequence: seq,
        latency,
    };
    let mut packet = header.encode(generation).to_vec();
    for frame in frames {
        packet.extend_from_slice(frame);
    }
    packet
}

#[test]
fn test_generation_a_stream_plays_through() {
    let mut session = create_test_session(StreamConfig::default());
    let mut out = vec![0u8; session.tick_bytes()];
    let mut decoded = 0;

    for seq in 0..20u8 {
        let frames: Vec<_> = (0..3).map(|i| create_test_frame(48 + i * 4, false, seq)).collect();
        let media = MediaHeader::new(1000 + seq as u16, seq as u32 * 768);
        session.preparse_packet(&media).unwrap();
        let outcome = session
            .store_packet(&media, &create_test_packet(ProtocolGeneration::A, seq, None, &frames))
            .unwrap();
        assert_eq!(outcome.frames_queued, 3);
        while session.decode_frame(&mut out).is_ok() {
            decoded += 1;
        }
    }

    assert_eq!(decoded, 60);
    let info = session.last_frame_info();
    assert_eq!(info.sequence_number, 1019);
    assert_eq!(info.cur_sub_sequence, 3);
    assert_eq!(info.total_sub_sequence, 3);
    assert_eq!(info.undecoded_frames, 0);
    assert_eq!(session.statistics().packets_received, 20);
    assert_eq!(session.statistics().cache_underflows, 20);
}

#[test]
fn test_lost_packets_counted_without_error() {
    let mut session = create_test_session(StreamConfig::default());
    let frame = vec![create_test_frame(16, false, 0)];
    for seq in [0xffu8, 0, 3, 4] {
        session
            .store_packet(
                &MediaHeader::new(seq as u16, 0),
                &create_test_packet(ProtocolGeneration::A, seq, None, &frame),
            )
            .unwrap();
    }
    // 0 -> 3 skips two
    assert_eq!(session.statistics().packets_lost, 2);
    assert_eq!(session.queue_len(), 4);
}

#[test]
fn test_stream_joined_mid_sequence_has_no_loss() {
    let mut session = create_test_session(StreamConfig::default());
    let frame = vec![create_test_frame(16, false, 0)];
    for seq in 0x50u8..0x54 {
        session
            .store_packet(
                &MediaHeader::new(seq as u16, 0),
                &create_test_packet(ProtocolGeneration::A, seq, None, &frame),
            )
            .unwrap();
    }
    let stats = session.statistics();
    assert_eq!(stats.packets_received, 4);
    assert_eq!(stats.packets_lost, 0);
    assert_eq!(stats.loss_rate, 0);
}

#[test]
fn test_truncated_packet_validation_is_recoverable() {
    let mut session = create_test_session(StreamConfig::default());
    let mut frame = create_test_frame(64, false, 7);
    frame.truncate(30);
    let truncated = create_test_packet(ProtocolGeneration::A, 0, None, &[frame]);
    assert_eq!(session.validate_packet(&truncated), Err(LhdcError::InputNotEnough));
    assert!(!session.is_poisoned());

    let complete = create_test_packet(
        ProtocolGeneration::A,
        0,
        None,
        &[create_test_frame(64, false, 7)],
    );
    assert_eq!(session.validate_packet(&complete).unwrap().frames, 1);
    let outcome = session
        .store_packet(&MediaHeader::new(1, 0), &complete)
        .unwrap();
    assert_eq!(outcome.frames_queued, 1);
}

#[test]
fn test_last_frame_counts_across_packets() {
    let mut session = create_test_session(StreamConfig::default());
    let mut out = vec![0u8; session.tick_bytes()];
    session.preparse_packet(&MediaHeader::new(10, 0)).unwrap();
    for seq in 0..3u8 {
        let frames = vec![create_test_frame(24, false, seq), create_test_frame(24, false, seq)];
        session
            .store_packet(
                &MediaHeader::new(10 + seq as u16, seq as u32 * 512),
                &create_test_packet(ProtocolGeneration::A, seq, None, &frames),
            )
            .unwrap();
        while session.decode_frame(&mut out).is_ok() {}
    }
    let info = session.last_frame_info();
    assert_eq!(info.decoded_frames, 6);
    assert_eq!(info.sequence_number, 12);
}

#[test]
fn test_generation_b_dual_mono_right_channel() {
    let config = StreamConfig {
        generation: ProtocolGeneration::B,
        channels: 1,
        channel_mode: ChannelMode::Right,
        ..Default::default()
    };
    let mut session = create_test_session(config);
    assert_eq!(session.version(), CodecVersion::V5);

    // [2-byte header | left body | right body]
    let len = 20;
    let mut frame = create_test_frame(len, true, 0x11);
    frame.resize(len * 2 - 2, 0x22);
    let packet = create_test_packet(ProtocolGeneration::B, 0, Some(LatencyClass::Low), &[frame]);

    let outcome = session.store_packet(&MediaHeader::new(3, 0), &packet).unwrap();
    assert_eq!(outcome.frames_queued, 1);
    assert_eq!(outcome.latency, Some(LatencyClass::Low));

    let mut out = vec![0u8; session.tick_bytes()];
    assert_eq!(session.decode_frame(&mut out).unwrap(), 256 * 4);
}

#[test]
fn test_dual_mono_frame_in_stereo_mode_is_fatal() {
    let config = StreamConfig {
        generation: ProtocolGeneration::B,
        ..Default::default()
    };
    let mut session = create_test_session(config);
    let mut frame = create_test_frame(20, true, 0x11);
    frame.resize(38, 0x22);
    let err = session
        .store_packet(
            &MediaHeader::new(1, 0),
            &create_test_packet(ProtocolGeneration::B, 0, None, &[frame]),
        )
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(session.is_poisoned());
}

#[test]
fn test_resync_after_seek() {
    let mut session = create_test_session(StreamConfig::default());
    for seq in 0..5u8 {
        let frames = vec![create_test_frame(16, false, 0), create_test_frame(16, false, 1)];
        session
            .store_packet(
                &MediaHeader::new(seq as u16, seq as u32 * 512),
                &create_test_packet(ProtocolGeneration::A, seq, None, &frames),
            )
            .unwrap();
    }

    let target = SyncTarget {
        sequence_number: 3,
        cur_sub_sequence: 1,
        total_sub_sequence: 2,
    };
    let mask = SyncMask::SEQ | SyncMask::CURR_SUB_SEQ;
    assert_eq!(session.synchronize(&target, mask).unwrap(), 6);
    assert_eq!(session.head_frame_info().sequence_number, 3);

    let missing = SyncTarget {
        sequence_number: 99,
        ..target
    };
    assert_eq!(
        session.synchronize(&missing, SyncMask::SEQ),
        Err(LhdcError::SyncMismatch)
    );
    assert_eq!(session.queue_len(), 0);
    assert_eq!(session.head_frame_info().sequence_number, 0);
}

#[test]
fn test_negative_drift_drops_frames() {
    let config = StreamConfig {
        drift_correction: true,
        ..Default::default()
    };
    let mut session = create_test_session(config);
    assert!(session.seed_drift(-2).unwrap());

    let frames: Vec<_> = (0..3).map(|i| create_test_frame(16, false, i)).collect();
    session
        .store_packet(
            &MediaHeader::new(1, 0),
            &create_test_packet(ProtocolGeneration::A, 0, None, &frames),
        )
        .unwrap();
    // two of three frames dropped as they arrived
    assert_eq!(session.queue_len(), 1);
    assert_eq!(session.drift_owed(), 0);
    assert_eq!(session.statistics().frames_discarded, 2);
}

#[test]
fn test_offload_stream_delivers_every_frame() {
    let config = StreamConfig {
        decode_path: DecodePath::Offload(OffloadConfig {
            dma_buffer_samples: 512,
            input_ring_factor: 8,
        }),
        ..Default::default()
    };
    let mut session = create_test_session(config);
    assert_eq!(session.tick_bytes(), 2048);
    let mut out = vec![0u8; session.tick_bytes()];

    for seq in 0..8u8 {
        let frames = vec![create_test_frame(24, false, seq)];
        session
            .store_packet(
                &MediaHeader::new(seq as u16, 0),
                &create_test_packet(ProtocolGeneration::A, seq, None, &frames),
            )
            .unwrap();
    }

    let mut attempts = 0;
    while session.statistics().frames_decoded < 8 && attempts < 2000 {
        match session.decode_frame(&mut out) {
            Ok(_) | Err(LhdcError::CacheUnderflow) => {}
            Err(e) => panic!("unexpected decode error: {e}"),
        }
        attempts += 1;
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(session.statistics().frames_decoded, 8);
    assert_eq!(session.last_frame_info().sequence_number, 7);
}
