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

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};

use clap::{Parser, ValueEnum};
use lhdc_sink::config::{OffloadConfig, EXT_FLAG_LLAC, EXT_FLAG_V4};
use lhdc_sink::engine::encode_sub_header;
use lhdc_sink::packet::PacketHeader;
use lhdc_sink::{
    ChannelMode, DecodePath, LhdcError, LhdcSession, MediaHeader, ProtocolGeneration,
    ReferenceEngine, StreamConfig,
};

// Replays a captured A2DP LHDC stream through the receive pipeline and writes
// the decoded PCM to a WAV file.
//
// Capture records are little-endian:
//   u16 payload length | u16 media sequence | u32 media timestamp | payload
//
// With --synthesize the capture is generated instead of read, which is handy
// for exercising MTU limits, drift and the offload path without a device.

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Generation {
    A,
    B,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Channel {
    Stereo,
    Left,
    Right,
}

#[derive(Parser, Debug)]
#[clap(about = "Replay an LHDC capture through the receive pipeline", version)]
struct Args {
    #[clap(value_parser, help = "Capture file to replay")]
    capture: Option<String>,

    #[clap(long, short, default_value = "lhdc_replay.wav", help = "WAV file to write")]
    output: String,

    #[clap(long, value_enum, default_value_t = Generation::A)]
    generation: Generation,

    #[clap(long, default_value_t = 48_000)]
    sample_rate: u32,

    #[clap(long, default_value_t = 24)]
    bits: u8,

    #[clap(long, default_value_t = 2)]
    channels: u8,

    #[clap(long, value_enum, default_value_t = Channel::Stereo)]
    channel: Channel,

    #[clap(long, help = "Negotiated LLAC extension")]
    llac: bool,

    #[clap(long, help = "Negotiated V4 extension")]
    v4: bool,

    #[clap(long, help = "Override the MTU limiter (frames)")]
    mtu_limiter: Option<usize>,

    #[clap(long, help = "Decode on the offload thread")]
    offload: bool,

    #[clap(long, default_value_t = 1024, help = "Offload DMA buffer depth in samples")]
    dma_samples: u32,

    #[clap(
        long,
        allow_hyphen_values = true,
        help = "Drift to correct, in frames, applied before the first packet"
    )]
    drift: Option<i32>,

    #[clap(long, help = "Generate N synthetic packets instead of reading a capture")]
    synthesize: Option<u16>,

    #[clap(long, default_value_t = 3, help = "Frames per synthetic packet")]
    frames_per_packet: u8,
}

struct CaptureRecord {
    media: MediaHeader,
    payload: Vec<u8>,
}

fn read_capture(path: &str) -> Result<Vec<CaptureRecord>, Box<dyn std::error::Error>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    loop {
        let mut header = [0u8; 8];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u16::from_le_bytes([header[0], header[1]]) as usize;
        let sequence_number = u16::from_le_bytes([header[2], header[3]]);
        let timestamp = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        records.push(CaptureRecord {
            media: MediaHeader::new(sequence_number, timestamp),
            payload,
        });
    }
    Ok(records)
}

fn synthesize(
    generation: ProtocolGeneration,
    packets: u16,
    frames_per_packet: u8,
    samples_per_frame: u32,
) -> Vec<CaptureRecord> {
    (0..packets)
        .map(|i| {
            let header = PacketHeader {
                frame_count: frames_per_packet,
                sequence: i as u8,
                latency: None,
            };
            let mut payload = header.encode(generation).to_vec();
            for f in 0..frames_per_packet {
                let len = 64 + (f as usize * 8);
                let mut frame = encode_sub_header(len, false, true).to_vec();
                frame.resize(len, f);
                payload.extend_from_slice(&frame);
            }
            CaptureRecord {
                media: MediaHeader::new(i, i as u32 * samples_per_frame * frames_per_packet as u32),
                payload,
            }
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let generation = match args.generation {
        Generation::A => ProtocolGeneration::A,
        Generation::B => ProtocolGeneration::B,
    };
    let mut ext_flags = 0;
    if args.llac {
        ext_flags |= EXT_FLAG_LLAC;
    }
    if args.v4 {
        ext_flags |= EXT_FLAG_V4;
    }
    let config = StreamConfig {
        generation,
        ext_flags,
        sample_rate: args.sample_rate,
        bits_per_sample: args.bits,
        channels: args.channels,
        channel_mode: match args.channel {
            Channel::Stereo => ChannelMode::Stereo,
            Channel::Left => ChannelMode::Left,
            Channel::Right => ChannelMode::Right,
        },
        mtu_limiter: args.mtu_limiter,
        drift_correction: args.drift.is_some(),
        decode_path: if args.offload {
            DecodePath::Offload(OffloadConfig {
                dma_buffer_samples: args.dma_samples,
                ..Default::default()
            })
        } else {
            DecodePath::Direct
        },
        ..Default::default()
    };

    let mut session = LhdcSession::new(config.clone(), Box::new(ReferenceEngine::new()))?;
    log::info!(
        "Session ready: codec version {}, {} samples per frame, {} bytes per tick",
        session.version().code(),
        session.samples_per_frame(),
        session.tick_bytes()
    );
    if let Some(drift) = args.drift {
        session.seed_drift(drift)?;
    }

    let records = match (args.synthesize, args.capture.as_deref()) {
        (Some(packets), _) => synthesize(
            generation,
            packets,
            args.frames_per_packet,
            session.samples_per_frame(),
        ),
        (None, Some(path)) => read_capture(path)?,
        (None, None) => return Err("either a capture file or --synthesize is required".into()),
    };
    log::info!("Replaying {} packets", records.len());

    let spec = hound::WavSpec {
        channels: config.channels as u16,
        sample_rate: config.sample_rate,
        bits_per_sample: config.bits_per_sample as u16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&args.output, spec)?;
    let container = config.container_bytes();
    let mut pcm = vec![0u8; session.tick_bytes()];
    let mut ticks = 0u64;

    let mut write_tick = |pcm: &[u8]| -> Result<(), hound::Error> {
        for sample in pcm.chunks_exact(container) {
            match container {
                2 => writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?,
                _ => writer.write_sample(i32::from_le_bytes([
                    sample[0], sample[1], sample[2], sample[3],
                ]))?,
            }
        }
        Ok(())
    };

    // last-frame tracking starts once, from the first packet of the stream
    if let Some(first) = records.first() {
        session.preparse_packet(&first.media)?;
    }
    for record in &records {
        match session.store_packet(&record.media, &record.payload) {
            Ok(_) => {}
            Err(LhdcError::MtuLimit { limit }) => {
                log::warn!("seq {} hit the MTU limiter ({limit})", record.media.sequence_number)
            }
            Err(LhdcError::SyncMismatch) => {
                log::warn!("seq {}: drift correction had no headroom", record.media.sequence_number)
            }
            Err(e) => return Err(e.into()),
        }

        // Direct path drains the queue; the offload path is paced one tick per packet.
        loop {
            match session.decode_frame(&mut pcm) {
                Ok(_) => {
                    write_tick(&pcm)?;
                    ticks += 1;
                }
                Err(LhdcError::CacheUnderflow) => break,
                Err(e) => return Err(e.into()),
            }
            if args.offload {
                break;
            }
        }
    }
    loop {
        match session.decode_frame(&mut pcm) {
            Ok(_) => {
                write_tick(&pcm)?;
                ticks += 1;
            }
            Err(LhdcError::CacheUnderflow) => break,
            Err(e) => return Err(e.into()),
        }
    }

    writer.finalize()?;
    let stats = session.statistics();
    log::info!(
        "Wrote {ticks} ticks to {}: {} packets, {} lost, {} frames decoded, {} underflows, {} MTU rejections, {} kbps",
        args.output,
        stats.packets_received,
        stats.packets_lost,
        stats.frames_decoded,
        stats.cache_underflows,
        stats.mtu_rejections,
        stats.bitrate_kbps
    );
    session.deinit();
    Ok(())
}
