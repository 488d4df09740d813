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

use serde::{Deserialize, Serialize};

use crate::config::ProtocolGeneration;

const GEN_A_FRAME_COUNT_MASK: u8 = 0x3c;
const GEN_B_FRAME_COUNT_MASK: u8 = 0xfc;
const GEN_B_LATENCY_MASK: u8 = 0x03;

/// Length of the on-wire packet header preceding the frame payloads
pub const PACKET_HEADER_LEN: usize = 2;

/// Media (RTP) header delivered with each transport packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaHeader {
    /// RTP sequence number
    pub sequence_number: u16,
    /// RTP timestamp
    pub timestamp: u32,
}

impl MediaHeader {
    pub fn new(sequence_number: u16, timestamp: u32) -> Self {
        Self {
            sequence_number,
            timestamp,
        }
    }
}

/// Advisory latency class carried by generation B packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyClass {
    Low,
    Mid,
    High,
    Reserved,
}

impl From<u8> for LatencyClass {
    fn from(bits: u8) -> Self {
        match bits & GEN_B_LATENCY_MASK {
            0 => LatencyClass::Low,
            1 => LatencyClass::Mid,
            2 => LatencyClass::High,
            _ => LatencyClass::Reserved,
        }
    }
}

/// Parsed two-byte LHDC packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_count: u8,
    /// 8-bit wrapping on-wire sequence number
    pub sequence: u8,
    /// Only present on generation B streams
    pub latency: Option<LatencyClass>,
}

impl PacketHeader {
    /// Parse the header of `packet`. Returns `None` if the packet is too short.
    pub fn parse(generation: ProtocolGeneration, packet: &[u8]) -> Option<Self> {
        let (&flags, rest) = packet.split_first()?;
        let &sequence = rest.first()?;
        let header = match generation {
            ProtocolGeneration::A => PacketHeader {
                frame_count: (flags & GEN_A_FRAME_COUNT_MASK) >> 2,
                sequence,
                latency: None,
            },
            ProtocolGeneration::B => PacketHeader {
                frame_count: (flags & GEN_B_FRAME_COUNT_MASK) >> 2,
                sequence,
                latency: Some(LatencyClass::from(flags)),
            },
        };
        Some(header)
    }

    /// Encode the header bytes. Frame counts wider than the generation's field are truncated.
    pub fn encode(&self, generation: ProtocolGeneration) -> [u8; PACKET_HEADER_LEN] {
        let flags = match generation {
            ProtocolGeneration::A => (self.frame_count << 2) & GEN_A_FRAME_COUNT_MASK,
            ProtocolGeneration::B => {
                let latency = match self.latency {
                    Some(LatencyClass::Mid) => 1,
                    Some(LatencyClass::High) => 2,
                    Some(LatencyClass::Reserved) => 3,
                    _ => 0,
                };
                ((self.frame_count << 2) & GEN_B_FRAME_COUNT_MASK) | latency
            }
        };
        [flags, self.sequence]
    }
}
