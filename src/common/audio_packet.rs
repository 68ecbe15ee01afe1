//! chunk of bytes that has one render quantum of audio
//!
//! This is the stuff that goes "on the wire" between the browser clients
//! and the room server.  It is very intentionally simple.  One sample
//! rate, one frame size, no compression.  For rehearsal to feel live the
//! network has to be fast; there is nothing to be gained by codecs or
//! variable rates.
use byteorder::{ByteOrder, LittleEndian};
use simple_error::bail;
use std::fmt;

use super::box_error::BoxError;

/// samples per frame.  Matches the browser AudioWorklet render quantum.
pub const SAMPLES_PER_FRAME: usize = 128;
/// mono PCM at 48kHz.  One frame is 2.666ms
pub const SAMPLE_RATE: u32 = 48_000;
/// 4 byte sequence + 4 byte timestamp
pub const AUDIO_HEADER_SIZE: usize = 8;
/// total datagram size: header plus 128 i16 samples
pub const AUDIO_PACKET_SIZE: usize = AUDIO_HEADER_SIZE + 2 * SAMPLES_PER_FRAME;

/// One audio datagram worth of PCM.
///
/// Wire form is 264 bytes, little endian:
/// - u32 sequence (monotonic per output stream)
/// - u32 timestamp (sample offset from session start, wraps at 2^32)
/// - 128 x i16 samples
///
/// The same type rides the queues between the network threads and the
/// mixer, so it is plain old data and cheap to copy.
#[derive(Clone, Copy)]
pub struct AudioFrame {
    pub sequence: u32,
    pub timestamp: u32,
    pub samples: [i16; SAMPLES_PER_FRAME],
}

impl AudioFrame {
    pub fn new() -> AudioFrame {
        AudioFrame {
            sequence: 0,
            timestamp: 0,
            samples: [0; SAMPLES_PER_FRAME],
        }
    }

    /// Parse a datagram.  Anything shorter than one packet is an error;
    /// trailing bytes beyond 264 are ignored.
    pub fn deserialize(data: &[u8]) -> Result<AudioFrame, BoxError> {
        if data.len() < AUDIO_PACKET_SIZE {
            bail!("runt audio datagram: {} bytes", data.len());
        }
        let mut frame = AudioFrame::new();
        frame.sequence = LittleEndian::read_u32(&data[0..4]);
        frame.timestamp = LittleEndian::read_u32(&data[4..8]);
        LittleEndian::read_i16_into(
            &data[AUDIO_HEADER_SIZE..AUDIO_PACKET_SIZE],
            &mut frame.samples,
        );
        Ok(frame)
    }

    /// Write the wire form into a caller supplied buffer.
    pub fn serialize(&self, buf: &mut [u8; AUDIO_PACKET_SIZE]) -> () {
        LittleEndian::write_u32(&mut buf[0..4], self.sequence);
        LittleEndian::write_u32(&mut buf[4..8], self.timestamp);
        LittleEndian::write_i16_into(&self.samples, &mut buf[AUDIO_HEADER_SIZE..]);
    }

    /// quick length check used by receive paths before touching the bytes
    pub fn is_valid_len(len: usize) -> bool {
        len >= AUDIO_PACKET_SIZE
    }
}

impl fmt::Display for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ seq: {}, timestamp: {}, first: {} }}",
            self.sequence, self.timestamp, self.samples[0]
        )
    }
}
