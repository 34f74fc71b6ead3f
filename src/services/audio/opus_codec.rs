use anyhow::{Context, Result};
use opus::{Application, Channels, Decoder, Encoder};

/// The synthesis pipeline runs at 24 kHz mono end to end.
pub const SAMPLE_RATE: u32 = 24_000;
/// 20 ms at 24 kHz.
pub const FRAME_SAMPLES: usize = 480;
const FRAME_BYTES: usize = FRAME_SAMPLES * 2;
const MAX_PACKET_BYTES: usize = 4000;

/// Per-turn PCM16LE -> Opus encoder. Fed arbitrary byte chunks from the TTS
/// stream, it emits one packet per full 20 ms frame and carries the
/// sub-frame residual across calls. The residual is zero-padded and flushed
/// at end of turn. Not shared across tasks; each turn owns one instance.
pub struct OpusEgress {
    encoder: Encoder,
    pending: Vec<u8>,
}

impl OpusEgress {
    pub fn new() -> Result<Self> {
        let encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .context("Failed to create Opus encoder")?;
        Ok(Self {
            encoder,
            pending: Vec::new(),
        })
    }

    /// Appends raw PCM16LE bytes and returns the Opus packets for every
    /// complete frame now available.
    pub fn push(&mut self, pcm: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.pending.extend_from_slice(pcm);

        let mut packets = Vec::new();
        while self.pending.len() >= FRAME_BYTES {
            let frame: Vec<u8> = self.pending.drain(..FRAME_BYTES).collect();
            packets.push(self.encode_frame(&frame)?);
        }
        Ok(packets)
    }

    /// Flushes the residual tail, zero-padded to a frame boundary. Returns
    /// `None` when the encoder is already frame-aligned.
    pub fn finish(&mut self) -> Result<Option<Vec<u8>>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let mut frame = std::mem::take(&mut self.pending);
        frame.resize(FRAME_BYTES, 0);
        Ok(Some(self.encode_frame(&frame)?))
    }

    fn encode_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let samples: Vec<i16> = frame
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        self.encoder
            .encode_vec(&samples, MAX_PACKET_BYTES)
            .context("Opus encode failed")
    }
}

/// Stateful Opus -> PCM decoder, symmetric to [`OpusEgress`].
pub struct OpusIngress {
    decoder: Decoder,
}

impl OpusIngress {
    pub fn new() -> Result<Self> {
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)
            .context("Failed to create Opus decoder")?;
        Ok(Self { decoder })
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        // Max 120 ms at 48 kHz; one 20 ms packet at 24 kHz needs far less.
        let mut output = vec![0i16; 5760];
        let len = self
            .decoder
            .decode(packet, &mut output, false)
            .context("Opus decode failed")?;
        output.truncate(len);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn sine(samples: usize) -> Vec<i16> {
        (0..samples)
            .map(|t| {
                let phase = t as f32 * 440.0 * 2.0 * std::f32::consts::PI / SAMPLE_RATE as f32;
                (phase.sin() * 10000.0) as i16
            })
            .collect()
    }

    #[test]
    fn one_packet_per_frame() {
        let mut egress = OpusEgress::new().unwrap();
        let packets = egress.push(&pcm_bytes(&sine(FRAME_SAMPLES * 3))).unwrap();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| !p.is_empty()));
        assert_eq!(egress.finish().unwrap(), None);
    }

    #[test]
    fn residual_carries_across_pushes() {
        let mut egress = OpusEgress::new().unwrap();
        let pcm = pcm_bytes(&sine(FRAME_SAMPLES));
        // First half a frame, then the rest plus a tail.
        let packets = egress.push(&pcm[..FRAME_SAMPLES]).unwrap();
        assert!(packets.is_empty());
        let packets = egress.push(&pcm[FRAME_SAMPLES..]).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn finish_pads_tail_to_frame_boundary() {
        let mut egress = OpusEgress::new().unwrap();
        let packets = egress.push(&pcm_bytes(&sine(100))).unwrap();
        assert!(packets.is_empty());
        let tail = egress.finish().unwrap();
        assert!(tail.is_some());
        // A second finish is a no-op.
        assert_eq!(egress.finish().unwrap(), None);
    }

    #[test]
    fn roundtrip_recovers_exact_length() {
        let input = sine(FRAME_SAMPLES * 4);
        let mut egress = OpusEgress::new().unwrap();
        let packets = egress.push(&pcm_bytes(&input)).unwrap();

        let mut ingress = OpusIngress::new().unwrap();
        let decoded: usize = packets
            .iter()
            .map(|p| ingress.decode(p).unwrap().len())
            .sum();
        assert_eq!(decoded, input.len());
    }
}
