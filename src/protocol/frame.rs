use thiserror::Error;

/// Magic byte identifying our binary frames, right after the type discriminator.
pub const FRAME_MAGIC: u8 = 0x4D;

/// Wire prefix: 1 type byte + `[magic, flags, format, reserved]`.
pub const FRAME_PREFIX_LEN: usize = 5;

const FLAG_FINAL: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic byte: {0:#04x}")]
    BadMagic(u8),
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Client -> server: a chunk of the user's utterance.
    AudioIn,
    /// Server -> client: one synthesized Opus packet.
    TtsOut,
}

impl FrameType {
    fn from_byte(b: u8) -> Result<Self, FrameError> {
        match b {
            1 => Ok(FrameType::AudioIn),
            2 => Ok(FrameType::TtsOut),
            other => Err(FrameError::UnknownType(other)),
        }
    }

    fn as_byte(self) -> u8 {
        match self {
            FrameType::AudioIn => 1,
            FrameType::TtsOut => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFormat {
    #[default]
    Unknown,
    Opus,
    Pcm16le,
    Wav,
    Mp3,
    Webm,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => AudioFormat::Opus,
            2 => AudioFormat::Pcm16le,
            3 => AudioFormat::Wav,
            4 => AudioFormat::Mp3,
            5 => AudioFormat::Webm,
            _ => AudioFormat::Unknown,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            AudioFormat::Unknown => 0,
            AudioFormat::Opus => 1,
            AudioFormat::Pcm16le => 2,
            AudioFormat::Wav => 3,
            AudioFormat::Mp3 => 4,
            AudioFormat::Webm => 5,
        }
    }

    /// File extension used when staging a capture for file-oriented provider APIs.
    pub fn file_ext(self) -> &'static str {
        match self {
            AudioFormat::Opus => ".opus",
            AudioFormat::Pcm16le | AudioFormat::Wav => ".wav",
            AudioFormat::Mp3 => ".mp3",
            AudioFormat::Webm => ".webm",
            AudioFormat::Unknown => ".bin",
        }
    }
}

/// One binary frame as it travels over the WebSocket:
/// `[type, 0x4D, flags, format, 0x00, payload...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub frame_type: FrameType,
    pub is_final: bool,
    pub format: AudioFormat,
    pub payload: Vec<u8>,
}

impl BinaryFrame {
    pub fn tts(payload: Vec<u8>, is_final: bool) -> Self {
        Self {
            frame_type: FrameType::TtsOut,
            is_final,
            format: AudioFormat::Opus,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_PREFIX_LEN + self.payload.len());
        buf.push(self.frame_type.as_byte());
        buf.push(FRAME_MAGIC);
        buf.push(if self.is_final { FLAG_FINAL } else { 0 });
        buf.push(self.format.as_byte());
        buf.push(0x00);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_PREFIX_LEN {
            return Err(FrameError::TooShort(buf.len()));
        }
        let frame_type = FrameType::from_byte(buf[0])?;
        if buf[1] != FRAME_MAGIC {
            return Err(FrameError::BadMagic(buf[1]));
        }
        Ok(Self {
            frame_type,
            is_final: buf[2] & FLAG_FINAL != 0,
            format: AudioFormat::from_byte(buf[3]),
            payload: buf[FRAME_PREFIX_LEN..].to_vec(),
        })
    }
}
