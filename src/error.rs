use thiserror::Error;

/// Failures surfaced while parsing a MIDI file or feeding the encoder.
///
/// Every parse-time failure is fatal for the run: there is no partial-file
/// recovery, and any bytes already written to the encoder should be treated
/// as a discarded artifact.
#[derive(Debug, Error)]
pub enum Error {
    #[error("corrupted midi header")]
    HeaderCorrupted,

    #[error("corrupted track header")]
    TrackHeaderCorrupted,

    #[error("corrupted track data")]
    TrackCorrupted,

    #[error("unexpected byte {actual:#04x}, expected {expected:#04x}")]
    AssertionFailed { expected: u8, actual: u8 },

    #[error("read past the end of the buffer")]
    OutOfRange,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("encoder: {0}")]
    Encoder(String),
}

pub type Result<T> = std::result::Result<T, Error>;
