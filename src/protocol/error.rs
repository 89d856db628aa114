use thiserror::Error;

/// Faults in the byte stream or in a decoded message body.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json header is {0} bytes, the 2-byte proto-header cannot describe it")]
    HeaderTooLarge(usize),
    #[error("malformed json header: {0}")]
    MalformedHeader(String),
    #[error("unknown content encoding `{0}`")]
    UnknownEncoding(String),
    #[error("body is not valid {encoding}: {reason}")]
    InvalidText {
        encoding: &'static str,
        reason: String,
    },
    #[error("message is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("malformed `{event}` body: {source}")]
    MalformedBody {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("selection {coords:?} is outside the known matrices")]
    SelectionOutOfRange { coords: Vec<i64> },
}

/// Parameter snapshots that cannot drive a run.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    #[error("no {0} matrix was provided")]
    EmptyMatrix(&'static str),
    #[error("matrix declares {n_row}x{n_col} but lists {items} cells")]
    ShapeMismatch {
        n_row: usize,
        n_col: usize,
        items: usize,
    },
    #[error("cell {index} has a sequence of length {actual}, expected {expected}")]
    SequenceLengthMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("cell {0} has an empty sequence")]
    EmptySequence(usize),
    #[error("cell {index} claims ({row}, {col}) which does not match its row-major slot")]
    CellOutOfRange { index: usize, row: usize, col: usize },
    #[error("unknown run mode `{0}`")]
    UnknownMode(String),
    #[error("refresh rate must be between 1 and 1000 Hz, got {0}")]
    InvalidRefreshRate(f32),
    #[error("training mode needs at least one target")]
    NoTrainingTargets,
    #[error("training target {index} {coords:?} is outside the training matrices")]
    TrainTargetOutOfRange { index: usize, coords: [i64; 3] },
}
