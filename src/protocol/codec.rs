use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::params::Parameters;
use crate::protocol::ProtocolError;
use crate::types::Coords;

/// Commands and payloads the controller sends to the client.
#[derive(Clone, Debug)]
pub enum ServerEvent {
    SetParameters(Box<Parameters>),
    Play,
    Pause,
    Resume,
    Stop,
    Restart,
    /// Raw `[matrix, row, col]`, bounds-checked against the loaded matrices later.
    Selection([i64; 3]),
    Exception(String),
    EarlyStopping(Vec<CommandProbability>),
    Unknown(String),
}

impl ServerEvent {
    pub fn name(&self) -> &str {
        match self {
            ServerEvent::SetParameters(_) => "setParameters",
            ServerEvent::Play => "play",
            ServerEvent::Pause => "pause",
            ServerEvent::Resume => "resume",
            ServerEvent::Stop => "stop",
            ServerEvent::Restart => "restart",
            ServerEvent::Selection(_) => "selection",
            ServerEvent::Exception(_) => "exception",
            ServerEvent::EarlyStopping(_) => "earlyStopping",
            ServerEvent::Unknown(name) => name,
        }
    }
}

/// Running probability of one command, as reported for early stopping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandProbability {
    pub n_matrix: usize,
    pub n_row: usize,
    pub n_col: usize,
    pub prob: f32,
}

#[derive(Deserialize)]
struct EventTypeOnly {
    event_type: Option<String>,
}

#[derive(Deserialize)]
struct SelectionBody {
    selection_coords: Vec<i64>,
}

#[derive(Deserialize)]
struct ExceptionBody {
    exception: String,
}

#[derive(Deserialize)]
struct ProbabilitiesBody {
    prob_list: Vec<CommandProbability>,
}

fn body<'a, T: Deserialize<'a>>(event: &str, message: &'a str) -> Result<T, ProtocolError> {
    serde_json::from_str(message).map_err(|source| ProtocolError::MalformedBody {
        event: event.to_owned(),
        source,
    })
}

/// Reads `event_type` first, then the body that type implies.
pub fn decode(message: &str) -> Result<ServerEvent, ProtocolError> {
    let head: EventTypeOnly = body("message", message)?;
    let event_type = head
        .event_type
        .ok_or(ProtocolError::MissingField("event_type"))?;
    let event = match event_type.as_str() {
        "setParameters" => ServerEvent::SetParameters(Box::new(Parameters::from_json(message)?)),
        "play" => ServerEvent::Play,
        "pause" => ServerEvent::Pause,
        "resume" => ServerEvent::Resume,
        "stop" => ServerEvent::Stop,
        "restart" => ServerEvent::Restart,
        "selection" => {
            let sel: SelectionBody = body("selection", message)?;
            let coords: [i64; 3] = sel
                .selection_coords
                .as_slice()
                .try_into()
                .map_err(|_| ProtocolError::SelectionOutOfRange {
                    coords: sel.selection_coords.clone(),
                })?;
            ServerEvent::Selection(coords)
        }
        "exception" => {
            let exc: ExceptionBody = body("exception", message)?;
            ServerEvent::Exception(exc.exception)
        }
        "earlyStopping" => {
            let probs: ProbabilitiesBody = body("earlyStopping", message)?;
            ServerEvent::EarlyStopping(probs.prob_list)
        }
        _ => ServerEvent::Unknown(event_type),
    };
    Ok(event)
}

/// Outbound message: `event_type` followed by event specific fields, in
/// insertion order.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub fn new(event_type: &str) -> Self {
        let mut map = Map::new();
        map.insert("event_type".to_owned(), Value::from(event_type));
        Self(map)
    }

    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        // Only plain data goes in here, serialization cannot fail.
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.0.insert(key.to_owned(), value);
        self
    }

    pub fn event_type(&self) -> &str {
        self.0
            .get("event_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn waiting() -> Self {
        Self::new("waiting")
    }

    pub fn ready() -> Self {
        Self::new("ready")
    }

    pub fn process_please() -> Self {
        Self::new("processPlease")
    }

    pub fn finish() -> Self {
        Self::new("finish")
    }

    pub fn close() -> Self {
        Self::new("close")
    }

    pub fn train_onset(cycle: u32, onset: f64, trial: usize, target: Coords, command_idx: usize) -> Self {
        Self::new("train")
            .with("cycle", cycle)
            .with("onset", onset)
            .with("trial", trial)
            .with("matrix_idx", target.matrix)
            .with("unit_idx", target.row)
            .with("level_idx", target.col)
            .with("command_idx", command_idx)
            .with("mode", "Train")
    }

    pub fn test_onset(cycle: u32, onset: f64, trial: usize, matrix_idx: usize) -> Self {
        Self::new("test")
            .with("cycle", cycle)
            .with("onset", onset)
            .with("trial", trial)
            .with("mode", "Online")
            .with("matrix_idx", matrix_idx)
            .with("unit_idx", 0)
            .with("level_idx", 0)
    }

    pub fn resize(onset: f64, screen_size: [u32; 2], positions: &[CellPosition]) -> Self {
        Self::new("resize")
            .with("resize_onset", onset)
            .with("screen_size", screen_size)
            .with("new_position", positions)
    }
}

/// On-screen pixel centre of one cell, reported for raster latency correction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellPosition {
    pub idx: usize,
    pub coords: [usize; 3],
    pub position: [i32; 2],
}
