// src/types.rs
use std::fmt;

// 运行模式
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Mode {
    /// Calibration: every trial highlights a known target.
    Train,
    /// Classification: the controller answers each trial with a selection.
    Online,
}

impl Mode {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("train") {
            Some(Mode::Train)
        } else if raw.eq_ignore_ascii_case("online") || raw.eq_ignore_ascii_case("test") {
            Some(Mode::Online)
        } else {
            None
        }
    }

    /// Spelling the controller expects in onset events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "Train",
            Mode::Online => "Online",
        }
    }
}

// Top-level run state
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum RunState {
    WaitingConnection,
    WaitingParameters,
    Ready,
    Running,
    /// Online trial finished, `processPlease` sent.
    WaitingSelection,
    /// A selection is being shown.
    SelectionReceived,
    Paused,
    Finished,
    Stop,
    /// Channel closed, nothing more is accepted.
    Closed,
}

impl RunState {
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, RunState::Stop | RunState::Closed)
    }
}

// Per-trial timing phases
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum CycleState {
    PrevText,
    Idle,
    Target,
    Idle2,
    Flickering,
}

// Selection display phases
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ResultState {
    Show,
    Idle,
    End,
}

/// `(matrix, row, col)` address of a command cell.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct Coords {
    pub matrix: usize,
    pub row: usize,
    pub col: usize,
}

impl Coords {
    pub fn new(matrix: usize, row: usize, col: usize) -> Self {
        Self { matrix, row, col }
    }
}

impl fmt::Display for Coords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}]", self.matrix, self.row, self.col)
    }
}

// 高亮类型
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Highlight {
    /// Training target cue.
    Target,
    /// Selection returned by the controller.
    Result,
}
