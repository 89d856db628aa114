// src/surface.rs
// 引擎 -> 呈现层 的接口
use crate::protocol::{ColorTable, CommandProbability, Matrix};
use crate::types::Highlight;
use log::{debug, info, trace};
use std::collections::VecDeque;
use std::sync::mpsc::{SyncSender, TrySendError};

/// Events the window may fall behind by before per-tick updates are dropped.
pub const SURFACE_QUEUE: usize = 1024;

/// Everything the engine asks of whatever draws the matrix.
pub trait StimulusSurface: Send {
    /// New matrix and colour table for the coming run.
    fn load_matrix(&mut self, matrix: &Matrix, colors: &ColorTable, photodiode: bool);
    fn set_information_text(&mut self, text: &str);
    /// One appearance code per cell, row-major.
    fn set_codes(&mut self, codes: &[i32]);
    fn highlight(&mut self, row: usize, col: usize, kind: Highlight);
    fn unhighlight(&mut self, row: usize, col: usize);
    fn reset_cells(&mut self);
    fn append_result(&mut self, text: &str);
    fn set_photodiode(&mut self, on: bool);
    /// Measured fixed ticks per second against the configured rate.
    fn report_tick_rate(&mut self, measured: f32, configured: f32);
    fn show_probabilities(&mut self, probabilities: &[CommandProbability]);
    /// The run is over and the window may go away.
    fn closed(&mut self);
}

/// Presentation calls as plain messages, for a surface on another thread.
#[derive(Clone, Debug, PartialEq)]
pub enum SurfaceEvent {
    LoadMatrix {
        matrix: Matrix,
        colors: ColorTable,
        photodiode: bool,
    },
    InformationText(String),
    Codes(Vec<i32>),
    Highlight { row: usize, col: usize, kind: Highlight },
    Unhighlight { row: usize, col: usize },
    ResetCells,
    AppendResult(String),
    Photodiode(bool),
    TickRate { measured: f32, configured: f32 },
    Probabilities(Vec<CommandProbability>),
    Closed,
}

impl SurfaceEvent {
    /// Superseded by the next tick, safe to drop when the window lags.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            SurfaceEvent::Codes(_) | SurfaceEvent::Photodiode(_) | SurfaceEvent::TickRate { .. }
        )
    }
}

/// Forwards every call to the GUI thread over a bounded queue. When the
/// window stops draining it, per-tick events are dropped and the rest wait
/// in `backlog`, in order.
pub struct ChannelSurface {
    tx: SyncSender<SurfaceEvent>,
    backlog: VecDeque<SurfaceEvent>,
}

impl ChannelSurface {
    pub fn new(tx: SyncSender<SurfaceEvent>) -> Self {
        Self {
            tx,
            backlog: VecDeque::new(),
        }
    }

    fn post(&mut self, event: SurfaceEvent) {
        while let Some(front) = self.backlog.pop_front() {
            match self.tx.try_send(front) {
                Ok(()) => {}
                Err(TrySendError::Full(front)) => {
                    self.backlog.push_front(front);
                    break;
                }
                // The window may already be gone during shutdown.
                Err(TrySendError::Disconnected(_)) => {
                    self.backlog.clear();
                    return;
                }
            }
        }
        let event = if self.backlog.is_empty() {
            match self.tx.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(event)) => event,
            }
        } else {
            event
        };
        if event.is_transient() {
            trace!("window lagging, dropped {:?}", event);
        } else {
            self.backlog.push_back(event);
        }
    }
}

impl StimulusSurface for ChannelSurface {
    fn load_matrix(&mut self, matrix: &Matrix, colors: &ColorTable, photodiode: bool) {
        self.post(SurfaceEvent::LoadMatrix {
            matrix: matrix.clone(),
            colors: colors.clone(),
            photodiode,
        });
    }

    fn set_information_text(&mut self, text: &str) {
        self.post(SurfaceEvent::InformationText(text.to_owned()));
    }

    fn set_codes(&mut self, codes: &[i32]) {
        self.post(SurfaceEvent::Codes(codes.to_vec()));
    }

    fn highlight(&mut self, row: usize, col: usize, kind: Highlight) {
        self.post(SurfaceEvent::Highlight { row, col, kind });
    }

    fn unhighlight(&mut self, row: usize, col: usize) {
        self.post(SurfaceEvent::Unhighlight { row, col });
    }

    fn reset_cells(&mut self) {
        self.post(SurfaceEvent::ResetCells);
    }

    fn append_result(&mut self, text: &str) {
        self.post(SurfaceEvent::AppendResult(text.to_owned()));
    }

    fn set_photodiode(&mut self, on: bool) {
        self.post(SurfaceEvent::Photodiode(on));
    }

    fn report_tick_rate(&mut self, measured: f32, configured: f32) {
        self.post(SurfaceEvent::TickRate { measured, configured });
    }

    fn show_probabilities(&mut self, probabilities: &[CommandProbability]) {
        self.post(SurfaceEvent::Probabilities(probabilities.to_vec()));
    }

    fn closed(&mut self) {
        self.post(SurfaceEvent::Closed);
    }
}

/// Headless surface: banners, results and tick rates go to the log,
/// per-tick codes are dropped.
#[derive(Default)]
pub struct LogSurface {
    result: String,
}

impl StimulusSurface for LogSurface {
    fn load_matrix(&mut self, matrix: &Matrix, _colors: &ColorTable, photodiode: bool) {
        info!(
            "matrix loaded: {}x{}, cycle length {}, photodiode {}",
            matrix.n_row,
            matrix.n_col,
            matrix.sequence_len(),
            photodiode
        );
    }

    fn set_information_text(&mut self, text: &str) {
        if !text.is_empty() {
            info!("[banner] {}", text);
        }
    }

    fn set_codes(&mut self, _codes: &[i32]) {}

    fn highlight(&mut self, row: usize, col: usize, kind: Highlight) {
        debug!("highlight ({}, {}) as {:?}", row, col, kind);
    }

    fn unhighlight(&mut self, row: usize, col: usize) {
        debug!("unhighlight ({}, {})", row, col);
    }

    fn reset_cells(&mut self) {}

    fn append_result(&mut self, text: &str) {
        self.result.push_str(text);
        self.result.push(' ');
        info!("[result] {}", self.result.trim_end());
    }

    fn set_photodiode(&mut self, _on: bool) {}

    fn report_tick_rate(&mut self, measured: f32, configured: f32) {
        debug!("{:.0} ticks/s (@{:.0})", measured, configured);
    }

    fn show_probabilities(&mut self, probabilities: &[CommandProbability]) {
        if let Some(best) = probabilities
            .iter()
            .max_by(|a, b| a.prob.total_cmp(&b.prob))
        {
            info!(
                "early stopping: best [{}, {}, {}] p={:.3}",
                best.n_matrix, best.n_row, best.n_col, best.prob
            );
        }
    }

    fn closed(&mut self) {
        info!("surface closed");
    }
}

/// Keeps every call, for engine tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct RecordingSurface {
    pub events: std::sync::Arc<std::sync::Mutex<Vec<SurfaceEvent>>>,
}

#[cfg(test)]
impl RecordingSurface {
    pub fn take(&self) -> Vec<SurfaceEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn texts(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                SurfaceEvent::InformationText(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
impl StimulusSurface for RecordingSurface {
    fn load_matrix(&mut self, matrix: &Matrix, colors: &ColorTable, photodiode: bool) {
        self.events.lock().unwrap().push(SurfaceEvent::LoadMatrix {
            matrix: matrix.clone(),
            colors: colors.clone(),
            photodiode,
        });
    }
    fn set_information_text(&mut self, text: &str) {
        self.events.lock().unwrap().push(SurfaceEvent::InformationText(text.to_owned()));
    }
    fn set_codes(&mut self, codes: &[i32]) {
        self.events.lock().unwrap().push(SurfaceEvent::Codes(codes.to_vec()));
    }
    fn highlight(&mut self, row: usize, col: usize, kind: Highlight) {
        self.events.lock().unwrap().push(SurfaceEvent::Highlight { row, col, kind });
    }
    fn unhighlight(&mut self, row: usize, col: usize) {
        self.events.lock().unwrap().push(SurfaceEvent::Unhighlight { row, col });
    }
    fn reset_cells(&mut self) {
        self.events.lock().unwrap().push(SurfaceEvent::ResetCells);
    }
    fn append_result(&mut self, text: &str) {
        self.events.lock().unwrap().push(SurfaceEvent::AppendResult(text.to_owned()));
    }
    fn set_photodiode(&mut self, on: bool) {
        self.events.lock().unwrap().push(SurfaceEvent::Photodiode(on));
    }
    fn report_tick_rate(&mut self, measured: f32, configured: f32) {
        self.events.lock().unwrap().push(SurfaceEvent::TickRate { measured, configured });
    }
    fn show_probabilities(&mut self, probabilities: &[CommandProbability]) {
        self.events.lock().unwrap().push(SurfaceEvent::Probabilities(probabilities.to_vec()));
    }
    fn closed(&mut self) {
        self.events.lock().unwrap().push(SurfaceEvent::Closed);
    }
}
