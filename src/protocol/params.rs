use serde::Deserialize;

use crate::protocol::{ConfigurationError, ProtocolError};
use crate::types::{Coords, Mode};

/// Accepted `fpsResolution`, in Hz.
pub const REFRESH_RATE_RANGE: std::ops::RangeInclusive<f32> = 1.0..=1000.0;

/// One command cell as sent by the controller.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Cell {
    pub row: usize,
    pub col: usize,
    pub text: String,
    #[serde(default)]
    pub label: String,
    /// Appearance codes replayed once per cycle.
    pub sequence: Vec<i32>,
}

/// Row-major command matrix.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Matrix {
    pub n_row: usize,
    pub n_col: usize,
    pub item_list: Vec<Cell>,
}

impl Matrix {
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.n_col + col
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&Cell> {
        if row < self.n_row && col < self.n_col {
            self.item_list.get(self.index(row, col))
        } else {
            None
        }
    }

    /// Shared cycle length. Only meaningful once `validate` has passed.
    pub fn sequence_len(&self) -> usize {
        self.item_list.first().map(|c| c.sequence.len()).unwrap_or(0)
    }

    /// Appearance code of every cell at one position of the cycle, row-major.
    pub fn codes_at(&self, shift: usize) -> Vec<i32> {
        self.item_list.iter().map(|c| c.sequence[shift]).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let expected = self.n_row.checked_mul(self.n_col);
        if expected.map_or(true, |n| n == 0 || n != self.item_list.len()) {
            return Err(ConfigurationError::ShapeMismatch {
                n_row: self.n_row,
                n_col: self.n_col,
                items: self.item_list.len(),
            });
        }
        let len = self.sequence_len();
        for (index, cell) in self.item_list.iter().enumerate() {
            if cell.row >= self.n_row || cell.col >= self.n_col || self.index(cell.row, cell.col) != index {
                return Err(ConfigurationError::CellOutOfRange {
                    index,
                    row: cell.row,
                    col: cell.col,
                });
            }
            if cell.sequence.is_empty() {
                return Err(ConfigurationError::EmptySequence(index));
            }
            if cell.sequence.len() != len {
                return Err(ConfigurationError::SequenceLengthMismatch {
                    index,
                    expected: len,
                    actual: cell.sequence.len(),
                });
            }
        }
        Ok(())
    }
}

/// The controller sends either a plain list (used for both modes) or
/// separate training and test lists.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MatrixSet {
    Split { train: Vec<Matrix>, test: Vec<Matrix> },
    Shared(Vec<Matrix>),
}

impl MatrixSet {
    pub fn train(&self) -> &[Matrix] {
        match self {
            MatrixSet::Split { train, .. } => train,
            MatrixSet::Shared(list) => list,
        }
    }

    pub fn test(&self) -> &[Matrix] {
        match self {
            MatrixSet::Split { test, .. } => test,
            MatrixSet::Shared(list) => list,
        }
    }
}

/// Hex colours for the presentation layer, keyed the way the controller
/// names them.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ColorTable {
    pub color_background: Option<String>,
    pub color_target_box: Option<String>,
    pub color_highlight_result_box: Option<String>,
    pub color_result_info_box: Option<String>,
    pub color_result_info_label: Option<String>,
    pub color_result_info_text: Option<String>,
    pub color_fps_good: Option<String>,
    pub color_fps_bad: Option<String>,
    pub color_box_0: Option<String>,
    pub color_box_1: Option<String>,
    pub color_text_0: Option<String>,
    pub color_text_1: Option<String>,
}

impl ColorTable {
    /// Box colour for an appearance code.
    pub fn box_for(&self, code: i32) -> Option<&str> {
        match code {
            0 => self.color_box_0.as_deref(),
            1 => self.color_box_1.as_deref(),
            _ => None,
        }
    }

    pub fn text_for(&self, code: i32) -> Option<&str> {
        match code {
            0 => self.color_text_0.as_deref(),
            1 => self.color_text_1.as_deref(),
            _ => None,
        }
    }
}

/// Raw `setParameters` payload.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    pub mode: String,
    #[serde(default)]
    pub photodiode_enabled: bool,
    #[serde(default)]
    pub early_stopping_enabled: bool,
    pub train_cycles: u32,
    #[serde(default)]
    pub train_trials: Option<u32>,
    #[serde(default)]
    pub train_target_coords: Option<Vec<[i64; 3]>>,
    pub test_cycles: u32,
    #[serde(default)]
    pub test_trials: Option<u32>,
    pub fps_resolution: f32,
    pub t_prev_text: f32,
    pub t_prev_iddle: f32,
    pub t_finish_text: f32,
    pub matrices: MatrixSet,
    #[serde(flatten)]
    pub colors: ColorTable,
}

/// Phase durations in seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Timings {
    pub prev_text: f32,
    pub prev_idle: f32,
    pub finish_text: f32,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            prev_text: 1.0,
            prev_idle: 0.5,
            finish_text: 1.0,
        }
    }
}

/// Validated, immutable configuration for one run.
#[derive(Clone, Debug)]
pub struct RunSetup {
    pub mode: Mode,
    pub refresh_rate: f32,
    pub timings: Timings,
    pub train_cycles: u32,
    pub test_cycles: u32,
    pub train_targets: Vec<Coords>,
    pub test_trials: Option<usize>,
    pub photodiode: bool,
    pub early_stopping: bool,
    pub train_matrices: Vec<Matrix>,
    pub test_matrices: Vec<Matrix>,
    pub colors: ColorTable,
}

impl Parameters {
    pub fn from_json(message: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(message).map_err(|source| ProtocolError::MalformedBody {
            event: "setParameters".to_owned(),
            source,
        })
    }

    pub fn validate(self) -> Result<RunSetup, ConfigurationError> {
        let mode = Mode::parse(&self.mode).ok_or_else(|| ConfigurationError::UnknownMode(self.mode.clone()))?;
        if !REFRESH_RATE_RANGE.contains(&self.fps_resolution) {
            return Err(ConfigurationError::InvalidRefreshRate(self.fps_resolution));
        }
        if self.matrices.test().is_empty() {
            return Err(ConfigurationError::EmptyMatrix("test"));
        }
        if self.matrices.train().is_empty() {
            return Err(ConfigurationError::EmptyMatrix("training"));
        }
        for matrix in self.matrices.train().iter().chain(self.matrices.test()) {
            matrix.validate()?;
        }

        let train_matrices = self.matrices.train().to_vec();
        let train_targets = match &self.train_target_coords {
            Some(list) => list
                .iter()
                .enumerate()
                .map(|(index, raw)| {
                    resolve(&train_matrices, raw).ok_or(ConfigurationError::TrainTargetOutOfRange {
                        index,
                        coords: *raw,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => vec![Coords::default(); self.train_trials.unwrap_or(1) as usize],
        };
        if mode == Mode::Train && train_targets.is_empty() {
            return Err(ConfigurationError::NoTrainingTargets);
        }

        Ok(RunSetup {
            mode,
            refresh_rate: self.fps_resolution,
            timings: Timings {
                prev_text: self.t_prev_text,
                prev_idle: self.t_prev_iddle,
                finish_text: self.t_finish_text,
            },
            train_cycles: self.train_cycles,
            test_cycles: self.test_cycles,
            train_targets,
            test_trials: self.test_trials.map(|n| n as usize),
            photodiode: self.photodiode_enabled,
            early_stopping: self.early_stopping_enabled,
            test_matrices: self.matrices.test().to_vec(),
            train_matrices,
            colors: self.colors,
        })
    }
}

/// Checks `[matrix, row, col]` against a matrix list.
fn resolve(matrices: &[Matrix], raw: &[i64; 3]) -> Option<Coords> {
    let [m, r, c] = *raw;
    let (m, r, c) = (
        usize::try_from(m).ok()?,
        usize::try_from(r).ok()?,
        usize::try_from(c).ok()?,
    );
    matrices.get(m)?.cell(r, c)?;
    Some(Coords::new(m, r, c))
}

impl RunSetup {
    /// Matrix that flickers in the configured mode.
    pub fn active_matrix(&self) -> &Matrix {
        match self.mode {
            Mode::Train => &self.train_matrices[0],
            Mode::Online => &self.test_matrices[0],
        }
    }

    pub fn cycle_limit(&self) -> u32 {
        match self.mode {
            Mode::Train => self.train_cycles,
            Mode::Online => self.test_cycles,
        }
    }

    /// Fixed ticks covering `seconds`.
    pub fn ticks(&self, seconds: f32) -> u32 {
        seconds_to_ticks(seconds, self.refresh_rate)
    }

    /// Resolves a selection against the test matrices.
    pub fn selection(&self, raw: &[i64; 3]) -> Result<(Coords, &Cell), ProtocolError> {
        let out_of_range = || ProtocolError::SelectionOutOfRange {
            coords: raw.to_vec(),
        };
        let coords = resolve(&self.test_matrices, raw).ok_or_else(out_of_range)?;
        let cell = self.test_matrices[coords.matrix]
            .cell(coords.row, coords.col)
            .ok_or_else(out_of_range)?;
        Ok((coords, cell))
    }
}

pub fn seconds_to_ticks(seconds: f32, refresh_rate: f32) -> u32 {
    (seconds.max(0.0) * refresh_rate).round() as u32
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    /// `n_row x n_col` matrix whose cell `i` carries `sequence` rotated by `i`.
    pub fn matrix(n_row: usize, n_col: usize, sequence: &[i32]) -> Value {
        let mut items = Vec::new();
        for r in 0..n_row {
            for c in 0..n_col {
                let idx = r * n_col + c;
                let mut seq = sequence.to_vec();
                seq.rotate_left(idx % sequence.len());
                items.push(json!({
                    "row": r,
                    "col": c,
                    "text": format!("{}", (b'A' + idx as u8) as char),
                    "label": format!("cmd{}", idx),
                    "sequence": seq,
                }));
            }
        }
        json!({ "n_row": n_row, "n_col": n_col, "item_list": items })
    }

    pub fn parameters(mode: &str) -> Value {
        json!({
            "event_type": "setParameters",
            "mode": mode,
            "photodiodeEnabled": false,
            "trainCycles": 3,
            "trainTargetCoords": [[0, 0, 0]],
            "testCycles": 5,
            "fpsResolution": 60,
            "tPrevText": 0.05,
            "tPrevIddle": 0.05,
            "tFinishText": 0.05,
            "matrices": [matrix(4, 4, &[1, 0, 0, 1])],
            "color_box_0": "#000000",
            "color_box_1": "#FFFFFF",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use serde_json::json;

    fn setup(value: serde_json::Value) -> Result<RunSetup, ConfigurationError> {
        Parameters::from_json(&value.to_string()).unwrap().validate()
    }

    #[test]
    fn decodes_a_controller_payload() {
        let setup = setup(parameters("Train")).unwrap();
        assert_eq!(setup.mode, Mode::Train);
        assert_eq!(setup.train_targets, vec![Coords::new(0, 0, 0)]);
        assert_eq!(setup.active_matrix().sequence_len(), 4);
        assert_eq!(setup.colors.box_for(1), Some("#FFFFFF"));
        assert_eq!(setup.ticks(0.05), 3);
        assert_eq!(setup.test_trials, None);
    }

    #[test]
    fn split_matrices_are_kept_apart() {
        let mut value = parameters("Online");
        value["matrices"] = json!({
            "train": [matrix(1, 2, &[0, 1])],
            "test": [matrix(2, 3, &[0, 1, 1])],
        });
        let setup = setup(value).unwrap();
        assert_eq!(setup.train_matrices[0].n_col, 2);
        assert_eq!(setup.active_matrix().n_col, 3);
    }

    #[test]
    fn wrong_cell_count_is_rejected() {
        let mut value = parameters("Train");
        value["matrices"][0]["n_row"] = json!(5);
        assert_eq!(
            setup(value).unwrap_err(),
            ConfigurationError::ShapeMismatch { n_row: 5, n_col: 4, items: 16 }
        );
    }

    #[test]
    fn unequal_sequences_are_rejected() {
        let mut value = parameters("Train");
        value["matrices"][0]["item_list"][7]["sequence"] = json!([0, 1, 0]);
        assert_eq!(
            setup(value).unwrap_err(),
            ConfigurationError::SequenceLengthMismatch { index: 7, expected: 4, actual: 3 }
        );
    }

    #[test]
    fn misplaced_cell_is_rejected() {
        let mut value = parameters("Train");
        value["matrices"][0]["item_list"][1]["col"] = json!(3);
        assert!(matches!(
            setup(value).unwrap_err(),
            ConfigurationError::CellOutOfRange { index: 1, .. }
        ));
    }

    #[test]
    fn training_targets_must_exist() {
        let mut value = parameters("Train");
        value["trainTargetCoords"] = json!([[0, 0, 0], [0, 4, 0]]);
        assert!(matches!(
            setup(value).unwrap_err(),
            ConfigurationError::TrainTargetOutOfRange { index: 1, .. }
        ));
        let mut value = parameters("Train");
        value["trainTargetCoords"] = json!([]);
        assert_eq!(setup(value).unwrap_err(), ConfigurationError::NoTrainingTargets);
    }

    #[test]
    fn missing_targets_fall_back_to_trial_count() {
        let mut value = parameters("Train");
        value.as_object_mut().unwrap().remove("trainTargetCoords");
        value["trainTrials"] = json!(2);
        assert_eq!(setup(value).unwrap().train_targets.len(), 2);
    }

    #[test]
    fn bad_mode_and_rate_are_rejected() {
        let mut value = parameters("Free");
        assert!(matches!(setup(value.clone()), Err(ConfigurationError::UnknownMode(_))));
        value["mode"] = json!("Train");
        for rate in [json!(0), json!(-60), json!(1e-30), json!(1e9)] {
            value["fpsResolution"] = rate;
            assert!(matches!(setup(value.clone()), Err(ConfigurationError::InvalidRefreshRate(_))));
        }
    }

    #[test]
    fn oversized_shape_is_rejected_without_overflow() {
        let mut value = parameters("Train");
        value["matrices"][0]["n_row"] = json!(usize::MAX);
        value["matrices"][0]["n_col"] = json!(2);
        assert!(matches!(
            setup(value).unwrap_err(),
            ConfigurationError::ShapeMismatch { items: 16, .. }
        ));
    }

    #[test]
    fn missing_required_field_is_a_protocol_error() {
        let mut value = parameters("Train");
        value.as_object_mut().unwrap().remove("testCycles");
        assert!(matches!(
            Parameters::from_json(&value.to_string()),
            Err(ProtocolError::MalformedBody { .. })
        ));
    }

    #[test]
    fn selections_are_bounds_checked() {
        let setup = setup(parameters("Online")).unwrap();
        let (coords, cell) = setup.selection(&[0, 1, 2]).unwrap();
        assert_eq!(coords, Coords::new(0, 1, 2));
        assert_eq!(cell.text, "G");
        for bad in [[1, 0, 0], [0, 4, 0], [0, 0, -1]] {
            assert!(matches!(
                setup.selection(&bad),
                Err(ProtocolError::SelectionOutOfRange { .. })
            ));
        }
    }
}
