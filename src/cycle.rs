// src/cycle.rs
// 单次 trial 的时序子状态机 + 结果显示子状态机
use crate::protocol::RunSetup;
use crate::types::{Coords, CycleState, Mode, ResultState};
use log::debug;

/// Tick countdown for one timed phase. Waits are counted in fixed ticks so
/// they pause with the tick loop and can be dropped at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrialTimer {
    remaining: u32,
}

impl TrialTimer {
    pub fn new(ticks: u32) -> Self {
        Self { remaining: ticks }
    }

    pub fn expired(&self) -> bool {
        self.remaining == 0
    }

    /// Counts one tick; true once the wait is over.
    pub fn tick(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.expired()
    }
}

/// What one cycle step asks of the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleEvent {
    Banner(&'static str),
    Highlight(Coords),
    Unhighlight(Coords),
    /// Row-major appearance codes for this tick.
    Codes(Vec<i32>),
    /// A new cycle starts rendering on this tick.
    Onset(u32),
    ResetCells,
    /// All cycles of the trial have been shown.
    Complete,
}

#[derive(Clone, Copy, Debug)]
struct Phase {
    state: CycleState,
    // None until the phase's entry actions have run
    timer: Option<TrialTimer>,
}

/// Per-trial timing: PrevText, Idle, [Target, Idle2,] Flickering.
#[derive(Debug, Default)]
pub struct CycleController {
    phase: Option<Phase>,
    target: Option<Coords>,
    shift: usize,
    counter: u32,
}

impl CycleController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a trial at `from`. `target` is the cue shown in train mode.
    pub fn arm(&mut self, from: CycleState, target: Option<Coords>) {
        debug!("trial armed at {:?}", from);
        self.phase = Some(Phase { state: from, timer: None });
        self.target = target;
        self.shift = 0;
        self.counter = 0;
    }

    pub fn disarm(&mut self) {
        self.phase = None;
        self.shift = 0;
        self.counter = 0;
    }

    pub fn is_armed(&self) -> bool {
        self.phase.is_some()
    }

    pub fn state(&self) -> Option<CycleState> {
        self.phase.map(|p| p.state)
    }

    /// Onsets already reported in this trial, plus the grace cycle once it
    /// has begun.
    pub fn cycle_counter(&self) -> u32 {
        self.counter
    }

    /// Runs one fixed tick of the trial.
    pub fn step(&mut self, setup: &RunSetup) -> Vec<CycleEvent> {
        let mut events = Vec::new();
        loop {
            let Some(phase) = self.phase.as_mut() else {
                return events;
            };
            if phase.state == CycleState::Flickering {
                self.flicker(setup, &mut events);
                return events;
            }
            match phase.timer.as_mut() {
                None => {
                    let state = phase.state;
                    let wait = match state {
                        CycleState::PrevText | CycleState::Target => setup.ticks(setup.timings.prev_text),
                        _ => setup.ticks(setup.timings.prev_idle),
                    };
                    phase.timer = Some(TrialTimer::new(wait));
                    self.enter(state, &mut events);
                    if wait > 0 {
                        return events;
                    }
                    self.advance(setup.mode);
                }
                Some(timer) => {
                    if !timer.tick() {
                        return events;
                    }
                    self.advance(setup.mode);
                }
            }
        }
    }

    fn enter(&self, state: CycleState, events: &mut Vec<CycleEvent>) {
        match state {
            CycleState::PrevText => events.push(CycleEvent::Banner("Starting...")),
            CycleState::Idle => events.push(CycleEvent::Banner("")),
            CycleState::Target => {
                if let Some(target) = self.target {
                    events.push(CycleEvent::Highlight(target));
                }
            }
            CycleState::Idle2 => {
                if let Some(target) = self.target {
                    events.push(CycleEvent::Unhighlight(target));
                }
            }
            CycleState::Flickering => {}
        }
    }

    fn advance(&mut self, mode: Mode) {
        let Some(phase) = self.phase.as_mut() else {
            return;
        };
        let next = match (phase.state, mode) {
            (CycleState::PrevText, _) => CycleState::Idle,
            (CycleState::Idle, Mode::Train) => CycleState::Target,
            (CycleState::Idle, Mode::Online) => CycleState::Flickering,
            (CycleState::Target, _) => CycleState::Idle2,
            (CycleState::Idle2, _) | (CycleState::Flickering, _) => CycleState::Flickering,
        };
        debug!("cycle phase {:?} -> {:?}", phase.state, next);
        *phase = Phase { state: next, timer: None };
    }

    fn flicker(&mut self, setup: &RunSetup, events: &mut Vec<CycleEvent>) {
        let limit = setup.cycle_limit();
        let matrix = setup.active_matrix();
        if self.shift == 0 {
            // The cycle after the last one is counted but never announced,
            // so the last announced cycle is rendered in full.
            if self.counter < limit {
                events.push(CycleEvent::Onset(self.counter));
            }
            self.counter += 1;
        }
        if self.counter > limit {
            self.disarm();
            events.push(CycleEvent::ResetCells);
            events.push(CycleEvent::Complete);
            return;
        }
        events.push(CycleEvent::Codes(matrix.codes_at(self.shift)));
        self.shift += 1;
        if self.shift >= matrix.sequence_len() {
            self.shift = 0;
        }
    }
}

/// Whether an offered selection is shown now, later, or not at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offer {
    Started,
    Queued,
    Dropped,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResultEvent {
    Show { coords: Coords, text: String },
    Revert(Coords),
    /// Display finished; `pending` is true when a queued selection follows.
    End { pending: bool },
}

#[derive(Clone, Debug)]
struct Shown {
    coords: Coords,
    text: String,
    state: ResultState,
    timer: Option<TrialTimer>,
}

/// Show, Idle, End display of one selection, with room for one more.
#[derive(Debug, Default)]
pub struct ResultController {
    current: Option<Shown>,
    pending: Option<(Coords, String)>,
}

impl ResultController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&mut self, coords: Coords, text: &str) -> Offer {
        if self.current.is_none() {
            self.current = Some(Shown {
                coords,
                text: text.to_owned(),
                state: ResultState::Show,
                timer: None,
            });
            Offer::Started
        } else if self.pending.is_none() {
            self.pending = Some((coords, text.to_owned()));
            Offer::Queued
        } else {
            Offer::Dropped
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn state(&self) -> Option<ResultState> {
        self.current.as_ref().map(|s| s.state)
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.pending = None;
    }

    pub fn step(&mut self, setup: &RunSetup) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        loop {
            let Some(shown) = self.current.as_mut() else {
                return events;
            };
            match shown.timer.as_mut() {
                None => {
                    let wait = match shown.state {
                        ResultState::Show => {
                            events.push(ResultEvent::Show {
                                coords: shown.coords,
                                text: shown.text.clone(),
                            });
                            setup.ticks(setup.timings.prev_text)
                        }
                        ResultState::Idle => {
                            events.push(ResultEvent::Revert(shown.coords));
                            setup.ticks(setup.timings.prev_idle)
                        }
                        ResultState::End => {
                            self.finish(&mut events);
                            return events;
                        }
                    };
                    shown.timer = Some(TrialTimer::new(wait));
                    if wait > 0 {
                        return events;
                    }
                    shown.state = next_result_state(shown.state);
                    shown.timer = None;
                }
                Some(timer) => {
                    if !timer.tick() {
                        return events;
                    }
                    shown.state = next_result_state(shown.state);
                    shown.timer = None;
                }
            }
        }
    }

    fn finish(&mut self, events: &mut Vec<ResultEvent>) {
        self.current = self.pending.take().map(|(coords, text)| Shown {
            coords,
            text,
            state: ResultState::Show,
            timer: None,
        });
        events.push(ResultEvent::End {
            pending: self.current.is_some(),
        });
    }
}

fn next_result_state(state: ResultState) -> ResultState {
    match state {
        ResultState::Show => ResultState::Idle,
        ResultState::Idle | ResultState::End => ResultState::End,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::params::fixtures;
    use crate::protocol::Parameters;
    use serde_json::json;

    fn setup(mode: &str) -> RunSetup {
        let value = fixtures::parameters(mode);
        Parameters::from_json(&value.to_string()).unwrap().validate().unwrap()
    }

    fn run_trial(cycle: &mut CycleController, setup: &RunSetup) -> Vec<CycleEvent> {
        let mut all = Vec::new();
        for _ in 0..500 {
            let events = cycle.step(setup);
            let done = events.contains(&CycleEvent::Complete);
            all.extend(events);
            if done {
                return all;
            }
        }
        panic!("trial never completed");
    }

    fn onsets(events: &[CycleEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|e| match e {
                CycleEvent::Onset(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn timer_counts_down_to_zero() {
        let mut timer = TrialTimer::new(2);
        assert!(!timer.tick());
        assert!(timer.tick());
        assert!(timer.tick());
        assert!(TrialTimer::new(0).expired());
    }

    #[test]
    fn train_trial_emits_one_onset_per_cycle() {
        let setup = setup("Train");
        let mut cycle = CycleController::new();
        cycle.arm(CycleState::PrevText, Some(Coords::new(0, 0, 0)));
        let events = run_trial(&mut cycle, &setup);
        assert_eq!(onsets(&events), vec![0, 1, 2]);
        let codes = events.iter().filter(|e| matches!(e, CycleEvent::Codes(_))).count();
        assert_eq!(codes, 3 * 4);
        assert!(!cycle.is_armed());
    }

    #[test]
    fn train_trial_shows_and_hides_the_target() {
        let setup = setup("Train");
        let mut cycle = CycleController::new();
        let target = Coords::new(0, 2, 1);
        cycle.arm(CycleState::PrevText, Some(target));
        let events = run_trial(&mut cycle, &setup);
        let at = |wanted: &CycleEvent| events.iter().position(|e| e == wanted).unwrap();
        assert!(at(&CycleEvent::Banner("Starting...")) < at(&CycleEvent::Banner("")));
        assert!(at(&CycleEvent::Highlight(target)) < at(&CycleEvent::Unhighlight(target)));
        assert!(at(&CycleEvent::Unhighlight(target)) < at(&CycleEvent::Onset(0)));
    }

    #[test]
    fn phases_last_their_configured_ticks() {
        let setup = setup("Train");
        let mut cycle = CycleController::new();
        cycle.arm(CycleState::PrevText, None);
        let mut states = Vec::new();
        for _ in 0..13 {
            cycle.step(&setup);
            states.push(cycle.state().unwrap());
        }
        // 3 ticks per phase at 60 Hz and 0.05 s.
        assert_eq!(&states[..3], &[CycleState::PrevText; 3]);
        assert_eq!(&states[3..6], &[CycleState::Idle; 3]);
        assert_eq!(&states[6..9], &[CycleState::Target; 3]);
        assert_eq!(&states[9..12], &[CycleState::Idle2; 3]);
        assert_eq!(states[12], CycleState::Flickering);
    }

    #[test]
    fn online_trial_skips_the_target_phases() {
        let setup = setup("Online");
        let mut cycle = CycleController::new();
        cycle.arm(CycleState::Idle, None);
        let events = run_trial(&mut cycle, &setup);
        assert_eq!(onsets(&events), vec![0, 1, 2, 3, 4]);
        assert!(!events.iter().any(|e| matches!(e, CycleEvent::Highlight(_))));
        assert!(!events.contains(&CycleEvent::Banner("Starting...")));
    }

    #[test]
    fn codes_replay_the_sequence() {
        let setup = setup("Online");
        let mut cycle = CycleController::new();
        cycle.arm(CycleState::Idle, None);
        let codes: Vec<Vec<i32>> = run_trial(&mut cycle, &setup)
            .into_iter()
            .filter_map(|e| match e {
                CycleEvent::Codes(c) => Some(c),
                _ => None,
            })
            .collect();
        let matrix = setup.active_matrix();
        assert_eq!(codes[0], matrix.codes_at(0));
        assert_eq!(codes[5], matrix.codes_at(1));
        assert_eq!(codes[4], codes[0]);
    }

    #[test]
    fn zero_length_waits_fall_through() {
        let mut value = fixtures::parameters("Online");
        value["tPrevText"] = json!(0);
        value["tPrevIddle"] = json!(0);
        let setup = Parameters::from_json(&value.to_string()).unwrap().validate().unwrap();
        let mut cycle = CycleController::new();
        cycle.arm(CycleState::PrevText, None);
        let events = cycle.step(&setup);
        assert_eq!(events[0], CycleEvent::Banner("Starting..."));
        assert!(events.contains(&CycleEvent::Onset(0)));
    }

    #[test]
    fn disarmed_controller_does_nothing() {
        let setup = setup("Online");
        let mut cycle = CycleController::new();
        cycle.arm(CycleState::Idle, None);
        cycle.step(&setup);
        cycle.disarm();
        assert!(cycle.step(&setup).is_empty());
        assert_eq!(cycle.cycle_counter(), 0);
    }

    #[test]
    fn result_runs_show_idle_end() {
        let setup = setup("Online");
        let mut result = ResultController::new();
        let coords = Coords::new(0, 1, 2);
        assert_eq!(result.show(coords, "G"), Offer::Started);
        let mut events = Vec::new();
        for _ in 0..10 {
            events.extend(result.step(&setup));
        }
        assert_eq!(
            events,
            vec![
                ResultEvent::Show { coords, text: "G".into() },
                ResultEvent::Revert(coords),
                ResultEvent::End { pending: false },
            ]
        );
        assert!(!result.is_active());
    }

    #[test]
    fn one_selection_is_queued_and_the_rest_dropped() {
        let setup = setup("Online");
        let mut result = ResultController::new();
        assert_eq!(result.show(Coords::new(0, 0, 0), "A"), Offer::Started);
        assert_eq!(result.show(Coords::new(0, 0, 1), "B"), Offer::Queued);
        assert_eq!(result.show(Coords::new(0, 0, 2), "C"), Offer::Dropped);
        let mut events = Vec::new();
        for _ in 0..20 {
            events.extend(result.step(&setup));
        }
        let shown: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ResultEvent::Show { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(shown, vec!["A", "B"]);
        assert!(events.contains(&ResultEvent::End { pending: true }));
        assert_eq!(events.last(), Some(&ResultEvent::End { pending: false }));
    }
}
