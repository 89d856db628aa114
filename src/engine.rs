// src/engine.rs
use crate::channel::{Inbound, Outbound};
use crate::clock::Clock;
use crate::cycle::{CycleController, CycleEvent, Offer, ResultController, ResultEvent, TrialTimer};
use crate::protocol::{Envelope, RunSetup, ServerEvent, Timings};
use crate::surface::StimulusSurface;
use crate::types::*;
use log::{debug, error, info, warn};
use std::io;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Tick rate used before any parameters have arrived.
pub const DEFAULT_REFRESH_RATE: f32 = 60.0;

const BANNER_WAITING: &str = "Waiting for start...";
const BANNER_FINISHED: &str = "Run finished";
const BANNER_CLOSING: &str = "Closing...";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FinishStage {
    Blank,
    Text,
}

/// Owns the whole run: top-level state, the trial and result sub-machines,
/// the outbound channel and the presentation surface. Only the fixed tick
/// thread touches it; the receive thread talks to it through `inbound`.
pub struct Engine {
    state: RunState,
    paused_from: Option<RunState>,
    setup: Option<RunSetup>,
    cycle: CycleController,
    result: ResultController,
    train_trial: usize,
    test_trial: usize,
    finishing: Option<(FinishStage, TrialTimer)>,
    closing: Option<TrialTimer>,
    photodiode_on: bool,
    ticks: u64,

    inbound: Receiver<Inbound>,
    channel: Arc<dyn Outbound>,
    surface: Box<dyn StimulusSurface>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(
        inbound: Receiver<Inbound>,
        channel: Arc<dyn Outbound>,
        surface: Box<dyn StimulusSurface>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: RunState::WaitingConnection,
            paused_from: None,
            setup: None,
            cycle: CycleController::new(),
            result: ResultController::new(),
            train_trial: 0,
            test_trial: 0,
            finishing: None,
            closing: None,
            photodiode_on: false,
            ticks: 0,
            inbound,
            channel,
            surface,
            clock,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn train_trial(&self) -> usize {
        self.train_trial
    }

    pub fn test_trial(&self) -> usize {
        self.test_trial
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn refresh_rate(&self) -> f32 {
        self.setup
            .as_ref()
            .map(|s| s.refresh_rate)
            .unwrap_or(DEFAULT_REFRESH_RATE)
    }

    fn timings(&self) -> Timings {
        self.setup.as_ref().map(|s| s.timings).unwrap_or_default()
    }

    fn ticks_for(&self, seconds: f32) -> u32 {
        crate::protocol::params::seconds_to_ticks(seconds, self.refresh_rate())
    }

    fn set_state(&mut self, next: RunState) {
        if self.state != next {
            info!("run state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn send(&self, envelope: Envelope) {
        if let Err(e) = self.channel.send(&envelope) {
            error!("failed to send `{}`: {}", envelope.event_type(), e);
        }
    }

    /// One fixed-rate tick.
    pub fn tick(&mut self) {
        self.ticks += 1;
        if self.state == RunState::Closed {
            return;
        }

        // 1. 连接握手
        if self.state == RunState::WaitingConnection && self.channel.is_connected() {
            self.set_state(RunState::WaitingParameters);
            self.send(Envelope::waiting());
        }

        // 2. 处理接收线程积累的消息（保持到达顺序）
        loop {
            match self.inbound.try_recv() {
                Ok(inbound) => self.dispatch(inbound),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.state.is_shutting_down() && !self.channel.is_connected() {
                        warn!("receive thread gone, shutting down");
                        self.enter_stop();
                    }
                    break;
                }
            }
        }

        // 3. 光电二极管方块
        if self.setup.as_ref().map_or(false, |s| s.photodiode) {
            self.photodiode_on = !self.photodiode_on;
            self.surface.set_photodiode(self.photodiode_on);
        }

        // 4. 按状态推进
        match self.state {
            RunState::Running => self.step_cycle(),
            RunState::SelectionReceived => self.step_result(),
            RunState::Finished => self.step_finishing(),
            RunState::Stop => self.step_closing(),
            _ => {}
        }
    }

    fn dispatch(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Event(event) => self.handle(event),
            Inbound::Malformed(e) => {
                error!("malformed message from controller: {}", e);
                if !self.state.is_shutting_down() {
                    self.enter_stop();
                }
            }
            Inbound::Disconnected(reason) => {
                if !self.state.is_shutting_down() {
                    error!("connection lost: {}", reason);
                    self.enter_stop();
                }
            }
        }
    }

    /// Applies one decoded controller event.
    pub fn handle(&mut self, event: ServerEvent) {
        debug!("handling `{}` in {:?}", event.name(), self.state);
        if self.state.is_shutting_down() {
            debug!("ignoring `{}` while shutting down", event.name());
            return;
        }
        match event {
            ServerEvent::Exception(message) => {
                error!("exception from controller, aborting: {}", message);
                self.channel.close();
                self.enter_stop();
            }
            ServerEvent::Unknown(name) => warn!("unknown event type `{}` ignored", name),
            ServerEvent::SetParameters(params) => {
                if !matches!(self.state, RunState::WaitingParameters | RunState::Ready) {
                    warn!("parameters ignored in {:?}", self.state);
                    return;
                }
                match (*params).validate() {
                    Ok(setup) => self.load(setup),
                    Err(e) => {
                        error!("rejected parameters: {}", e);
                        self.enter_stop();
                    }
                }
            }
            _ if self.state == RunState::WaitingParameters => {
                debug!("`{}` before parameters, ignored", event.name());
            }
            ServerEvent::Play => {
                if self.state != RunState::Ready {
                    info!("play in {:?} re-arms the current trial", self.state);
                    self.cancel_activity();
                    self.surface.reset_cells();
                }
                self.set_state(RunState::Running);
                let target = self.current_target();
                self.cycle.arm(CycleState::PrevText, target);
            }
            ServerEvent::Pause => match self.state {
                RunState::Running | RunState::WaitingSelection | RunState::SelectionReceived => {
                    self.paused_from = Some(self.state);
                    self.set_state(RunState::Paused);
                }
                other => debug!("pause ignored in {:?}", other),
            },
            ServerEvent::Resume => {
                if self.state == RunState::Paused {
                    let back = self.paused_from.take().unwrap_or(RunState::Running);
                    self.set_state(back);
                } else {
                    debug!("resume ignored in {:?}", self.state);
                }
            }
            ServerEvent::Stop => self.enter_stop(),
            ServerEvent::Restart => self.restart(),
            ServerEvent::Selection(raw) => self.on_selection(raw),
            ServerEvent::EarlyStopping(probabilities) => {
                if self.setup.as_ref().map_or(false, |s| s.early_stopping) {
                    self.surface.show_probabilities(&probabilities);
                } else {
                    debug!("early stopping disabled, {} probabilities dropped", probabilities.len());
                }
            }
        }
    }

    fn load(&mut self, setup: RunSetup) {
        info!(
            "parameters loaded: mode {}, {} Hz, {} train targets",
            setup.mode.as_str(),
            setup.refresh_rate,
            setup.train_targets.len()
        );
        self.surface
            .load_matrix(setup.active_matrix(), &setup.colors, setup.photodiode);
        self.surface.set_information_text(BANNER_WAITING);
        self.setup = Some(setup);
        self.cycle.disarm();
        self.result.clear();
        self.paused_from = None;
        self.train_trial = 0;
        self.test_trial = 0;
        self.set_state(RunState::Ready);
        self.send(Envelope::ready());
    }

    /// Drops the active trial, result display and finishing sequence.
    fn cancel_activity(&mut self) {
        self.cycle.disarm();
        self.result.clear();
        self.finishing = None;
        self.paused_from = None;
    }

    fn restart(&mut self) {
        self.cancel_activity();
        self.surface.reset_cells();
        self.surface.set_information_text(BANNER_WAITING);
        self.set_state(RunState::Ready);
    }

    fn current_target(&self) -> Option<Coords> {
        let setup = self.setup.as_ref()?;
        match setup.mode {
            Mode::Train => setup.train_targets.get(self.train_trial).copied(),
            Mode::Online => None,
        }
    }

    fn on_selection(&mut self, raw: [i64; 3]) {
        // 暂停期间到达的结果按暂停前的状态处理
        let paused = self.state == RunState::Paused;
        let awaiting = if paused { self.paused_from } else { Some(self.state) };
        if !matches!(awaiting, Some(RunState::WaitingSelection | RunState::SelectionReceived)) {
            warn!("selection {:?} ignored in {:?}", raw, self.state);
            return;
        }
        let Some(setup) = self.setup.as_ref() else {
            return;
        };
        let (coords, text) = match setup.selection(&raw) {
            Ok((coords, cell)) => (coords, cell.text.clone()),
            Err(e) => {
                error!("{}", e);
                self.enter_stop();
                return;
            }
        };
        match self.result.show(coords, &text) {
            Offer::Started => {
                info!("selection {} `{}`", coords, text);
                if paused {
                    self.paused_from = Some(RunState::SelectionReceived);
                } else {
                    self.set_state(RunState::SelectionReceived);
                }
            }
            Offer::Queued => info!("selection {} queued behind the current result", coords),
            Offer::Dropped => warn!("selection {} dropped, one is already queued", coords),
        }
    }

    fn step_cycle(&mut self) {
        let Some(setup) = self.setup.as_ref() else {
            return;
        };
        let events = self.cycle.step(setup);
        for event in events {
            match event {
                CycleEvent::Banner(text) => self.surface.set_information_text(text),
                CycleEvent::Highlight(c) => self.surface.highlight(c.row, c.col, Highlight::Target),
                CycleEvent::Unhighlight(c) => self.surface.unhighlight(c.row, c.col),
                CycleEvent::Codes(codes) => self.surface.set_codes(&codes),
                CycleEvent::Onset(cycle) => self.emit_onset(cycle),
                CycleEvent::ResetCells => self.surface.reset_cells(),
                CycleEvent::Complete => self.on_trial_complete(),
            }
        }
    }

    fn emit_onset(&self, cycle: u32) {
        let Some(setup) = self.setup.as_ref() else {
            return;
        };
        let onset = self.clock.unix_seconds();
        let envelope = match setup.mode {
            Mode::Train => {
                let Some(&target) = setup.train_targets.get(self.train_trial) else {
                    warn!("no training target for trial {}", self.train_trial);
                    return;
                };
                let command_idx = setup.train_matrices[target.matrix].index(target.row, target.col);
                Envelope::train_onset(cycle, onset, self.train_trial, target, command_idx)
            }
            Mode::Online => Envelope::test_onset(cycle, onset, self.test_trial, 0),
        };
        debug!("onset cycle {} at {:.4}", cycle, onset);
        self.send(envelope);
    }

    fn on_trial_complete(&mut self) {
        let Some(setup) = self.setup.as_ref() else {
            return;
        };
        match setup.mode {
            Mode::Train => {
                if self.train_trial + 1 >= setup.train_targets.len() {
                    info!("all {} training trials done", setup.train_targets.len());
                    self.enter_finished();
                } else {
                    self.train_trial += 1;
                    let target = self.current_target();
                    self.cycle.arm(CycleState::Idle, target);
                }
            }
            Mode::Online => {
                self.test_trial += 1;
                self.set_state(RunState::WaitingSelection);
                self.send(Envelope::process_please());
            }
        }
    }

    fn step_result(&mut self) {
        let Some(setup) = self.setup.as_ref() else {
            return;
        };
        let events = self.result.step(setup);
        for event in events {
            match event {
                ResultEvent::Show { coords, text } => {
                    self.surface.append_result(&text);
                    self.surface.highlight(coords.row, coords.col, Highlight::Result);
                }
                ResultEvent::Revert(coords) => self.surface.unhighlight(coords.row, coords.col),
                ResultEvent::End { pending: true } => {}
                ResultEvent::End { pending: false } => self.after_result(),
            }
        }
    }

    fn after_result(&mut self) {
        let exhausted = self
            .setup
            .as_ref()
            .and_then(|s| s.test_trials)
            .map_or(false, |n| self.test_trial >= n);
        if exhausted {
            info!("all {} test trials done", self.test_trial);
            self.enter_finished();
        } else {
            self.set_state(RunState::Running);
            self.cycle.arm(CycleState::Idle, None);
        }
    }

    fn enter_finished(&mut self) {
        self.cycle.disarm();
        self.set_state(RunState::Finished);
        self.surface.set_information_text("");
        let wait = self.ticks_for(self.timings().prev_idle);
        self.finishing = Some((FinishStage::Blank, TrialTimer::new(wait)));
    }

    fn step_finishing(&mut self) {
        let Some((stage, mut timer)) = self.finishing else {
            return;
        };
        if !(timer.expired() || timer.tick()) {
            self.finishing = Some((stage, timer));
            return;
        }
        match stage {
            FinishStage::Blank => {
                self.surface.set_information_text(BANNER_FINISHED);
                let wait = self.ticks_for(self.timings().finish_text);
                self.finishing = Some((FinishStage::Text, TrialTimer::new(wait)));
            }
            FinishStage::Text => {
                self.finishing = None;
                self.send(Envelope::finish());
                self.enter_stop();
            }
        }
    }

    /// Cancels whatever is running and starts the closing sequence.
    fn enter_stop(&mut self) {
        self.cancel_activity();
        self.set_state(RunState::Stop);
        if self.channel.is_connected() {
            self.send(Envelope::close());
        }
        self.surface.set_information_text(BANNER_CLOSING);
        let wait = self.ticks_for(self.timings().finish_text);
        self.closing = Some(TrialTimer::new(wait));
    }

    fn step_closing(&mut self) {
        let done = match self.closing.as_mut() {
            Some(timer) => timer.expired() || timer.tick(),
            None => true,
        };
        if done {
            self.closing = None;
            self.channel.close();
            self.surface.closed();
            self.set_state(RunState::Closed);
        }
    }

    pub fn report_tick_rate(&mut self, measured: f32) {
        let configured = self.refresh_rate();
        self.surface.report_tick_rate(measured, configured);
    }
}

/// Runs the engine at its configured refresh rate until the run is closed.
pub fn spawn_thread(mut engine: Engine) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("engine".into()).spawn(move || {
        info!("engine loop started");
        let mut next = Instant::now();
        let mut window_start = next;
        let mut window_ticks = 0u32;
        loop {
            engine.tick();
            if engine.state() == RunState::Closed {
                break;
            }

            // 每秒统计一次实际 tick 频率
            window_ticks += 1;
            let elapsed = window_start.elapsed();
            if elapsed >= Duration::from_secs(1) {
                engine.report_tick_rate(window_ticks as f32 / elapsed.as_secs_f32());
                window_start = Instant::now();
                window_ticks = 0;
            }

            // 按绝对时间累加，避免漂移
            let period = Duration::from_secs_f32(1.0 / engine.refresh_rate());
            next += period;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else if now - next > period * 4 {
                debug!("tick loop {} ms behind, resyncing", (now - next).as_millis());
                next = now;
            }
        }
        info!("engine loop finished after {} ticks", engine.ticks());
    })
}
