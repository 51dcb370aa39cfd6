//! The controller task: sole owner of mode, actuator, timer and snapshot
//! state.
//!
//! Everything that can change that state arrives over a channel: pushes from
//! store subscriptions, sensor refresh results and handshake reports on the
//! event channel, user intents on the command channel, and the two 1 s
//! ticks. Writes leave through the [`WriteQueue`], so the loop never waits
//! on the store. After each step the read-mostly [`SharedState`] view is
//! updated for the HTTP surface.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::actuator::{ActuatorMirror, ACTUATORS};
use crate::config::Config;
use crate::control::{self, Thresholds};
use crate::handshake::{self, ConnectivityReport};
use crate::mode::{Mode, ModeMachine, Observed};
use crate::notify::AlertNotifier;
use crate::scheduler::{self, TickOutcome, TimerState};
use crate::snapshot::{self, SensorSnapshot};
use crate::state::{SharedState, SystemState};
use crate::store::{as_bool, as_u64, keys, StateStore, Subscription};
use crate::writer::WriteQueue;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Inputs from the background tasks.
#[derive(Debug)]
pub enum Event {
    /// A subscribed field changed in the store.
    Remote { key: &'static str, value: Value },
    Snapshot(Result<SensorSnapshot>),
    Connectivity(ConnectivityReport),
}

/// User intents from the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetMode(Mode),
    /// 0-based actuator index.
    Toggle(usize),
    SelectHours(u8),
    MotorsOn,
    MotorsOff,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    Ignored(String),
}

pub struct Request {
    pub command: Command,
    pub reply: oneshot::Sender<Outcome>,
}

/// Handle for submitting commands and awaiting their outcome.
#[derive(Clone)]
pub struct CommandSender(mpsc::Sender<Request>);

impl CommandSender {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self(tx), rx)
    }

    /// Fails only when the controller has stopped.
    pub async fn send(&self, command: Command) -> Result<Outcome> {
        let (reply, outcome) = oneshot::channel();
        self.0
            .send(Request { command, reply })
            .await
            .map_err(|_| anyhow!("controller is not running"))?;
        outcome
            .await
            .map_err(|_| anyhow!("controller dropped the command"))
    }
}

// ---------------------------------------------------------------------------
// Engine state
// ---------------------------------------------------------------------------

pub struct Controller {
    mode: ModeMachine,
    actuators: ActuatorMirror,
    timer: TimerState,
    snapshot: SensorSnapshot,
    thresholds: Thresholds,
    alerts: AlertNotifier,
    writer: WriteQueue,
}

impl Controller {
    pub fn new(config: &Config, writer: WriteQueue) -> Self {
        Self {
            mode: ModeMachine::new(Mode::default()),
            actuators: ActuatorMirror::new(writer.clone()),
            timer: TimerState::new(config.timer.default_hours),
            snapshot: SensorSnapshot::default(),
            thresholds: config.thresholds(),
            alerts: AlertNotifier::new(config.alerts.enabled, config.alert_cooldown()),
            writer,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode.current()
    }

    pub fn actuators(&self) -> [bool; ACTUATORS] {
        self.actuators.states()
    }

    pub fn timer(&self) -> TimerState {
        self.timer
    }

    // -- Commands -----------------------------------------------------------

    pub fn handle_command(&mut self, command: Command, view: &mut SystemState) -> Outcome {
        let mode = self.mode();
        let outcome = match command {
            Command::SetMode(next) => {
                self.set_mode(next, view);
                Outcome::Applied
            }
            Command::Toggle(index) if index >= ACTUATORS => {
                Outcome::Ignored(format!("no motor {}", index + 1))
            }
            Command::Toggle(index) => match self.actuators.toggle(index, mode) {
                Some(on) => {
                    info!(actuator = index + 1, on, "manual toggle");
                    view.record_motor(index, on);
                    Outcome::Applied
                }
                None => Outcome::Ignored(format!("manual toggles are ignored in {mode} mode")),
            },
            Command::SelectHours(_) | Command::MotorsOn | Command::MotorsOff
                if mode != Mode::Timer =>
            {
                Outcome::Ignored(format!("timer controls are ignored in {mode} mode"))
            }
            Command::SelectHours(hours) => match scheduler::period_hours(u64::from(hours)) {
                Some(hours) => {
                    self.select_hours(hours, view);
                    Outcome::Applied
                }
                None => Outcome::Ignored(format!("{hours} h is outside 1..=24")),
            },
            Command::MotorsOn => {
                let changed = self
                    .actuators
                    .evaluate_and_activate(&self.snapshot, self.thresholds.low);
                self.record_motors(&changed, view);
                Outcome::Applied
            }
            Command::MotorsOff => {
                let changed = self.actuators.all_off();
                self.record_motors(&changed, view);
                Outcome::Applied
            }
        };
        if let Outcome::Ignored(reason) = &outcome {
            debug!(?command, reason = %reason, "command ignored");
        }
        outcome
    }

    /// Local mode switch. Writes go out in a fixed order: every actuator off,
    /// countdown stopped and zeroed, then the new mode.
    pub fn set_mode(&mut self, next: Mode, view: &mut SystemState) {
        let previous = self.mode.request(next);
        let epoch = self.writer.advance_epoch();
        info!(from = %previous, to = %next, epoch, "mode change requested");

        let changed = self.actuators.all_off();
        self.record_motors(&changed, view);

        let was_counting = self.timer.counting;
        self.timer = self.timer.stopped();
        self.writer.submit(keys::IS_COUNTING, false);
        self.writer.submit(keys::TIMER, 0);
        self.writer.submit(keys::OPERATION_MODE, next);
        if was_counting {
            view.record_timer("countdown stopped by mode change".to_string());
        }

        view.record_mode(previous, next, "local");
        view.timer = self.timer;
    }

    fn select_hours(&mut self, hours: u8, view: &mut SystemState) {
        let changed = self.actuators.all_off();
        self.record_motors(&changed, view);

        self.timer = self.timer.restarted(hours);
        self.writer.submit(keys::TIMER, self.timer.countdown);
        self.writer.submit(keys::IS_COUNTING, true);
        self.writer.submit(keys::TIMER_HOURS, hours);

        info!(hours, "countdown started");
        view.record_timer(format!("countdown started for {hours} h"));
        view.timer = self.timer;
    }

    // -- Events -------------------------------------------------------------

    pub fn handle_event(&mut self, event: Event, view: &mut SystemState) {
        match event {
            Event::Remote { key, value } => self.handle_remote(key, &value, view),
            Event::Snapshot(result) => self.on_snapshot(result, view),
            Event::Connectivity(report) => {
                match &report {
                    ConnectivityReport::Error(e) => warn!("connectivity check failed: {e}"),
                    other => debug!(report = ?other, "connectivity checked"),
                }
                view.record_connectivity(report);
            }
        }
    }

    fn handle_remote(&mut self, key: &str, value: &Value, view: &mut SystemState) {
        if key == keys::OPERATION_MODE {
            self.observe_mode(value, view);
        } else if let Some(index) = keys::MOTORS.iter().position(|k| *k == key) {
            match self.actuators.mirror(index, value) {
                Some(true) => view.record_motor(index, self.actuators.states()[index]),
                Some(false) => {}
                None => warn!(key, %value, "ignoring non-boolean motor value"),
            }
        } else if key == keys::TIMER {
            match as_u64(value) {
                Some(seconds) => self.timer = self.timer.with_countdown(seconds),
                None => warn!(key, %value, "ignoring non-integer countdown"),
            }
        } else if key == keys::IS_COUNTING {
            match as_bool(value) {
                Some(counting) => self.timer = self.timer.with_counting(counting),
                None => warn!(key, %value, "ignoring non-boolean counting flag"),
            }
        } else if key == keys::TIMER_HOURS {
            match as_u64(value).and_then(scheduler::period_hours) {
                Some(hours) => self.timer = self.timer.with_period(hours),
                None => warn!(key, %value, "ignoring timer period outside 1..=24"),
            }
        } else {
            debug!(key, "unhandled remote field");
        }
        view.timer = self.timer;
    }

    fn observe_mode(&mut self, value: &Value, view: &mut SystemState) {
        match self.mode.observe(value) {
            Observed::Changed { from, to } => {
                let epoch = self.writer.advance_epoch();
                info!(%from, %to, epoch, "mode changed remotely");
                view.record_mode(from, to, "remote");
            }
            Observed::Unchanged => view.rejected_mode = None,
            Observed::Rejected(e) => {
                warn!(mode = %self.mode(), "{e}; keeping current mode");
                view.record_rejected_mode(e.0);
            }
        }
    }

    fn on_snapshot(&mut self, result: Result<SensorSnapshot>, view: &mut SystemState) {
        view.record_snapshot(&result);
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("sensor refresh failed; keeping last snapshot: {e:#}");
                return;
            }
        };
        self.snapshot = snapshot;

        if let Some(alert) = self
            .alerts
            .evaluate(&snapshot, self.thresholds.low, Instant::now())
        {
            warn!(plants = ?alert.plants, "{}", alert.message);
            self.writer.submit_unscoped(
                keys::LOW_MOISTURE_ALERT,
                json!({ "plants": alert.plants, "message": alert.message }),
            );
            view.record_alert(&alert);
        }
    }

    // -- Ticks --------------------------------------------------------------

    /// Hysteresis step; Auto only.
    pub fn control_tick(&mut self, view: &mut SystemState) {
        if self.mode() != Mode::Auto {
            return;
        }
        let desired = control::decide(
            &self.snapshot.moisture,
            self.actuators.states(),
            self.thresholds,
        );
        let changed = self.actuators.converge(desired);
        for &i in &changed {
            info!(
                actuator = i + 1,
                on = desired[i],
                moisture = ?self.snapshot.moisture[i],
                "hysteresis switched actuator"
            );
        }
        self.record_motors(&changed, view);
    }

    /// Countdown step; Timer only.
    pub fn countdown_tick(&mut self, view: &mut SystemState) {
        if self.mode() != Mode::Timer {
            return;
        }
        let (next, outcome) = scheduler::tick(self.timer);
        self.timer = next;
        match outcome {
            TickOutcome::Idle => return,
            TickOutcome::Counted { remaining } => self.writer.submit(keys::TIMER, remaining),
            TickOutcome::Expired { reset_to } => {
                let changed = self
                    .actuators
                    .evaluate_and_activate(&self.snapshot, self.thresholds.low);
                self.writer.submit(keys::TIMER, reset_to);
                info!(
                    activated = ?changed,
                    next_in_secs = reset_to,
                    "countdown expired; activation pulse"
                );
                self.record_motors(&changed, view);
                view.record_timer(format!(
                    "activation pulse; next in {}",
                    next.remaining_hms()
                ));
            }
        }
        view.timer = self.timer;
    }

    fn record_motors(&self, changed: &[usize], view: &mut SystemState) {
        let states = self.actuators.states();
        for &i in changed {
            view.record_motor(i, states[i]);
        }
    }
}

// ---------------------------------------------------------------------------
// Task wiring
// ---------------------------------------------------------------------------

/// Background tasks, aborted when dropped.
struct Tasks(Vec<JoinHandle<()>>);

impl Tasks {
    /// Abort every task and wait until each has let go of its resources.
    async fn stop(mut self) {
        for task in self.0.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Tasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Fields pushed to the controller by subscription.
const SUBSCRIBED: [&str; 7] = [
    keys::MOTORS[0],
    keys::MOTORS[1],
    keys::MOTORS[2],
    keys::MOTORS[3],
    keys::TIMER,
    keys::IS_COUNTING,
    keys::TIMER_HOURS,
];

fn forward(mut sub: Subscription, key: &'static str, events: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(value) = sub.recv().await {
            if events.send(Event::Remote { key, value }).await.is_err() {
                break;
            }
        }
        debug!(key = sub.key(), "subscription forwarder finished");
    })
}

fn ticker(period: Duration, missed: MissedTickBehavior) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(missed);
    interval
}

/// Run the controller until `shutdown` flips (or its sender is dropped).
pub async fn run<S: StateStore>(
    store: S,
    config: &Config,
    shared: SharedState,
    mut commands: mpsc::Receiver<Request>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (writer, drain) = WriteQueue::spawn(store.clone(), config.write_timeout());
    let mut controller = Controller::new(config, writer.clone());
    let (events_tx, mut events) = mpsc::channel::<Event>(64);

    // Start-up: wait (bounded) for the authoritative mode.
    let mut mode_sub = store.subscribe(keys::OPERATION_MODE);
    match tokio::time::timeout(config.initial_wait(), mode_sub.recv()).await {
        Ok(Some(value)) => {
            let mut view = shared.write().await;
            controller.observe_mode(&value, &mut view);
        }
        Ok(None) => warn!("operation_mode subscription closed during start-up"),
        Err(_) => warn!(
            wait = ?config.initial_wait(),
            "no operation_mode value yet; starting in {}",
            controller.mode()
        ),
    }
    {
        let mut view = shared.write().await;
        view.loading = false;
        view.mode = controller.mode();
        view.record_system(format!("controller started in {} mode", controller.mode()));
    }
    info!(mode = %controller.mode(), "controller started");

    let mut handles = vec![forward(mode_sub, keys::OPERATION_MODE, events_tx.clone())];
    for key in SUBSCRIBED {
        handles.push(forward(store.subscribe(key), key, events_tx.clone()));
    }
    handles.push(tokio::spawn(snapshot::run(
        store.clone(),
        config.sensor_refresh(),
        events_tx.clone(),
    )));
    handles.push(tokio::spawn(handshake::run(
        store.clone(),
        config.handshake_interval(),
        events_tx.clone(),
    )));
    let tasks = Tasks(handles);

    let mut control_tick = ticker(config.control_tick(), MissedTickBehavior::Skip);
    let mut countdown_tick = ticker(config.countdown_tick(), MissedTickBehavior::Burst);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(event) = events.recv() => {
                let mut view = shared.write().await;
                controller.handle_event(event, &mut view);
            }
            Some(request) = commands.recv() => {
                let outcome = {
                    let mut view = shared.write().await;
                    controller.handle_command(request.command, &mut view)
                };
                let _ = request.reply.send(outcome);
            }
            _ = control_tick.tick() => {
                let mut view = shared.write().await;
                controller.control_tick(&mut view);
            }
            _ = countdown_tick.tick() => {
                let mut view = shared.write().await;
                controller.countdown_tick(&mut view);
            }
        }
    }

    info!(
        mode = %controller.mode(),
        actuators = ?controller.actuators(),
        countdown = controller.timer().countdown,
        "controller stopping"
    );
    tasks.stop().await;
    writer.flush().await;
    drop(controller);
    drop(writer);
    if let Err(e) = drain.await {
        if !e.is_cancelled() {
            warn!("write queue task ended abnormally: {e}");
        }
    }
    shared.write().await.record_system("controller stopped".to_string());
}

// ===========================================================================
// Tests
// ===========================================================================
