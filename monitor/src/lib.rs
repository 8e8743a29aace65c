//! Central polling loop, safety interlock and event stream
//!
//! One cooperative loop on a fixed cadence does everything in a fixed
//! order each tick: telemetry round trip, analyzer ingest, safety check,
//! timer check, reconnection probe. That serializes all access to the
//! session state; the only lock that matters is the link's own.

pub mod timer;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};

use esplink::{
    protocol::{self, Command},
    supervisor::Supervisor,
    Link, LinkError, LinkMode,
};
use shared::{sleep_till, LOOP_TIME_MS, MAX_TUNE_TEMP_C};
use timer::ProcessTimer;
use tuner::{imc_gains, FopdtModel, Gains, StepAnalyzer, TunerState};

/// Immutable per-tick telemetry snapshot, produced once per round trip
/// and handed by value to every consumer of that tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    /// Seconds since the monitor started
    pub elapsed_s: f32,
    pub temp_c: f32,
    pub setpoint_c: f32,
    pub output_pct: u8,
}

/// What the core reports to the collaborator layer. Transport hiccups
/// are quiet (logged only); a safety abort is never silent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    Connected(LinkMode),
    Disconnected,
    Sample(TelemetrySample),
    ModelIdentified(FopdtModel),
    /// A session ended but nothing could be identified from it
    NoModel,
    /// Hard interlock tripped: the step test was aborted
    SafetyAbort { temp_c: f32 },
    TimerFinished,
}

/// Runs the polling loop. Build one, take a [`Commander`] off it for the
/// UI side, then call [`run`](Monitor::run) on a worker thread.
pub struct Monitor {
    link: Arc<Link>,
    analyzer: Arc<Mutex<StepAnalyzer>>,
    timer: Arc<Mutex<ProcessTimer>>,
    supervisor: Supervisor,
    events: Sender<Event>,
    started: Instant,
    was_connected: bool,
    stop: Arc<AtomicBool>,
}

impl Monitor {
    pub fn new(link: Arc<Link>, events: Sender<Event>) -> Self {
        Self {
            was_connected: link.is_connected(),
            link,
            analyzer: Arc::new(Mutex::new(StepAnalyzer::new())),
            timer: Arc::new(Mutex::new(ProcessTimer::new())),
            supervisor: Supervisor::new(),
            events,
            started: Instant::now(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Command surface for external callers. Cheap to clone around.
    pub fn commander(&self) -> Commander {
        Commander {
            link: self.link.clone(),
            analyzer: self.analyzer.clone(),
            timer: self.timer.clone(),
            events: self.events.clone(),
        }
    }

    /// Flip this to wind the loop down
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// One polling tick, in the fixed order
    pub fn tick(&mut self) {
        if self.link.is_connected() {
            match protocol::poll_status(&self.link) {
                Ok(Some(t)) => {
                    let sample = TelemetrySample {
                        elapsed_s: self.started.elapsed().as_secs_f32(),
                        temp_c: t.temp_c,
                        setpoint_c: t.setpoint_c,
                        output_pct: t.output_pct,
                    };

                    self.ingest(sample);
                }
                Ok(None) => debug!("no status line this tick"),
                // The link already dropped itself; the supervisor owns
                // any retry from here
                Err(e) => warn!("telemetry poll failed: {}", e),
            }
        }

        self.report_connection_edge();

        let timer_expired = self.timer.lock().unwrap().check();

        if timer_expired {
            info!("process timer finished, sounding the buzzer");

            if let Err(e) = self.link.send_line(&Command::Buzzer(true).encode()) {
                warn!("buzzer command failed: {}", e);
            }

            self.events.send(Event::TimerFinished).unwrap_or_default();
        }

        if self.supervisor.tick(&self.link) {
            self.report_connection_edge();
        }
    }

    /// Hand the snapshot to the analyzer, then run the interlock
    fn ingest(&mut self, sample: TelemetrySample) {
        let mut analyzer = self.analyzer.lock().unwrap();

        analyzer.ingest(sample.temp_c, sample.output_pct);

        // Hard interlock: the ceiling applies while a step test records,
        // no matter whether a model would have converged
        if analyzer.state() == TunerState::Recording && sample.temp_c >= MAX_TUNE_TEMP_C {
            analyzer.abort();
            drop(analyzer);

            error!(
                "SAFETY ABORT: {:.1}C reached the {:.1}C ceiling during a step test",
                sample.temp_c, MAX_TUNE_TEMP_C
            );

            if let Err(e) = self.link.send_line(&Command::TuneStop.encode()) {
                warn!("identification stop command failed: {}", e);
            }

            self.events
                .send(Event::SafetyAbort {
                    temp_c: sample.temp_c,
                })
                .unwrap_or_default();
        } else {
            drop(analyzer);
        }

        self.events.send(Event::Sample(sample)).unwrap_or_default();
    }

    fn report_connection_edge(&mut self) {
        let connected = self.link.is_connected();

        if connected == self.was_connected {
            return;
        }

        self.was_connected = connected;

        let event = match connected {
            true => Event::Connected(self.link.mode()),
            false => Event::Disconnected,
        };

        self.events.send(event).unwrap_or_default();
    }

    /// Block on the polling loop until the stop flag flips
    pub fn run(&mut self) {
        info!("polling loop up, {}ms cadence", LOOP_TIME_MS);

        while !self.stop.load(Ordering::Relaxed) {
            let wakeup = Instant::now()
                .checked_add(Duration::from_millis(LOOP_TIME_MS))
                .unwrap();

            self.tick();

            sleep_till(wakeup);
        }

        info!("polling loop down");
    }
}

/// External command surface: everything the UI layer may ask the core
/// to do. Every method serializes onto the link's own lock, so calls
/// from here can never interleave with the polling tick's traffic.
#[derive(Clone)]
pub struct Commander {
    link: Arc<Link>,
    analyzer: Arc<Mutex<StepAnalyzer>>,
    timer: Arc<Mutex<ProcessTimer>>,
    events: Sender<Event>,
}

impl Commander {
    /// Single-field setpoint update, deliberately never bundled with
    /// gains so a target change can't disturb the controller state
    pub fn set_setpoint(&self, setpoint_c: f32) -> Result<(), LinkError> {
        self.link.send_line(&Command::Setpoint(setpoint_c).encode())
    }

    /// Sequenced P, I, D upload
    pub fn upload_gains(&self, gains: Gains) -> Result<(), LinkError> {
        protocol::send_gains(&self.link, gains.kp, gains.ki, gains.kd)
    }

    pub fn buzzer(&self, on: bool) -> Result<(), LinkError> {
        self.link.send_line(&Command::Buzzer(on).encode())
    }

    pub fn set_wifi_credentials(&self, ssid: &str, password: &str) -> Result<(), LinkError> {
        self.link
            .send_line(&Command::SetWifi { ssid, password }.encode())
    }

    pub fn reset_wifi(&self) -> Result<(), LinkError> {
        self.link.send_line(&Command::ResetWifi.encode())
    }

    /// Put the firmware in identification mode and start recording from
    /// the latest live temperature
    pub fn start_identification(&self, step_pwr_pct: f32) -> Result<(), LinkError> {
        self.link.send_line(&Command::TuneStart.encode())?;

        let mut analyzer = self.analyzer.lock().unwrap();
        let base = analyzer.latest_temp_c();
        analyzer.start(base, step_pwr_pct);

        Ok(())
    }

    /// Leave identification mode and fit the recording. `Ok(None)` is a
    /// finished session that no model could be identified from.
    pub fn stop_identification(&self) -> Result<Option<FopdtModel>, LinkError> {
        self.link.send_line(&Command::TuneStop.encode())?;

        let model = self.analyzer.lock().unwrap().stop();

        let event = match model {
            Some(model) => Event::ModelIdentified(model),
            None => Event::NoModel,
        };
        self.events.send(event).unwrap_or_default();

        Ok(model)
    }

    /// Gains for the current model, recomputed on every call so a lambda
    /// change never needs the step test rerun
    pub fn synthesized_gains(&self, lambda_s: Option<f32>) -> Option<Gains> {
        self.analyzer
            .lock()
            .unwrap()
            .model()
            .map(|model| imc_gains(&model, lambda_s))
    }

    /// Send the setpoint (alone) and arm the process timer
    pub fn start_timer(&self, setpoint_c: f32, minutes: f64) -> Result<(), LinkError> {
        self.set_setpoint(setpoint_c)?;
        self.timer.lock().unwrap().start(minutes);

        Ok(())
    }

    /// Cancel the timer and silence the buzzer
    pub fn stop_timer(&self) -> Result<(), LinkError> {
        self.timer.lock().unwrap().stop();
        self.buzzer(false)
    }

    #[inline]
    pub fn timer_remaining_s(&self) -> u64 {
        self.timer.lock().unwrap().remaining_s()
    }

    /// Latest live `(temperature, output)` for display
    pub fn live_values(&self) -> (f32, u8) {
        let analyzer = self.analyzer.lock().unwrap();

        (analyzer.latest_temp_c(), analyzer.latest_out_pct())
    }

    #[inline]
    pub fn identification_state(&self) -> TunerState {
        self.analyzer.lock().unwrap().state()
    }
}
