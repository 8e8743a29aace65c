use std::{thread::sleep, time::Instant};

/// Default IP of the oven's WiFi access point
pub static DEFAULT_WIFI_IP: &str = "192.168.4.1";
/// Default TCP port the control board listens on
pub const DEFAULT_WIFI_PORT: u16 = 80;
/// Default baudrate of the USB serial link
pub const DEFAULT_BAUD: u32 = 115_200;

/// Hard temperature ceiling while a step test is recording, in celcius
pub const MAX_TUNE_TEMP_C: f32 = 80.0;
/// Default step power applied during identification, in percent
pub const DEFAULT_STEP_PWR_PCT: f32 = 100.0;

/// Time per polling loop in ms
pub const LOOP_TIME_MS: u64 = 500;
/// Shortest gap between two reconnection probes in seconds
pub const RECONNECT_PERIOD_S: u64 = 5;
/// Timeout of the cheap liveness probe in ms
pub const PROBE_TIMEOUT_MS: u64 = 1_000;
/// Timeout of a full TCP connect in ms
pub const CONNECT_TIMEOUT_MS: u64 = 3_000;
/// Time the control board takes to come out of reset after the
/// host opens the serial port, in ms
pub const SERIAL_SETTLE_MS: u64 = 2_000;
/// Gap between sequenced gain frames in ms
pub const GAIN_FRAME_GAP_MS: u64 = 50;

#[inline]
pub fn sleep_till(instant: Instant) {
    let time_now = Instant::now();

    let sleep_dur = instant.saturating_duration_since(time_now);

    sleep(sleep_dur)
}
