//! Line protocol spoken by the oven firmware
//!
//! Every command is one ASCII frame terminated by `\n`, one command per
//! line. Status lines come back as
//! `ESTADO: temp=<f>,setpoint=<f>,dimmer=<0-255>` with arbitrary junk
//! between the fields.

use std::{thread::sleep, time::Duration};

use crate::{Link, LinkError};
use shared::GAIN_FRAME_GAP_MS;

/// Marker every valid status line carries
const STATUS_MARKER: &str = "ESTADO:";
/// Full scale of the firmware's dimmer output
const DIMMER_MAX: u32 = 255;

/// One command frame understood by the firmware
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command<'a> {
    /// `T<float>`, sets the target temperature alone. Never bundled with
    /// gains so a setpoint change can't disturb the controller state.
    Setpoint(f32),
    /// `P<float>`
    GainP(f32),
    /// `I<float>`
    GainI(f32),
    /// `D<float>`
    GainD(f32),
    /// `B1` / `B0`
    Buzzer(bool),
    /// `E`, puts the firmware in identification mode
    TuneStart,
    /// `N`, back to normal control
    TuneStop,
    /// `SET_WIFI:<ssid>;<password>`, board reboots onto the network
    SetWifi { ssid: &'a str, password: &'a str },
    /// `RESET_WIFI`, board reboots into AP mode
    ResetWifi,
    /// `GET_ESTADO`, telemetry poll
    PollStatus,
}

impl Command<'_> {
    pub fn encode(&self) -> String {
        match self {
            Command::Setpoint(c) => format!("T{}", c),
            Command::GainP(k) => format!("P{}", k),
            Command::GainI(k) => format!("I{}", k),
            Command::GainD(k) => format!("D{}", k),
            Command::Buzzer(true) => "B1".to_string(),
            Command::Buzzer(false) => "B0".to_string(),
            Command::TuneStart => "E".to_string(),
            Command::TuneStop => "N".to_string(),
            Command::SetWifi { ssid, password } => format!("SET_WIFI:{};{}", ssid, password),
            Command::ResetWifi => "RESET_WIFI".to_string(),
            Command::PollStatus => "GET_ESTADO".to_string(),
        }
    }
}

/// Upload the three gain components in strict P, I, D order.
///
/// The firmware consumes one command per line and does not buffer bursts
/// reliably, so each frame gets a short gap after it. The first frame
/// that fails aborts the rest and the whole upload reports failed.
pub fn send_gains(link: &Link, kp: f32, ki: f32, kd: f32) -> Result<(), LinkError> {
    for cmd in [Command::GainP(kp), Command::GainI(ki), Command::GainD(kd)] {
        link.send_line(&cmd.encode())?;
        sleep(Duration::from_millis(GAIN_FRAME_GAP_MS));
    }

    Ok(())
}

/// One decoded status report. Only ever produced whole, from a complete
/// round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub temp_c: f32,
    pub setpoint_c: f32,
    /// Actuator duty converted from the raw 0-255 dimmer to percent
    pub output_pct: u8,
}

/// Poll the board for one telemetry sample. `Ok(None)` means the response
/// was missing or garbled; the link itself is untouched by that.
pub fn poll_status(link: &Link) -> Result<Option<Telemetry>, LinkError> {
    let line = link.request_line(&Command::PollStatus.encode())?;

    Ok(parse_status(&line))
}

/// Parse one status line. Tolerates any amount of garbage: no marker,
/// missing fields, malformed numbers and out-of-range duty all yield
/// `None`, never a panic or a partial sample.
pub fn parse_status(line: &str) -> Option<Telemetry> {
    if !line.contains(STATUS_MARKER) {
        return None;
    }

    let (temp_c, rest) = scan_f32(line, "temp=")?;
    let (setpoint_c, rest) = scan_f32(rest, "setpoint=")?;
    let (dimmer, _) = scan_u32(rest, "dimmer=")?;

    if dimmer > DIMMER_MAX {
        return None;
    }

    let output_pct = (dimmer as f32 / DIMMER_MAX as f32 * 100.0) as u8;

    Some(Telemetry {
        temp_c,
        setpoint_c,
        output_pct,
    })
}

/// Find `key`, take the `[0-9.]+` run after it, return the value and the
/// remainder of the line so the next field is searched in order
fn scan_f32<'a>(hay: &'a str, key: &str) -> Option<(f32, &'a str)> {
    let rest = &hay[hay.find(key)? + key.len()..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());

    let val: f32 = rest[..end].parse().ok()?;

    Some((val, &rest[end..]))
}

fn scan_u32<'a>(hay: &'a str, key: &str) -> Option<(u32, &'a str)> {
    let rest = &hay[hay.find(key)? + key.len()..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());

    let val: u32 = rest[..end].parse().ok()?;

    Some((val, &rest[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_encode() {
        assert_eq!(Command::Setpoint(55.5).encode(), "T55.5");
        assert_eq!(Command::GainP(1.25).encode(), "P1.25");
        assert_eq!(Command::GainI(0.003).encode(), "I0.003");
        assert_eq!(Command::GainD(12.0).encode(), "D12");
        assert_eq!(Command::Buzzer(true).encode(), "B1");
        assert_eq!(Command::Buzzer(false).encode(), "B0");
        assert_eq!(Command::TuneStart.encode(), "E");
        assert_eq!(Command::TuneStop.encode(), "N");
        assert_eq!(
            Command::SetWifi {
                ssid: "oven",
                password: "secreto"
            }
            .encode(),
            "SET_WIFI:oven;secreto"
        );
        assert_eq!(Command::ResetWifi.encode(), "RESET_WIFI");
        assert_eq!(Command::PollStatus.encode(), "GET_ESTADO");
    }

    #[test]
    fn status_line_parses() {
        let t = parse_status("ESTADO: temp=42.5,setpoint=50.0,dimmer=128").unwrap();

        assert_eq!(t.temp_c, 42.5);
        assert_eq!(t.setpoint_c, 50.0);
        assert_eq!(t.output_pct, 50);
    }

    #[test]
    fn separators_are_free_form() {
        let t = parse_status("ESTADO: temp=21.07 | setpoint=0 || dimmer=255 uptime=9").unwrap();

        assert_eq!(t.temp_c, 21.07);
        assert_eq!(t.setpoint_c, 0.0);
        assert_eq!(t.output_pct, 100);
    }

    #[test]
    fn duty_truncates_to_percent() {
        let t = parse_status("ESTADO: temp=30,setpoint=40,dimmer=1").unwrap();

        // 1/255 = 0.39%, truncated
        assert_eq!(t.output_pct, 0);

        let t = parse_status("ESTADO: temp=30,setpoint=40,dimmer=64").unwrap();

        // 64/255 = 25.09%
        assert_eq!(t.output_pct, 25);
    }

    #[test]
    fn noise_yields_no_sample() {
        // No marker
        assert_eq!(parse_status("temp=42.5,setpoint=50.0,dimmer=128"), None);
        // Truncated line
        assert_eq!(parse_status("ESTADO: temp=42.5,setp"), None);
        // Malformed numbers
        assert_eq!(
            parse_status("ESTADO: temp=4.2.5,setpoint=50.0,dimmer=128"),
            None
        );
        assert_eq!(
            parse_status("ESTADO: temp=x,setpoint=50.0,dimmer=128"),
            None
        );
        // Duty out of range
        assert_eq!(
            parse_status("ESTADO: temp=42.5,setpoint=50.0,dimmer=300"),
            None
        );
        // Fields out of order
        assert_eq!(
            parse_status("ESTADO: setpoint=50.0,temp=42.5,dimmer=128"),
            None
        );
        // Empty and unrelated
        assert_eq!(parse_status(""), None);
        assert_eq!(parse_status("boot: wifi up"), None);
    }
}
