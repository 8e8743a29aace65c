//! Operator console for the oven control board
//!
//! Connects over USB serial or WiFi, runs the polling loop on a worker
//! thread and maps stdin lines onto the command surface. Every screen or
//! dashboard concern stays out here, on top of the event stream.

use std::{
    fs::File,
    io::{self, BufRead},
    path::PathBuf,
    sync::{atomic::Ordering, Arc},
    thread,
};

use clap::Parser;
use crossbeam_channel::unbounded;
use log::{error, info, warn};
use serde::Deserialize;

use esplink::Link;
use monitor::{Event, Monitor};
use shared::{DEFAULT_BAUD, DEFAULT_STEP_PWR_PCT, DEFAULT_WIFI_IP, DEFAULT_WIFI_PORT};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Serial port of the board, e.g. /dev/ttyUSB0
    #[arg(short, long)]
    serial: Option<String>,
    /// Baudrate of the serial link
    #[arg(short, long)]
    baud: Option<u32>,
    /// IP of the board on the network
    #[arg(short, long)]
    ip: Option<String>,
    /// TCP port of the board
    #[arg(short, long)]
    port: Option<u16>,
    /// Closed-loop time constant lambda in seconds; tau/2 when omitted
    #[arg(short, long)]
    lambda_s: Option<f32>,
    /// JSON file with connection defaults
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Connection defaults loadable from disk; flags win over the file
#[derive(Deserialize, Default)]
struct Config {
    ip: Option<String>,
    port: Option<u16>,
    baud: Option<u32>,
    lambda_s: Option<f32>,
}

fn load_config(path: Option<&PathBuf>) -> Config {
    let path = match path {
        Some(path) => path,
        None => return Config::default(),
    };

    match File::open(path).map(serde_json::from_reader::<_, Config>) {
        Ok(Ok(config)) => config,
        Ok(Err(e)) => {
            warn!("config {} is not valid JSON: {}", path.display(), e);
            Config::default()
        }
        Err(e) => {
            warn!("config {} unreadable: {}", path.display(), e);
            Config::default()
        }
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref());

    let lambda_s = cli.lambda_s.or(config.lambda_s);

    let link = Arc::new(Link::new());

    let connected = match &cli.serial {
        Some(path) => {
            let baud = cli.baud.or(config.baud).unwrap_or(DEFAULT_BAUD);
            link.connect_serial(path, baud)
        }
        None => {
            let ip = cli
                .ip
                .or(config.ip)
                .unwrap_or_else(|| DEFAULT_WIFI_IP.to_string());
            let port = cli.port.or(config.port).unwrap_or(DEFAULT_WIFI_PORT);
            link.connect_wifi(&ip, port)
        }
    };

    if let Err(e) = connected {
        error!("could not reach the board: {}", e);
        std::process::exit(1);
    }

    let (events_tx, events_rx) = unbounded();
    let mut monitor = Monitor::new(link, events_tx);

    let commander = monitor.commander();
    let stop = monitor.stop_flag();

    let loop_thread = thread::spawn(move || monitor.run());

    thread::spawn(move || {
        for event in events_rx {
            match event {
                Event::Sample(s) => {
                    info!(
                        "t={:.0}s temp={:.2}C sp={:.1}C out={}%",
                        s.elapsed_s, s.temp_c, s.setpoint_c, s.output_pct
                    );
                }
                Event::Connected(mode) => println!("* connected ({:?})", mode),
                Event::Disconnected => println!("* connection lost, probing in background"),
                Event::ModelIdentified(m) => println!(
                    "* model: gain={} tau={}s theta={}s delta={}C",
                    m.gain, m.tau_s, m.dead_time_s, m.delta_temp_c
                ),
                Event::NoModel => println!("* step test finished but no model could be fit"),
                Event::SafetyAbort { temp_c } => {
                    println!("!!! SAFETY ABORT: {:.1}C exceeded the tuning ceiling", temp_c)
                }
                Event::TimerFinished => println!("* timer finished, buzzer on"),
            }
        }
    });

    println!("commands: sp <c> | tune start|stop | gains | apply | timer <c> <min> | timer stop | buzzer on|off | wifi <ssid> <pass> | wifi reset | quit");

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };

        let words: Vec<&str> = line.split_whitespace().collect();

        let outcome = match words.as_slice() {
            ["sp", c] => c
                .parse()
                .map_err(|_| "bad setpoint".to_string())
                .and_then(|c| commander.set_setpoint(c).map_err(|e| e.to_string())),
            ["tune", "start"] => commander
                .start_identification(DEFAULT_STEP_PWR_PCT)
                .map_err(|e| e.to_string()),
            ["tune", "stop"] => commander
                .stop_identification()
                .map(|_| ())
                .map_err(|e| e.to_string()),
            ["gains"] => match commander.synthesized_gains(lambda_s) {
                Some(g) => {
                    println!("kp={} ki={} kd={}", g.kp, g.ki, g.kd);
                    Ok(())
                }
                None => Err("no model identified yet".to_string()),
            },
            ["apply"] => match commander.synthesized_gains(lambda_s) {
                Some(g) => commander.upload_gains(g).map_err(|e| e.to_string()),
                None => Err("no model identified yet".to_string()),
            },
            ["timer", "stop"] => commander.stop_timer().map_err(|e| e.to_string()),
            ["timer", c, min] => match (c.parse(), min.parse()) {
                (Ok(c), Ok(min)) => commander.start_timer(c, min).map_err(|e| e.to_string()),
                _ => Err("usage: timer <c> <min>".to_string()),
            },
            ["buzzer", "on"] => commander.buzzer(true).map_err(|e| e.to_string()),
            ["buzzer", "off"] => commander.buzzer(false).map_err(|e| e.to_string()),
            ["wifi", "reset"] => commander.reset_wifi().map_err(|e| e.to_string()),
            ["wifi", ssid, pass] => commander
                .set_wifi_credentials(ssid, pass)
                .map_err(|e| e.to_string()),
            ["quit"] | ["exit"] => break,
            [] => Ok(()),
            _ => Err("unknown command".to_string()),
        };

        if let Err(e) = outcome {
            println!("error: {}", e);
        }
    }

    stop.store(true, Ordering::Relaxed);
    loop_thread.join().unwrap_or_default();
}
