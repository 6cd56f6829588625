use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use crossbeam_channel::{Receiver, bounded, unbounded};
use eyre::WrapErr;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use damper_config::Config;
use damper_core::adc::AdcState;
use damper_core::calib::{CalibTable, Geometry};
use damper_core::control::ControlParams;
use damper_core::{Engine, EngineCfg, Event, EventLog};
use damper_hardware::LinkEvent;
use damper_hardware::adc_net::AdcEvent;
use damper_traits::AdcTransport;

mod net;

static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Plausible bench values for the simulated ADC: dampers near nominal
/// height, stages slightly above, pressure at the reference.
const SIM_COUNTS: [u16; 8] = [1311, 1311, 1311, 1376, 1376, 1376, 34939, 0];

fn humanize(err: &eyre::Report) -> String {
    use damper_core::error::BuildError;

    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingAdc => {
                "No ADC transport was provided to the engine. This is a wiring bug; \
                 re-run with --log-level=debug and report it."
                    .to_string()
            }
            BuildError::MissingSerials => {
                "No expected controller serials configured. Add [controllers] \
                 expected_serials to the config TOML."
                    .to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "Invalid configuration ({msg}). Edit the config file and rerun."
            ),
        };
    }
    if let Some(ce) = err.downcast_ref::<damper_config::ConfigError>() {
        return format!("Configuration problem: {ce}");
    }
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!("Something went wrong.{cause}\nRe-run with --log-level=debug for details. Original: {err}")
}

/// Build a file sink writer, storing the non-blocking guard in OnceLock.
fn file_layer(file: Option<&str>) -> Option<tracing_appender::non_blocking::NonBlocking> {
    let path = file?;
    let p = std::path::Path::new(path);
    if let Some(parent) = p.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let appender = tracing_appender::rolling::never(".", path);
    let (nb_writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    Some(nb_writer)
}

/// Initialize tracing once for the whole app. Prefer RUST_LOG if set.
fn init_tracing(json: bool, level: &str, file: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        let console = fmt::layer().json().with_target(false);
        if let Some(nb_writer) = file_layer(file) {
            let file_l = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(nb_writer);
            registry.with(console).with(file_l).init();
        } else {
            registry.with(console).init();
        }
    } else {
        let console = fmt::layer().with_target(false);
        if let Some(nb_writer) = file_layer(file) {
            let file_l = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(nb_writer);
            registry.with(console).with(file_l).init();
        } else {
            registry.with(console).init();
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "damper_server", version, about = "Cryostat damper control server")]
struct Cli {
    /// Path to config TOML; deployment defaults apply when omitted
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Calibration CSV with header channel,raw,value
    #[arg(long, value_name = "FILE")]
    calibration: Option<PathBuf>,

    /// Log as JSON lines instead of plain text
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Log level: trace,debug,info,warn,error
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control server until SIGINT
    Run {
        /// Override the observer listener bind address
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },
    /// Bring up the simulated bench and verify discovery and polling
    SelfCheck,
}

fn main() -> eyre::Result<()> {
    if let Err(e) = real_main() {
        eprintln!("{}", humanize(&e));
        std::process::exit(2);
    }
    Ok(())
}

fn real_main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let cfg: Config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("read config {path:?}"))?;
            damper_config::load_toml(&text).wrap_err_with(|| format!("parse config {path:?}"))?
        }
        None => Config::default(),
    };
    cfg.validate().wrap_err("invalid configuration")?;

    init_tracing(cli.json, &cli.log_level, cfg.logging.file.as_deref());

    let calib = match &cli.calibration {
        Some(p) => {
            let anchors = damper_config::load_calibration_csv(p)
                .wrap_err_with(|| format!("parse calibration {p:?}"))?;
            CalibTable::from_anchors(anchors.channels).wrap_err("build calibration table")?
        }
        None => CalibTable::default(),
    };

    match cli.cmd {
        Commands::Run { bind } => run(cfg, calib, bind),
        Commands::SelfCheck => self_check(&cfg, calib),
    }
}

fn engine_cfg(cfg: &Config) -> EngineCfg {
    EngineCfg {
        control: ControlParams {
            load_min: cfg.control.load_min,
            load_max: cfg.control.load_max,
            load_tol: cfg.control.load_tol,
            position_nom: cfg.control.position_nom,
            position_tol: cfg.control.position_tol,
            position_fast: cfg.control.position_fast,
            motor_slow: cfg.control.motor_slow,
            motor_med: cfg.control.motor_med,
            motor_fast: cfg.control.motor_fast,
        },
        geometry: Geometry {
            bellow_dia_cm: cfg.geometry.bellow_dia_cm,
            bellow_pos: cfg.geometry.bellow_pos,
            damper_pos: cfg.geometry.damper_pos,
            air_pressure_nom: cfg.geometry.air_pressure_nom,
            gravity: cfg.geometry.gravity,
        },
        load_nom: cfg.control.load_nom,
        force_const: cfg.control.force_const,
        steps_per_mm: cfg.control.steps_per_mm,
        motor_tol_mm: cfg.control.motor_tol_mm,
        max_bad_polls: cfg.poll.max_bad_polls,
        tick_ms: cfg.poll.tick_ms,
        allow: cfg.server.allow.clone(),
        led_pin: cfg.controllers.led_pin,
    }
}

fn build_engine(
    cfg: &Config,
    calib: CalibTable,
    adc: Box<dyn AdcTransport + Send>,
) -> eyre::Result<Engine> {
    let log_dir = cfg
        .logging
        .dir
        .clone()
        .unwrap_or_else(|| ".".to_string());
    Engine::builder()
        .with_cfg(engine_cfg(cfg))
        .with_calibration(calib)
        .with_adc_transport(adc)
        .with_expected_serials(cfg.controllers.expected_serials.clone())
        .with_event_log(EventLog::new(log_dir))
        .try_build()
}

fn run(cfg: Config, calib: CalibTable, bind: Option<String>) -> eyre::Result<()> {
    let (link_tx, link_rx) = unbounded::<LinkEvent>();
    let (adc_tx, adc_rx) = unbounded::<AdcEvent>();
    let (obs_tx, obs_rx) = unbounded::<Event>();
    let (sig_tx, sig_rx) = bounded::<()>(1);

    #[cfg(feature = "hardware")]
    let (adc, _watcher): (
        Box<dyn AdcTransport + Send>,
        damper_hardware::serial::PortWatcher,
    ) = {
        let adc = damper_hardware::adc_net::TcpAdcTransport::new(
            format!("{}:{}", cfg.adc.host, cfg.adc.port),
            adc_tx,
        );
        let watcher = damper_hardware::serial::PortWatcher::spawn(
            cfg.controllers.usb_vid,
            cfg.controllers.usb_pid,
            link_tx.clone(),
            Duration::from_secs(1),
        );
        (Box::new(adc), watcher)
    };

    #[cfg(not(feature = "hardware"))]
    let adc: Box<dyn AdcTransport + Send> = {
        tracing::info!("no hardware feature: running the simulated bench");
        let (_probes, adc, adc_probe) = damper_hardware::spawn_simulated_bench(
            &cfg.controllers.expected_serials,
            &link_tx,
            adc_tx,
        );
        adc_probe.set_counts(SIM_COUNTS);
        Box::new(adc)
    };

    let mut engine = build_engine(&cfg, calib, adc)?;

    let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
    let server = net::spawn(&bind, obs_tx)?;

    ctrlc::set_handler(move || {
        let _ = sig_tx.try_send(());
    })
    .wrap_err("install SIGINT handler")?;

    let ticker = crossbeam_channel::tick(Duration::from_millis(cfg.poll.tick_ms));
    loop {
        crossbeam_channel::select! {
            recv(ticker) -> _ => engine.handle(Event::Tick),
            recv(link_rx) -> ev => if let Ok(ev) = ev { engine.handle(link_event(ev)) },
            recv(adc_rx) -> ev => if let Ok(ev) = ev { engine.handle(adc_event(ev)) },
            recv(obs_rx) -> ev => if let Ok(ev) = ev { engine.handle(ev) },
            recv(sig_rx) -> _ => engine.handle(Event::Shutdown),
        }
        if engine.is_shutdown() {
            break;
        }
    }

    server.stop();
    // A moment for the final event-log line to land on disk.
    std::thread::sleep(Duration::from_millis(10));
    Ok(())
}

fn link_event(ev: LinkEvent) -> Event {
    match ev {
        LinkEvent::Attached(link) => Event::ControllerAttached(link),
        LinkEvent::Data { handle, bytes } => Event::ControllerData { handle, bytes },
        LinkEvent::Gone { handle } => Event::ControllerGone { handle },
    }
}

fn adc_event(ev: AdcEvent) -> Event {
    match ev {
        AdcEvent::Frame(f) => Event::AdcFrame(f),
        AdcEvent::Closed => Event::AdcClosed,
    }
}

/// Run the full discovery/poll loop against the in-process bench.
fn self_check(cfg: &Config, calib: CalibTable) -> eyre::Result<()> {
    let (link_tx, link_rx) = unbounded::<LinkEvent>();
    let (adc_tx, adc_rx) = unbounded::<AdcEvent>();
    let (_probes, adc, adc_probe) =
        damper_hardware::spawn_simulated_bench(&cfg.controllers.expected_serials, &link_tx, adc_tx);
    adc_probe.set_counts(SIM_COUNTS);

    let tmp = tempdir_for_selfcheck();
    let mut engine = Engine::builder()
        .with_cfg(engine_cfg(cfg))
        .with_calibration(calib)
        .with_adc_transport(Box::new(adc))
        .with_expected_serials(cfg.controllers.expected_serials.clone())
        .with_event_log(EventLog::new(tmp))
        .try_build()?;

    for _ in 0..6 {
        engine.handle(Event::Tick);
        drain(&mut engine, &link_rx, &adc_rx);
    }

    let found = engine.found_count();
    let adc_ok = engine.adc_state() == AdcState::Ok;
    if found == cfg.controllers.expected_serials.len() && adc_ok {
        println!("self-check: ok ({found} controllers, ADC polling)");
        Ok(())
    } else {
        eyre::bail!("self-check failed: {found} controllers found, ADC ok = {adc_ok}")
    }
}

fn tempdir_for_selfcheck() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("damper_selfcheck_{}", std::process::id()));
    let _ = std::fs::create_dir_all(&dir);
    dir
}

fn drain(engine: &mut Engine, link_rx: &Receiver<LinkEvent>, adc_rx: &Receiver<AdcEvent>) {
    loop {
        let mut progressed = false;
        while let Ok(ev) = link_rx.try_recv() {
            engine.handle(link_event(ev));
            progressed = true;
        }
        while let Ok(ev) = adc_rx.try_recv() {
            engine.handle(adc_event(ev));
            progressed = true;
        }
        if !progressed {
            break;
        }
    }
}
