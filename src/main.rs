//! Toneloop - command-line audio loopback latency tester
//!
//! Entry point: parses options, opens either real audio devices or an
//! in-process software loopback, and runs the measurement loop, printing
//! one line per carrier trial and a final summary.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

use anyhow::Result;
use toneloop::audio::device;
use toneloop::audio::io::{CaptureSource, PlaybackSink};
use toneloop::{LatencyReport, LoopConfig, LoopController, SampleFormat, SoftwareLoopback};

struct CliOptions {
    config: LoopConfig,
    playback_device: Option<String>,
    capture_device: Option<String>,
    loopback: bool,
    loopback_delay_ms: u64,
    json: bool,
    verbose: bool,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config: LoopConfig::default(),
            playback_device: None,
            capture_device: None,
            loopback: false,
            loopback_delay_ms: 50,
            json: false,
            verbose: false,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("toneloop=info".parse().expect("static directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_options(&args) {
        Ok(Some(options)) => options,
        Ok(None) => return Ok(()),
        Err(message) => {
            eprintln!("Error: {}", message);
            eprintln!();
            print_usage(&args[0]);
            std::process::exit(1);
        }
    };

    print_config(&options);

    // Configuration errors are fatal before any thread starts
    let mut controller = match LoopController::new(options.config.clone()) {
        Ok(controller) => controller,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    if options.verbose {
        let _ = controller.plan().dump(&mut std::io::stderr());
    }

    let stop = controller.stop_flag();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::Relaxed);
    })
    .ok();

    let frame_bytes = options.config.format.frame_bytes(options.config.channels);
    let (_streams, sink, source): (
        Option<device::StreamPair>,
        Box<dyn PlaybackSink>,
        Box<dyn CaptureSource>,
    ) = if options.loopback {
        let delay_frames = (options.loopback_delay_ms as f64 / 1000.0
            * f64::from(options.config.sample_rate)) as usize;
        let (sink, source) = SoftwareLoopback::with_delay(
            options.config.sample_rate,
            frame_bytes,
            delay_frames,
        );
        eprintln!(
            "Using software loopback with {}ms injected delay.",
            options.loopback_delay_ms
        );
        (None, Box::new(sink), Box::new(source))
    } else {
        let (streams, sink, source) = device::open_duplex(
            &options.config,
            options.playback_device.as_deref(),
            options.capture_device.as_deref(),
        )?;
        tracing::info!("audio streams opened, starting measurement");
        (Some(streams), Box::new(sink), Box::new(source))
    };

    let mut success = 0usize;
    let mut fail = 0usize;
    let report = controller.run(sink, source, |trial| {
        if trial.detected {
            success += 1;
            eprint!("O");
        } else {
            fail += 1;
            eprint!("X");
        }
        eprintln!(
            ": carrier = {:2} ({:5.0} Hz), frames = {:2}, success = {:3}, fail = {:3}, rate = {:5.1}%",
            trial.carrier,
            trial.frequency_hz,
            trial.frames_waited,
            success,
            fail,
            100.0 * success as f64 / (success + fail) as f64
        );
    })?;

    print_summary(&report);
    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if report.trials.is_empty() {
        std::process::exit(3);
    }
    Ok(())
}

fn print_summary(report: &LatencyReport) {
    eprintln!();
    eprintln!(
        "Trials: {} ({} detected, {} missed)",
        report.trials.len(),
        report.success,
        report.fail
    );
    eprintln!("Success rate: {:.1}%", 100.0 * report.success_rate);
    eprintln!("Mean confidence: {:.2}", report.mean_confidence);
    match report.measured_latency_us {
        Some(latency) => println!("Measured Latency: {} uS.", latency),
        None => println!("Audio not detected."),
    }
}

fn parse_options(args: &[String]) -> Result<Option<CliOptions>, String> {
    let mut options = CliOptions::default();
    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-h" | "--help" => {
                print_usage(&args[0]);
                return Ok(None);
            }
            "--version" => {
                println!("toneloop {}", toneloop::VERSION);
                return Ok(None);
            }
            "--loopback" => options.loopback = true,
            "--json" => options.json = true,
            "-v" | "--verbose" => options.verbose = true,
            _ => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| format!("{} requires a value", arg))?;
                match arg {
                    "-o" | "--playback-device" => {
                        options.playback_device = Some(value.clone());
                    }
                    "-i" | "--capture-device" => {
                        options.capture_device = Some(value.clone());
                    }
                    "-l" | "--tone-length" => {
                        options.config.tone_length_sec = parse_number(arg, value)?;
                    }
                    "-f" | "--format" => {
                        options.config.format = SampleFormat::from_arg(value)
                            .ok_or_else(|| format!("unknown format: {}", value))?;
                    }
                    "-r" | "--sample-rate" => {
                        options.config.sample_rate = parse_number(arg, value)?;
                    }
                    "-s" | "--start-volume" => {
                        options.config.start_volume = parse_number(arg, value)?;
                    }
                    "-e" | "--end-volume" => {
                        options.config.end_volume = parse_number(arg, value)?;
                    }
                    "-c" | "--channels" => {
                        options.config.channels = parse_number(arg, value)?;
                    }
                    "-a" | "--active-channels" => {
                        options.config.active_channels = parse_active_channels(value)?;
                    }
                    "-n" | "--fftsize" => {
                        options.config.fft_size = parse_number(arg, value)?;
                    }
                    "-t" | "--trials" => {
                        options.config.trials = parse_number(arg, value)?;
                    }
                    "--low-cutoff" => {
                        options.config.low_cutoff_hz = parse_number(arg, value)?;
                    }
                    "--high-cutoff" => {
                        options.config.high_cutoff_hz = parse_number(arg, value)?;
                    }
                    "--delay-ms" => {
                        options.loopback_delay_ms = parse_number(arg, value)?;
                    }
                    _ => return Err(format!("unknown argument: {}", arg)),
                }
                i += 1;
            }
        }
        i += 1;
    }

    // Default to playing on every channel, listed explicitly
    if options.config.active_channels.is_empty() {
        options.config.active_channels = (0..options.config.channels).collect();
    }
    Ok(Some(options))
}

fn parse_number<T: std::str::FromStr>(arg: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value for {}: {}", arg, value))
}

fn parse_active_channels(value: &str) -> Result<BTreeSet<usize>, String> {
    value
        .split(',')
        .map(|tok| {
            tok.trim()
                .parse()
                .map_err(|_| format!("invalid channel list: {}", value))
        })
        .collect()
}

fn print_config(options: &CliOptions) {
    let config = &options.config;
    eprintln!("Config Values:");
    if options.loopback {
        eprintln!(
            "\tTransport: software loopback ({}ms)",
            options.loopback_delay_ms
        );
    } else {
        eprintln!(
            "\tPlayback Device: {}",
            options.playback_device.as_deref().unwrap_or("default")
        );
        eprintln!(
            "\tCapture Device: {}",
            options.capture_device.as_deref().unwrap_or("default")
        );
    }
    eprintln!("\tFormat: {}", config.format);
    eprintln!("\tTone Length (sec): {:.2}", config.tone_length_sec);
    eprintln!("\tSample Rate (HZ): {}", config.sample_rate);
    eprintln!("\tStart Volume (0-1.0): {:.2}", config.start_volume);
    eprintln!("\tEnd Volume (0-1.0): {:.2}", config.end_volume);
    eprintln!("\tChannels: {}", config.channels);
    eprintln!("\tFFTsize: {}", config.fft_size);
    eprintln!("\tTrials: {}", config.trials);
    let channels: Vec<String> = config
        .active_channels
        .iter()
        .map(|c| c.to_string())
        .collect();
    eprintln!("\tActive Channels: {}", channels.join(" "));
}

fn print_usage(name: &str) {
    let defaults = LoopConfig::default();
    eprintln!("Usage: {} [options]", name);
    eprintln!("\t-i, --capture-device: Name of capture device to use (def default).");
    eprintln!("\t-o, --playback-device: Name of playback device to use (def default).");
    eprintln!(
        "\t-l, --tone-length: Decimal value of tone length in secs (def {:.2}).",
        defaults.tone_length_sec
    );
    eprintln!(
        "\t-f, --format: Sample format {{u8, s16, s24, s32}} (def {}).",
        defaults.format
    );
    eprintln!(
        "\t-r, --sample-rate: Sample rate of generated wave in HZ (def {}).",
        defaults.sample_rate
    );
    eprintln!(
        "\t-s, --start-volume: Decimal value of start volume (def {:.2}).",
        defaults.start_volume
    );
    eprintln!(
        "\t-e, --end-volume: Decimal value of end volume (def {:.2}).",
        defaults.end_volume
    );
    eprintln!(
        "\t-c, --channels: The number of channels (def {}).",
        defaults.channels
    );
    eprintln!("\t-a, --active-channels: Comma-separated list of channels to play on (def all).");
    eprintln!(
        "\t-n, --fftsize: Longer fftsize has more carriers but longer latency (def {}).",
        defaults.fft_size
    );
    eprintln!(
        "\t-t, --trials: Number of carrier trials to run (def {}).",
        defaults.trials
    );
    eprintln!(
        "\t--low-cutoff: Lower edge of the carrier band in Hz (def {}).",
        defaults.low_cutoff_hz
    );
    eprintln!(
        "\t--high-cutoff: Upper edge of the carrier band in Hz (def {}).",
        defaults.high_cutoff_hz
    );
    eprintln!("\t--loopback: Use an in-process software loopback instead of devices.");
    eprintln!("\t--delay-ms: Injected delay for the software loopback (def 50).");
    eprintln!("\t--json: Print the full report as JSON on stdout.");
    eprintln!("\t-v, --verbose: Show the carrier table and debug information.");
    eprintln!("\t-h, --help: Show this page.");
}
