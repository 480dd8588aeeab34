use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chirp_bridge::audio::resample::{Interpolation, RateConverter};
use chirp_bridge::audio::{samples_to_bytes, AGENT_SAMPLE_RATE, DEVICE_SAMPLE_RATE};
use chirp_bridge::{Bridge, BridgeConfig, SatelliteEvent};

/// Chirp - ESPHome voice satellite to realtime speech bridge
#[derive(Parser)]
#[command(name = "chirp", version, about)]
struct Cli {
    /// Satellite hostname or IP
    #[arg(long, env = "CHIRP_DEVICE_HOST")]
    host: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the satellite, print what it announces, and exit
    Probe {
        /// Seconds to wait for the handshake
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },
    /// Run a generated tone through the resampling pipeline
    TestAudio,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,chirp_bridge=info",
        1 => "info,chirp_bridge=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Probe { timeout } => probe(cli.host, timeout).await,
            Command::TestAudio => test_audio(),
        };
    }

    let config = BridgeConfig::load(cli.host)?;
    tracing::info!(
        device = %config.device.host,
        model = %config.realtime.session.model,
        "starting chirp bridge"
    );

    Bridge::new(config).run().await?;

    Ok(())
}

/// Connect to the satellite and print everything it announces
async fn probe(host: Option<String>, timeout_secs: u64) -> anyhow::Result<()> {
    let config = BridgeConfig::load(host)?;
    println!(
        "Probing {}:{} (up to {timeout_secs}s)...",
        config.device.host, config.device.port
    );

    let (satellite, mut events) = chirp_bridge::satellite::spawn(config.device);

    let connected = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        while let Some(event) = events.recv().await {
            match event {
                SatelliteEvent::Connected(info) => return Some(info),
                SatelliteEvent::Disconnected { reason } => {
                    println!("  attempt failed: {reason}");
                }
                _ => {}
            }
        }
        None
    })
    .await;

    let result = match connected {
        Ok(Some(info)) => {
            println!("\nDevice: {} ({})", info.friendly_name, info.name);
            println!("  ESPHome:    {}", info.esphome_version);
            println!("  Model:      {}", info.model);
            println!("  MAC:        {}", info.mac_address);
            println!("  VA flags:   {:#x}", info.voice_assistant_feature_flags);
            if !info.available_wake_words.is_empty() {
                println!("  Wake words: {}", info.available_wake_words.join(", "));
            }
            if !info.active_wake_words.is_empty() {
                println!("  Active:     {}", info.active_wake_words.join(", "));
            }

            let entities = satellite.entities();
            println!("\nEntities:");
            match entities.media_player() {
                Some(e) => println!("  media player:  {} (key {:#x})", e.object_id, e.key),
                None => println!("  media player:  none (playback will not work)"),
            }
            match entities.mute_switch() {
                Some(e) => println!("  mute switch:   {} (key {:#x})", e.object_id, e.key),
                None => println!("  mute switch:   none"),
            }
            match entities.volume_number() {
                Some(e) => println!("  volume number: {} (key {:#x})", e.object_id, e.key),
                None => println!("  volume number: none"),
            }
            Ok(())
        }
        Ok(None) => Err(anyhow::anyhow!("satellite client stopped before connecting")),
        Err(_) => Err(anyhow::anyhow!(
            "no handshake within {timeout_secs}s - is the device reachable and unencrypted?"
        )),
    };

    satellite.shutdown().await;
    result
}

/// Sweep bounds for the diagnostic signal: the speech band the bridge
/// actually carries
const SWEEP_START_HZ: f32 = 100.0;
const SWEEP_END_HZ: f32 = 4_000.0;

/// Run a sine sweep through the 16 kHz -> 24 kHz -> 16 kHz pipeline, report
/// how much of the signal survives, and write the result as a WAV for a
/// listening check
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn test_audio() -> anyhow::Result<()> {
    println!("Testing the resampling pipeline...\n");

    let sweep = sweep_pcm(DEVICE_SAMPLE_RATE, 2.0);
    println!(
        "  {SWEEP_START_HZ} Hz -> {SWEEP_END_HZ} Hz sweep: {} samples at {} Hz",
        sweep.len() / 2,
        DEVICE_SAMPLE_RATE
    );

    let mut up = RateConverter::upsampler();
    let mut upsampled = up.push(&sweep);
    upsampled.extend_from_slice(&up.flush());
    println!(
        "  up: {} samples at {} Hz",
        upsampled.len() / 2,
        AGENT_SAMPLE_RATE
    );

    let mut down = RateConverter::downsampler(Interpolation::CatmullRom);
    let mut returned = down.push(&upsampled);
    returned.extend_from_slice(&down.flush());
    println!(
        "  back down: {} samples at {} Hz",
        returned.len() / 2,
        DEVICE_SAMPLE_RATE
    );

    let path = std::env::temp_dir().join("chirp-test-audio.wav");
    write_wav(&path, &returned, DEVICE_SAMPLE_RATE)?;
    println!("  round trip written to {}", path.display());

    let original_rms = rms(&sweep);
    let returned_rms = rms(&returned);
    let ratio = if original_rms > 0.0 {
        returned_rms / original_rms
    } else {
        0.0
    };
    println!("  energy: {original_rms:.4} -> {returned_rms:.4} (ratio {ratio:.3})");

    println!("\n---");
    if (0.8..=1.2).contains(&ratio) {
        println!("Round trip looks healthy. Listen to the WAV to double-check.");
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "energy ratio {ratio:.3} is outside 0.8..1.2 - the pipeline is damaging audio"
        ))
    }
}

/// Linear sine sweep over the speech band, phase-accumulated so the
/// frequency ramp has no discontinuities
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn sweep_pcm(sample_rate: u32, seconds: f32) -> Vec<u8> {
    let n = (sample_rate as f32 * seconds) as usize;
    let mut phase = 0.0_f32;
    let samples: Vec<i16> = (0..n)
        .map(|i| {
            let progress = i as f32 / n as f32;
            let frequency = SWEEP_START_HZ + (SWEEP_END_HZ - SWEEP_START_HZ) * progress;
            phase += 2.0 * std::f32::consts::PI * frequency / sample_rate as f32;
            (phase.sin() * 0.5 * f32::from(i16::MAX)) as i16
        })
        .collect();
    samples_to_bytes(&samples)
}

/// Write little-endian PCM16 as a mono WAV file
fn write_wav(path: &std::path::Path, pcm: &[u8], sample_rate: u32) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in chirp_bridge::audio::bytes_to_samples(pcm) {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// RMS of little-endian PCM16 as a fraction of full scale
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn rms(pcm: &[u8]) -> f32 {
    let samples = chirp_bridge::audio::bytes_to_samples(pcm);
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let x = f64::from(s) / f64::from(i16::MAX);
            x * x
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}
