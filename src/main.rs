use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use stress_buddy::notify::ConsoleNotifier;
use stress_buddy::voice::{
    AudioCapture, AudioSink, MicRecognizer, PlaybackEvent, Recognizer, SAMPLE_RATE, Silent,
    Speaker, Synthesizer, Unsupported, calculate_energy, samples_to_wav,
};
use stress_buddy::{
    Config, Coordinator, CoordinatorHandle, Facilities, ResponsePipeline, Session, Snapshot,
};

/// Stress-Buster Buddy - a hands-free voice companion
#[derive(Parser)]
#[command(name = "buddy", version, about)]
struct Cli {
    /// Config file (defaults to the standard location)
    #[arg(short, long, env = "BUDDY_CONFIG")]
    config: Option<PathBuf>,

    /// Start in hands-free auto mode
    #[arg(long)]
    auto: bool,

    /// Disable microphone and speaker (text-only)
    #[arg(long)]
    no_voice: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Interactive first-run setup
    Setup,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,stress_buddy=info",
        1 => "info,stress_buddy=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
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
    let config_path = cli.config.as_deref();

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => {
                test_tts(&Config::load(config_path, false)?, &text).await
            }
            Command::Setup => stress_buddy::setup::run_setup(config_path),
        };
    }

    let config = Config::load(config_path, cli.no_voice)?;
    tracing::debug!(?config, "loaded configuration");

    let generator = Arc::new(config.generator()?);
    let synthesizer = Arc::new(config.synthesizer()?);
    let pipeline = ResponsePipeline::new(generator, synthesizer, config.persona.voice.clone())
        .with_timeout(config.llm.timeout)
        .discard_stale_results(config.discard_stale_results);

    let session = Session::new(&config.persona);
    let (coordinator, handle) = Coordinator::new(
        session,
        pipeline,
        facilities(&config),
        Arc::new(ConsoleNotifier),
        config.timings,
    );
    let coordinator = coordinator.spawn();
    let printer = spawn_printer(handle.subscribe());

    println!("{} is here. Type a message, or /help for commands.", config.persona.name);
    if cli.auto {
        handle.set_auto_mode(true);
    }

    console(&handle).await?;

    handle.shutdown();
    coordinator.await?;
    printer.abort();
    Ok(())
}

/// Microphone and speaker, or their stand-ins when voice is off
fn facilities(config: &Config) -> Facilities {
    let (recognition_tx, recognition_events) = mpsc::unbounded_channel();
    let (playback_tx, playback_events) = mpsc::unbounded_channel();

    if !config.voice.enabled {
        return Facilities {
            recognizer: Box::new(Unsupported),
            recognition_events,
            sink: Box::new(Silent::new(playback_tx)),
            playback_events,
        };
    }

    let recognizer: Box<dyn Recognizer> = match config.transcriber() {
        Ok(stt) => Box::new(MicRecognizer::new(Arc::new(stt), recognition_tx)),
        Err(e) => {
            tracing::warn!(error = %e, "speech recognition unavailable");
            Box::new(Unsupported)
        }
    };

    Facilities {
        recognizer,
        recognition_events,
        sink: Box::new(Speaker::new(playback_tx)),
        playback_events,
    }
}

/// A parsed line of console input
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Message(String),
    ToggleAuto,
    /// Replay the reply at this 1-based message number, or the last one
    Play(Option<usize>),
    Pause,
    Reset,
    Status,
    History,
    Help,
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line.to_string());
    };

    let mut parts = command.split_whitespace();
    match (parts.next().unwrap_or_default(), parts.next()) {
        ("auto", None) => Input::ToggleAuto,
        ("play", None) => Input::Play(None),
        ("play", Some(n)) => n
            .parse()
            .map_or_else(|_| Input::Unknown(line.to_string()), |n| Input::Play(Some(n))),
        ("pause", None) => Input::Pause,
        ("reset", None) => Input::Reset,
        ("status", None) => Input::Status,
        ("history", None) => Input::History,
        ("help", None) => Input::Help,
        ("quit" | "exit", None) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

const HELP: &str = "\
Commands:
  /auto        toggle hands-free mode
  /play [n]    replay message n, or the last reply
  /pause       stop playback
  /reset       start a fresh conversation
  /status      show what I'm doing
  /history     show the conversation
  /quit        leave
Anything else is sent as a message (ignored while hands-free mode is on).";

/// Read stdin until `/quit`, EOF or Ctrl-C
async fn console(handle: &CoordinatorHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match parse_input(&line) {
            Input::Message(text) => {
                handle.submit(text);
            }
            Input::ToggleAuto => {
                handle.toggle_auto_mode();
            }
            Input::Play(None) => {
                handle.play(None);
            }
            Input::Play(Some(n)) => {
                let audio_ref = handle.session().read(|s| {
                    s.transcript()
                        .messages()
                        .get(n.wrapping_sub(1))
                        .and_then(|m| m.audio_ref().map(str::to_string))
                });
                match audio_ref {
                    Some(audio_ref) => {
                        handle.play(Some(audio_ref));
                    }
                    None => println!("message {n} has no audio"),
                }
            }
            Input::Pause => {
                handle.pause();
            }
            Input::Reset => {
                handle.reset();
            }
            Input::Status => {
                let exchanges = handle.session().read(|s| s.transcript().exchange_count());
                print_status(&handle.session().snapshot(), exchanges);
            }
            Input::History => print_history(&handle.session().snapshot()),
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
            Input::Unknown(line) => println!("unknown command: {line} (try /help)"),
        }
    }

    Ok(())
}

fn print_status(snapshot: &Snapshot, exchanges: usize) {
    println!(
        "{} | {} mode | {exchanges} messages in conversation",
        snapshot.status_line(),
        if snapshot.auto_mode { "auto" } else { "manual" },
    );
}

fn print_history(snapshot: &Snapshot) {
    for (i, message) in snapshot.messages.iter().enumerate() {
        print_message(i + 1, message);
    }
}

fn print_message(number: usize, message: &stress_buddy::DisplayMessage) {
    let who = if message.is_user { "you" } else { "buddy" };
    let audio = if message.audio_ref().is_some() { " [audio]" } else { "" };
    println!(
        "[{number}] {} {who}: {}{audio}",
        message.created_at.format("%H:%M"),
        message.text
    );
}

/// What has already been printed
#[derive(Default)]
struct ConsoleView {
    epoch: u64,
    /// Message id -> whether its audio was shown
    shown: HashMap<String, bool>,
    status: String,
}

impl ConsoleView {
    fn render(&mut self, snapshot: &Snapshot) {
        if snapshot.epoch != self.epoch {
            println!("--- new conversation ---");
            self.epoch = snapshot.epoch;
            self.shown.clear();
        }

        for (i, message) in snapshot.messages.iter().enumerate() {
            let has_audio = message.audio_ref().is_some();
            match self.shown.get(&message.id) {
                None => {
                    print_message(i + 1, message);
                    self.shown.insert(message.id.clone(), has_audio);
                }
                Some(false) if has_audio => {
                    println!("    (audio ready, /play {} to hear it again)", i + 1);
                    self.shown.insert(message.id.clone(), true);
                }
                Some(_) => {}
            }
        }

        let status = snapshot.status_line();
        if status != self.status {
            println!("  ~ {status}");
            self.status = status;
        }
        let _ = std::io::stdout().flush();
    }
}

fn spawn_printer(mut updates: watch::Receiver<Snapshot>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut view = ConsoleView::default();
        let initial = updates.borrow_and_update().clone();
        view.render(&initial);

        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            view.render(&snapshot);
        }
    })
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Listening to the microphone for {duration}s, say something.\n");

    let capture = AudioCapture::open()?;
    let (tx, rx) = std::sync::mpsc::channel();
    let _stream = capture.start(tx)?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples: Vec<f32> = rx.try_iter().flatten().collect();
        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    println!("\n---");
    println!("A moving meter means capture works. A flat meter usually means");
    println!("the wrong default source: compare `pactl get-default-source` with");
    println!("the devices listed by `arecord -l`.");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Playing a two second 440Hz tone.\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            0.3 * (std::f32::consts::TAU * frequency * t).sin()
        })
        .collect();

    let mut file = tempfile::Builder::new().suffix(".wav").tempfile()?;
    file.write_all(&samples_to_wav(&samples, sample_rate)?)?;
    let locator = file.path().display().to_string();

    println!("Playing {} samples at {sample_rate} Hz...", samples.len());
    play_locator(&locator).await?;

    println!("\n---");
    println!("Silence usually means the wrong default sink: compare");
    println!("`pactl get-default-sink` with `pactl list sinks short`.");

    Ok(())
}

/// Test TTS output with the configured provider
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    let tts = config.synthesizer()?;
    println!(
        "Synthesizing speech ({:?}, voice {})...",
        tts.provider(),
        config.persona.voice
    );
    let locator = tts
        .synthesize(text, &config.persona.voice)
        .await
        .map_err(|e| anyhow::anyhow!("TTS synthesis failed: {e}"))?;
    println!("Audio at {locator}");

    play_locator(&locator).await?;
    println!("Done.");

    Ok(())
}

/// Load and play one clip to the end
async fn play_locator(locator: &str) -> anyhow::Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut speaker = Speaker::new(tx);
    speaker.load(locator);

    while let Some(event) = events.recv().await {
        match event {
            PlaybackEvent::Ready { .. } => speaker.play()?,
            PlaybackEvent::Ended { .. } => return Ok(()),
            PlaybackEvent::Failed(reason) => anyhow::bail!(reason),
            PlaybackEvent::Played | PlaybackEvent::Paused => {}
        }
    }

    anyhow::bail!("speaker stopped before the clip ended")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("  hello there "), Input::Message("hello there".into()));
        assert_eq!(parse_input("/auto"), Input::ToggleAuto);
        assert_eq!(parse_input("/play"), Input::Play(None));
        assert_eq!(parse_input("/play 4"), Input::Play(Some(4)));
        assert_eq!(parse_input("/quit"), Input::Quit);
        assert!(matches!(parse_input("/play four"), Input::Unknown(_)));
        assert!(matches!(parse_input("/dance"), Input::Unknown(_)));
    }
}
