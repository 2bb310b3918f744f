//! Audio playback to speakers
//!
//! [`Speaker`] is the [`AudioSink`] for the console client. Loading fetches,
//! decodes and resamples the whole clip in the background; output runs on a
//! dedicated thread because cpal streams cannot move between threads.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

use super::playback::{AudioSink, PlaybackEvent};
use crate::{Error, Result};

/// Decoded mono audio
#[derive(Debug, Clone)]
pub struct Clip {
    pub samples: Arc<Vec<f32>>,
    pub sample_rate: u32,
}

impl Clip {
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate.max(1)))
    }
}

struct Loaded {
    generation: u64,
    clip: Clip,
}

struct Output {
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
}

/// Plays clips on the default output device
pub struct Speaker {
    events: UnboundedSender<PlaybackEvent>,
    client: reqwest::Client,
    runtime: Handle,
    source: Option<String>,
    generation: Arc<AtomicU64>,
    loaded: Arc<Mutex<Option<Loaded>>>,
    position: Arc<AtomicUsize>,
    output: Option<Output>,
}

impl Speaker {
    /// Must be called from within a tokio runtime
    #[must_use]
    pub fn new(events: UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            events,
            client: reqwest::Client::new(),
            runtime: Handle::current(),
            source: None,
            generation: Arc::new(AtomicU64::new(0)),
            loaded: Arc::new(Mutex::new(None)),
            position: Arc::new(AtomicUsize::new(0)),
            output: None,
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("playback event receiver dropped");
        }
    }

    fn is_playing(&self) -> bool {
        self.output
            .as_ref()
            .is_some_and(|o| !o.done.load(Ordering::SeqCst))
    }

    /// Stop the output thread; returns whether it was playing
    fn halt(&mut self) -> bool {
        let was_playing = self.is_playing();
        if let Some(output) = self.output.take() {
            output.stop.store(true, Ordering::SeqCst);
        }
        was_playing
    }
}

impl AudioSink for Speaker {
    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn is_ready(&self) -> bool {
        let current = self.generation.load(Ordering::SeqCst);
        self.loaded
            .lock()
            .as_ref()
            .is_some_and(|l| l.generation == current)
    }

    fn load(&mut self, locator: &str) {
        self.halt();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.source = Some(locator.to_string());
        self.position.store(0, Ordering::SeqCst);

        let client = self.client.clone();
        let events = self.events.clone();
        let loaded = Arc::clone(&self.loaded);
        let current = Arc::clone(&self.generation);
        let locator = locator.to_string();

        self.runtime.spawn(async move {
            let result = load_clip(&client, &locator).await;
            if current.load(Ordering::SeqCst) != generation {
                tracing::trace!(%locator, "load superseded");
                return;
            }

            let event = match result {
                Ok(clip) => {
                    tracing::debug!(%locator, duration = ?clip.duration(), "clip ready");
                    *loaded.lock() = Some(Loaded { generation, clip });
                    PlaybackEvent::Ready { source: locator }
                }
                Err(e) => PlaybackEvent::Failed(format!("cannot load {locator}: {e}")),
            };
            let _ = events.send(event);
        });
    }

    fn play(&mut self) -> Result<()> {
        if self.is_playing() {
            return Ok(());
        }

        let current = self.generation.load(Ordering::SeqCst);
        let clip = self
            .loaded
            .lock()
            .as_ref()
            .filter(|l| l.generation == current)
            .map(|l| l.clip.clone())
            .ok_or_else(|| Error::Playback("no clip ready".to_string()))?;

        let source = self.source.clone().unwrap_or_default();
        let stop = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let (started_tx, started_rx) = mpsc::channel();

        let worker = OutputWorker {
            clip,
            source,
            position: Arc::clone(&self.position),
            stop: Arc::clone(&stop),
            done: Arc::clone(&done),
            events: self.events.clone(),
        };
        std::thread::Builder::new()
            .name("speaker-output".to_string())
            .spawn(move || worker.run(&started_tx))?;

        started_rx
            .recv()
            .map_err(|_| Error::Playback("output thread exited".to_string()))??;

        self.output = Some(Output { stop, done });
        self.emit(PlaybackEvent::Played);
        Ok(())
    }

    fn pause(&mut self) {
        if self.halt() {
            self.emit(PlaybackEvent::Paused);
        }
    }

    fn rewind(&mut self) {
        self.position.store(0, Ordering::SeqCst);
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        self.halt();
    }
}

struct OutputWorker {
    clip: Clip,
    source: String,
    position: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    events: UnboundedSender<PlaybackEvent>,
}

impl OutputWorker {
    fn run(self, started: &mpsc::Sender<Result<()>>) {
        let (stream, total) = match self.open() {
            Ok(opened) => opened,
            Err(e) => {
                self.done.store(true, Ordering::SeqCst);
                let _ = started.send(Err(e));
                return;
            }
        };
        let _ = started.send(Ok(()));

        let finished = loop {
            if self.stop.load(Ordering::SeqCst) {
                break false;
            }
            if self.position.load(Ordering::SeqCst) >= total {
                // Let the device drain its buffer
                std::thread::sleep(Duration::from_millis(100));
                break true;
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        drop(stream);
        self.done.store(true, Ordering::SeqCst);

        if finished {
            tracing::debug!(samples = total, "playback complete");
            let _ = self.events.send(PlaybackEvent::Ended {
                source: self.source,
            });
        }
    }

    fn open(&self) -> Result<(cpal::Stream, usize)> {
        let (device, config) = output_config(self.clip.sample_rate)?;
        let channels = usize::from(config.channels);

        // Clips are fitted to the device rate at load; only a device that
        // changed in between needs resampling here
        let samples = if config.sample_rate.0 == self.clip.sample_rate {
            Arc::clone(&self.clip.samples)
        } else {
            tracing::debug!(
                from = self.clip.sample_rate,
                to = config.sample_rate.0,
                "output rate changed since load"
            );
            Arc::new(resample(
                &self.clip.samples,
                self.clip.sample_rate,
                config.sample_rate.0,
            )?)
        };
        let total = samples.len();
        let position = Arc::clone(&self.position);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position.load(Ordering::SeqCst);
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(pos).copied().unwrap_or(0.0);
                        frame.fill(sample);
                        if pos < samples.len() {
                            pos += 1;
                        }
                    }
                    position.store(pos, Ordering::SeqCst);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        Ok((stream, total))
    }
}

/// Pick an output config at `sample_rate`, preferring mono then stereo
fn output_config(sample_rate: u32) -> Result<(cpal::Device, StreamConfig)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let at_rate = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.sample_format() == cpal::SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
    };

    let config = match at_rate(1).or_else(|| at_rate(2)) {
        Some(supported) => supported.with_sample_rate(SampleRate(sample_rate)).config(),
        None => device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?
            .config(),
    };

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "audio output selected"
    );

    Ok((device, config))
}

/// Resample a decoded clip to the rate the output device will run at
fn fit_to_output(clip: Clip) -> Result<Clip> {
    let rate = match output_config(clip.sample_rate) {
        Ok((_, config)) => config.sample_rate.0,
        Err(e) => {
            tracing::debug!(error = %e, "no output device, keeping clip rate");
            return Ok(clip);
        }
    };
    refit(clip, rate)
}

fn refit(clip: Clip, rate: u32) -> Result<Clip> {
    if rate == clip.sample_rate {
        return Ok(clip);
    }

    let samples = resample(&clip.samples, clip.sample_rate, rate)?;
    Ok(Clip {
        samples: Arc::new(samples),
        sample_rate: rate,
    })
}

/// Resample a mono clip with rubato
///
/// The tail is zero-padded and flushed through the resampler so the output
/// covers the whole clip.
///
/// # Errors
///
/// Returns error if the resampler rejects the rates
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from == to || samples.is_empty() || from == 0 {
        return Ok(samples.to_vec());
    }

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, 1024, 2, 1)
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;
    // The requested chunk is rounded to fit the rate ratio
    let chunk_size = resampler.input_frames_next();

    let expected = (samples.len() as f64 * f64::from(to) / f64::from(from)).round() as usize;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay);
    let mut chunk = vec![0.0f32; chunk_size];
    for block in samples.chunks(chunk_size).chain(std::iter::once(&[][..])) {
        chunk.fill(0.0);
        chunk[..block.len()].copy_from_slice(block);
        let result = resampler
            .process(&[chunk.as_slice()], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output.into_iter().skip(delay).take(expected).collect())
}

/// Fetch and decode the clip behind a locator
async fn load_clip(client: &reqwest::Client, locator: &str) -> Result<Clip> {
    let bytes = fetch(client, locator).await?;
    tokio::task::spawn_blocking(move || decode(&bytes).and_then(fit_to_output))
        .await
        .map_err(|e| Error::Playback(e.to_string()))?
}

/// Read audio bytes from an http(s) URL, a `file://` URL or a plain path
async fn fetch(client: &reqwest::Client, locator: &str) -> Result<Vec<u8>> {
    let path = if locator.contains("://") {
        let url = url::Url::parse(locator)?;
        match url.scheme() {
            "http" | "https" => {
                let response = client.get(url).send().await?.error_for_status()?;
                return Ok(response.bytes().await?.to_vec());
            }
            "file" => url
                .to_file_path()
                .map_err(|()| Error::Playback(format!("bad file URL {locator}")))?,
            other => {
                return Err(Error::Playback(format!("unsupported scheme {other}")));
            }
        }
    } else {
        PathBuf::from(locator)
    };

    Ok(tokio::fs::read(path).await?)
}

/// Decode WAV or MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the bytes are neither valid WAV nor MP3
pub fn decode(bytes: &[u8]) -> Result<Clip> {
    if bytes.starts_with(b"RIFF") {
        decode_wav(bytes)
    } else {
        decode_mp3(bytes)
    }
}

#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<Clip> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?
        }
    };

    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(Clip {
        samples: Arc::new(samples),
        sample_rate: spec.sample_rate,
    })
}

#[allow(clippy::cast_sign_loss)]
fn decode_mp3(bytes: &[u8]) -> Result<Clip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = frame.sample_rate as u32;
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() {
        return Err(Error::Audio("no audio frames decoded".to_string()));
    }

    Ok(Clip {
        samples: Arc::new(samples),
        sample_rate,
    })
}
