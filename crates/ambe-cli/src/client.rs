//! Compression / decompression workloads driven from the command line.
//!
//! Synchronous mode round-trips one frame at a time per channel, which
//! measures latency. Concurrent mode keeps a pipeline of outstanding
//! requests per direction and channel, which measures throughput: with the
//! multi-queue scheduler behind the API, every DSP stage of the chip stays
//! busy.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use ambe_driver::{Api, Response};
use ambe_proto::{AmbeFrame, AudioFrame, Rate, FRAME_SAMPLES};
use anyhow::{anyhow, ensure, Result};
use tracing::info;

use crate::wav;

/// What to run and where the audio lives.
pub struct Options {
    /// Channels to use simultaneously; 0 means all available.
    pub channels: usize,
    /// Concurrent (pipelined) mode instead of synchronous.
    pub concurrent: bool,
    /// Outstanding requests per direction in concurrent mode.
    pub pipeline: usize,
    /// Vocoder rate for every channel.
    pub rate: Rate,
    /// Input audio file.
    pub input: PathBuf,
    /// Output audio file; decoded audio is discarded when absent.
    pub output: Option<PathBuf>,
}

/// Configure the device and run the selected workload.
///
/// `chip_channels` lists the chip channels this client may use: all of
/// them for a directly attached dongle, the single assigned channel when
/// going through a gateway.
pub fn run(api: &Api, chip_channels: &[u8], options: &Options) -> Result<()> {
    info!("device: {} ({})", api.prodid()?, api.verstring()?);
    info!("rate: {}", options.rate);

    for &channel in chip_channels {
        api.rate(channel, &options.rate)?;
        api.init(channel, true, true)?;
    }

    let active = if options.channels == 0 || options.channels >= chip_channels.len() {
        chip_channels
    } else {
        &chip_channels[..options.channels]
    };
    info!("using {} channel(s)", active.len());

    let input = wav::load(&options.input)?;
    info!("loaded {} frames from {}", input.len(), options.input.display());

    let collect = options.output.is_some();
    let outputs = if options.concurrent {
        info!("concurrent mode, pipeline depth {}", options.pipeline);
        concurrent_mode(api, active, &input, options.pipeline, collect)?
    } else {
        info!("synchronous mode");
        synchronous_mode(api, active, &input, collect)?
    };

    if let Some(base) = &options.output {
        for (index, frames) in outputs.iter().enumerate() {
            let path = if outputs.len() > 1 {
                numbered(base, index)
            } else {
                base.clone()
            };
            info!("writing {} frames to {}", frames.len(), path.display());
            wav::save(&path, frames)?;
        }
    } else {
        info!("discarding audio data (no output file configured)");
    }
    Ok(())
}

/// One worker per channel, one frame in flight each.
fn synchronous_mode(
    api: &Api,
    channels: &[u8],
    input: &[AudioFrame],
    collect: bool,
) -> Result<Vec<Vec<AudioFrame>>> {
    thread::scope(|scope| {
        let workers: Vec<_> = channels
            .iter()
            .map(|&channel| scope.spawn(move || compress_decompress(api, channel, input, collect)))
            .collect();

        let mut outputs = Vec::new();
        for (worker, &channel) in workers.into_iter().zip(channels) {
            let (frames, elapsed) = worker
                .join()
                .map_err(|_| anyhow!("channel {channel} worker panicked"))??;
            info!("channel {channel}: {:.3}s", elapsed.as_secs_f64());
            outputs.push(frames);
        }
        Ok(outputs)
    })
}

/// Pre-compress the input once, then run a pipelined compressor and
/// decompressor per channel so both chip stages work at the same time.
fn concurrent_mode(
    api: &Api,
    channels: &[u8],
    input: &[AudioFrame],
    depth: usize,
    collect: bool,
) -> Result<Vec<Vec<AudioFrame>>> {
    let mut bits = Vec::with_capacity(input.len() + 1);
    let elapsed = compress_stream(api, channels[0], input, depth, &mut |frame| bits.push(frame))?;
    info!(
        "pre-compressed {} frames in {:.3}s",
        input.len(),
        elapsed.as_secs_f64()
    );

    thread::scope(|scope| {
        let bits = &bits;
        let workers: Vec<_> = channels
            .iter()
            .map(|&channel| {
                let enc =
                    scope.spawn(move || compress_stream(api, channel, input, depth, &mut |_| {}));
                let dec = scope.spawn(move || decompress_stream(api, channel, bits, depth, collect));
                (channel, enc, dec)
            })
            .collect();

        let mut outputs = Vec::new();
        for (channel, enc, dec) in workers {
            let enc_time = enc
                .join()
                .map_err(|_| anyhow!("channel {channel} compressor panicked"))??;
            let (frames, dec_time) = dec
                .join()
                .map_err(|_| anyhow!("channel {channel} decompressor panicked"))??;
            info!(
                "channel {channel}: compress {:.3}s, decompress {:.3}s",
                enc_time.as_secs_f64(),
                dec_time.as_secs_f64()
            );
            outputs.push(frames);
        }
        Ok(outputs)
    })
}

fn compress_decompress(
    api: &Api,
    channel: u8,
    input: &[AudioFrame],
    collect: bool,
) -> Result<(Vec<AudioFrame>, Duration)> {
    let start = std::time::Instant::now();
    let mut output = Vec::new();

    for frame in input {
        let response = api.compress(channel, frame)?.wait()?;
        let (data, count) = response.bits()?;
        let data = data.to_vec();

        let response = api.decompress(channel, &data, count)?.wait()?;
        if collect {
            output.push(audio_frame(&response.samples()?)?);
        }
    }
    Ok((output, start.elapsed()))
}

/// Keep up to `depth` compressions in flight, feeding each result to
/// `sink`; a terminator frame marks the end of the stream.
fn compress_stream(
    api: &Api,
    channel: u8,
    input: &[AudioFrame],
    depth: usize,
    sink: &mut dyn FnMut(AmbeFrame),
) -> Result<Duration> {
    let start = std::time::Instant::now();
    let mut pipeline: VecDeque<Response> = VecDeque::new();

    for frame in input {
        if pipeline.len() == depth {
            if let Some(response) = pipeline.pop_front() {
                let response = response.wait()?;
                let (data, count) = response.bits()?;
                sink(AmbeFrame::new(data, count));
            }
        }
        pipeline.push_back(api.compress(channel, frame)?);
    }

    while let Some(response) = pipeline.pop_front() {
        let response = response.wait()?;
        let (data, count) = response.bits()?;
        sink(AmbeFrame::new(data, count));
    }

    let elapsed = start.elapsed();
    sink(AmbeFrame::default());
    Ok(elapsed)
}

/// Pipelined decompression of a pre-compressed bit stream.
fn decompress_stream(
    api: &Api,
    channel: u8,
    bits: &[AmbeFrame],
    depth: usize,
    collect: bool,
) -> Result<(Vec<AudioFrame>, Duration)> {
    let start = std::time::Instant::now();
    let mut pipeline: VecDeque<Response> = VecDeque::new();
    let mut output = Vec::new();

    let mut resolve = |pipeline: &mut VecDeque<Response>, output: &mut Vec<AudioFrame>| {
        if let Some(response) = pipeline.pop_front() {
            let response = response.wait()?;
            if collect {
                output.push(audio_frame(&response.samples()?)?);
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    for frame in bits {
        if frame.is_terminator() {
            break;
        }
        if pipeline.len() == depth {
            resolve(&mut pipeline, &mut output)?;
        }
        pipeline.push_back(api.decompress(channel, frame.data(), frame.bits())?);
    }
    while !pipeline.is_empty() {
        resolve(&mut pipeline, &mut output)?;
    }

    Ok((output, start.elapsed()))
}

fn audio_frame(samples: &[i16]) -> Result<AudioFrame> {
    ensure!(
        samples.len() == FRAME_SAMPLES,
        "expected {FRAME_SAMPLES} samples from the chip, got {}",
        samples.len()
    );
    let mut frame = [0i16; FRAME_SAMPLES];
    frame.copy_from_slice(samples);
    Ok(frame)
}

/// `out.wav` → `out.0.wav` when writing one file per channel.
fn numbered(path: &Path, index: usize) -> PathBuf {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => path.with_extension(format!("{index}.{ext}")),
        None => {
            let mut raw = path.as_os_str().to_owned();
            raw.push(format!(".{index}"));
            PathBuf::from(raw)
        }
    }
}
