//! WAV input and output.
//!
//! Only 8000 Hz mono 16-bit PCM files are accepted; anything else is
//! rejected before any device traffic happens. Loaded frames are converted
//! to the chip's big-endian wire order, saved frames back to host order.

use std::path::Path;

use ambe_proto::{swap_samples, AudioFrame, FRAME_SAMPLES, SAMPLE_RATE};
use anyhow::{ensure, Context, Result};

/// Load an audio file as wire-order frames, zero-padding the last frame.
pub fn load(path: &Path) -> Result<Vec<AudioFrame>> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let spec = reader.spec();

    ensure!(
        spec.sample_rate == SAMPLE_RATE,
        "invalid sample rate, expected {SAMPLE_RATE}, got {}",
        spec.sample_rate
    );
    ensure!(
        spec.channels == 1,
        "invalid number of channels, expected 1, got {}",
        spec.channels
    );
    ensure!(
        spec.bits_per_sample == 16 && spec.sample_format == hound::SampleFormat::Int,
        "only 16-bit PCM samples are supported"
    );

    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<Result<_, _>>()
        .with_context(|| format!("error while reading {}", path.display()))?;

    let mut frames = Vec::with_capacity(samples.len().div_ceil(FRAME_SAMPLES));
    for chunk in samples.chunks(FRAME_SAMPLES) {
        let mut frame: AudioFrame = [0; FRAME_SAMPLES];
        frame[..chunk.len()].copy_from_slice(chunk);
        let mut wire = [0i16; FRAME_SAMPLES];
        swap_samples(&mut wire, &frame);
        frames.push(wire);
    }
    Ok(frames)
}

/// Save wire-order frames to an audio file.
pub fn save(path: &Path, frames: &[AudioFrame]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("cannot create {}", path.display()))?;

    let mut host = [0i16; FRAME_SAMPLES];
    for frame in frames {
        swap_samples(&mut host, frame);
        for sample in host {
            writer.write_sample(sample)?;
        }
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");

        let mut frame: AudioFrame = [0; FRAME_SAMPLES];
        for (i, sample) in frame.iter_mut().enumerate() {
            *sample = (i as i16).swap_bytes();
        }

        save(&path, &[frame, frame]).unwrap();
        let frames = load(&path).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frame);
    }

    #[test]
    fn wrong_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cd.wav");

        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        assert!(load(&path).is_err());
    }
}
