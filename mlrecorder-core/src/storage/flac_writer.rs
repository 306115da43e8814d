use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flacenc::component::BitRepr;
use flacenc::error::Verify;

use crate::models::error::CaptureError;
use crate::processing::wav_format::{SampleEncoding, WAV_HEADER_SIZE};

use super::wav_writer::{sha256_file, FinalizedFile, WavSettings, WavWriter};

/// FLAC file writer.
///
/// Samples are streamed into an integer PCM WAV next to the target
/// (`<name>.flac.part.wav`), so a process that dies mid-recording still
/// leaves playable audio. `finalize` encodes that file into the FLAC target
/// and removes it; the encoder holds the whole recording in memory while it
/// runs.
///
/// FLAC stores integers only: the encoding must be 16- or 24-bit PCM.
pub struct FlacWriter {
    path: PathBuf,
    pcm: WavWriter,
}

impl FlacWriter {
    pub fn create(path: &Path, settings: WavSettings) -> Result<Self, CaptureError> {
        if settings.encoding == SampleEncoding::Float32 {
            return Err(CaptureError::FormatNegotiationFailed(
                "FLAC output needs 16- or 24-bit samples".into(),
            ));
        }
        if path.exists() {
            return Err(CaptureError::PathUnwritable(format!("{} already exists", path.display())));
        }
        let pcm = WavWriter::create(&partial_path(path), settings)?;
        log::debug!("Buffering {} in {}", path.display(), pcm.file_path().display());
        Ok(Self {
            path: path.to_path_buf(),
            pcm,
        })
    }

    pub fn write_samples(&mut self, samples: &[f32]) -> Result<(), CaptureError> {
        self.pcm.write_samples(samples)
    }

    /// Encode the buffered PCM into the target and checksum it.
    pub fn finalize(&mut self) -> Result<FinalizedFile, CaptureError> {
        self.pcm.close()?;
        let settings = self.pcm.settings();
        let samples = read_pcm(self.pcm.file_path(), settings.encoding)?;
        let encoded = encode(&samples, settings)?;
        write_new(&self.path, &encoded)?;
        self.pcm.discard();

        let frames = self.pcm.frames_written();
        let checksum = sha256_file(&self.path)?;
        log::debug!(
            "Finalized {} ({} frames, {} bytes encoded from {})",
            self.path.display(),
            frames,
            encoded.len(),
            self.pcm.data_bytes()
        );
        Ok(FinalizedFile {
            path: self.path.clone(),
            frames,
            data_bytes: encoded.len() as u64,
            checksum,
        })
    }

    /// Close without finalizing and delete everything written so far.
    pub fn discard(&mut self) {
        self.pcm.discard();
    }

    pub fn frames_written(&self) -> u64 {
        self.pcm.frames_written()
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part.wav");
    PathBuf::from(name)
}

/// Read the data chunk of a PCM WAV written by [`WavWriter`].
fn read_pcm(path: &Path, encoding: SampleEncoding) -> Result<Vec<i32>, CaptureError> {
    let bytes = fs::read(path).map_err(|e| CaptureError::from_io(&e, "read buffered PCM"))?;
    let data = bytes.get(WAV_HEADER_SIZE..).unwrap_or_default();
    match encoding {
        SampleEncoding::Pcm16 => Ok(data
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as i32)
            .collect()),
        // Shift through the top byte to sign-extend.
        SampleEncoding::Pcm24 => Ok(data
            .chunks_exact(3)
            .map(|b| i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8)
            .collect()),
        SampleEncoding::Float32 => Err(CaptureError::FormatNegotiationFailed(
            "FLAC output needs 16- or 24-bit samples".into(),
        )),
    }
}

fn encode(samples: &[i32], settings: WavSettings) -> Result<Vec<u8>, CaptureError> {
    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|_| CaptureError::ConfigurationFailed("invalid FLAC encoder settings".into()))?;
    let source = flacenc::source::MemSource::from_samples(
        samples,
        settings.format.channels as usize,
        settings.encoding.bit_depth() as usize,
        settings.format.sample_rate as usize,
    );
    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|e| CaptureError::Io(format!("FLAC encoding failed: {:?}", e)))?;

    let mut sink = flacenc::bitsink::ByteSink::new();
    if stream.write(&mut sink).is_err() {
        return Err(CaptureError::Io("FLAC stream could not be serialized".into()));
    }
    Ok(sink.as_slice().to_vec())
}

fn write_new(path: &Path, bytes: &[u8]) -> Result<(), CaptureError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| CaptureError::from_create(&e, &format!("create {}", path.display())))?;
    let written = file.write_all(bytes).and_then(|_| file.sync_all());
    if let Err(e) = written {
        drop(file);
        if let Err(remove) = fs::remove_file(path) {
            if remove.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {}", path.display(), remove);
            }
        }
        return Err(CaptureError::from_io(&e, "write FLAC file"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio_models::AudioFormat;

    fn settings(rate: u32, channels: u16, encoding: SampleEncoding) -> WavSettings {
        WavSettings {
            format: AudioFormat::new(rate, channels),
            encoding,
        }
    }

    fn decode(path: &Path) -> (claxon::metadata::StreamInfo, Vec<i32>) {
        let mut reader = claxon::FlacReader::open(path).unwrap();
        let info = reader.streaminfo();
        let samples = reader.samples().map(|s| s.unwrap()).collect();
        (info, samples)
    }

    #[test]
    fn pcm16_encodes_losslessly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.flac");
        let mut writer = FlacWriter::create(&path, settings(48000, 2, SampleEncoding::Pcm16)).unwrap();

        let samples: Vec<f32> = (0..9600).map(|i| ((i as f32) * 0.01).sin() * 0.5).collect();
        writer.write_samples(&samples[..4800]).unwrap();
        writer.write_samples(&samples[4800..]).unwrap();
        let finalized = writer.finalize().unwrap();

        assert_eq!(finalized.frames, 4800);
        assert_eq!(finalized.checksum, sha256_file(&path).unwrap());
        assert!(!partial_path(&path).exists());

        let (info, decoded) = decode(&path);
        assert_eq!(info.sample_rate, 48000);
        assert_eq!(info.channels, 2);
        assert_eq!(info.bits_per_sample, 16);
        let expected: Vec<i32> = samples
            .iter()
            .map(|s| (s * i16::MAX as f32) as i16 as i32)
            .collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn pcm24_keeps_full_scale_and_sign() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edges.flac");
        let mut writer = FlacWriter::create(&path, settings(16000, 1, SampleEncoding::Pcm24)).unwrap();
        writer.write_samples(&[1.0, 0.0, -1.0, -0.5]).unwrap();
        writer.finalize().unwrap();

        let (info, decoded) = decode(&path);
        assert_eq!(info.bits_per_sample, 24);
        assert_eq!(&decoded[..3], &[8_388_607, 0, -8_388_607]);
        assert!(decoded[3] < 0);
    }

    #[test]
    fn crash_leaves_playable_partial_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crash.flac");
        let mut writer = FlacWriter::create(&path, settings(8000, 1, SampleEncoding::Pcm16)).unwrap();
        writer.write_samples(&vec![0.2; 16000]).unwrap();

        assert!(!path.exists());
        let reader = hound::WavReader::open(partial_path(&path)).unwrap();
        assert_eq!(reader.duration(), 16000);

        writer.discard();
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn float_samples_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.flac");
        let result = FlacWriter::create(&path, settings(48000, 2, SampleEncoding::Float32));
        assert!(matches!(result, Err(CaptureError::FormatNegotiationFailed(_))));
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn existing_target_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.flac");
        fs::write(&path, b"keep me").unwrap();

        let result = FlacWriter::create(&path, settings(48000, 2, SampleEncoding::Pcm16));
        assert!(matches!(result, Err(CaptureError::PathUnwritable(_))));
        assert_eq!(fs::read(&path).unwrap(), b"keep me");
    }
}
