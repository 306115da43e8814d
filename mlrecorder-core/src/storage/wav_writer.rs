use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::models::audio_models::{AudioFormat, AudioFrame};
use crate::models::error::CaptureError;
use crate::processing::wav_format::{self, SampleEncoding, WAV_HEADER_SIZE};

/// Output layout of a [`WavWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSettings {
    pub format: AudioFormat,
    pub encoding: SampleEncoding,
}

impl WavSettings {
    pub fn block_align(&self) -> u64 {
        self.format.channels as u64 * self.encoding.bytes_per_sample() as u64
    }
}

/// What `finalize` produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedFile {
    pub path: PathBuf,
    pub frames: u64,
    pub data_bytes: u64,
    pub checksum: String,
}

/// Streaming WAV file writer.
///
/// ## File Format
///
/// ```text
/// [44-byte WAV header]
/// [PCM16 / PCM24 / float32 data...]
/// ```
///
/// The header's size fields are rewritten roughly once per second of audio,
/// so a process that dies mid-recording still leaves a playable file.
/// `finalize` may be called once; every call after it fails with
/// `WriterClosed`.
pub struct WavWriter {
    path: PathBuf,
    settings: WavSettings,
    file: Option<BufWriter<File>>,
    header: [u8; WAV_HEADER_SIZE],
    data_bytes: u64,
    bytes_since_refresh: u64,
    refresh_interval: u64,
    scratch: Vec<u8>,
}

impl WavWriter {
    /// Create the file and write the initial header.
    ///
    /// Fails with `PathUnwritable` if the directory cannot be created or the
    /// file already exists, `DiskFull` if the volume is out of space.
    pub fn create(path: &Path, settings: WavSettings) -> Result<Self, CaptureError> {
        if settings.format.channels == 0 || settings.format.sample_rate == 0 {
            return Err(CaptureError::FormatNegotiationFailed(format!(
                "cannot write {} Hz / {} channels",
                settings.format.sample_rate, settings.format.channels
            )));
        }

        // Ensure output directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CaptureError::from_create(&e, &format!("create {}", parent.display())))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| CaptureError::from_create(&e, &format!("create {}", path.display())))?;

        let header = wav_format::generate_wav_header(
            settings.encoding,
            settings.format.sample_rate,
            settings.format.channels,
            0, // data size placeholder, patched as the file grows
        );

        let mut file = BufWriter::new(file);
        let written = file.write_all(&header).and_then(|_| file.flush());
        if let Err(e) = written {
            drop(file);
            let _ = fs::remove_file(path);
            return Err(CaptureError::from_io(&e, "write WAV header"));
        }

        let refresh_interval = settings.format.sample_rate as u64 * settings.block_align();
        log::debug!(
            "Opened {} ({} Hz, {} ch, {}-bit)",
            path.display(),
            settings.format.sample_rate,
            settings.format.channels,
            settings.encoding.bit_depth()
        );

        Ok(Self {
            path: path.to_path_buf(),
            settings,
            file: Some(file),
            header,
            data_bytes: 0,
            bytes_since_refresh: 0,
            refresh_interval,
            scratch: Vec::new(),
        })
    }

    /// Append one frame. Its format must match the writer's.
    pub fn write(&mut self, frame: &AudioFrame) -> Result<(), CaptureError> {
        if frame.format() != self.settings.format {
            return Err(CaptureError::Io(format!(
                "frame format {:?} does not match writer format {:?}",
                frame.format(),
                self.settings.format
            )));
        }
        self.write_samples(frame.samples())
    }

    /// Append interleaved samples in the writer's format.
    pub fn write_samples(&mut self, samples: &[f32]) -> Result<(), CaptureError> {
        let file = self.file.as_mut().ok_or(CaptureError::WriterClosed)?;
        if samples.is_empty() {
            return Ok(());
        }

        self.scratch.clear();
        self.settings.encoding.encode_into(samples, &mut self.scratch);
        file.write_all(&self.scratch)
            .map_err(|e| CaptureError::from_io(&e, "write audio data"))?;

        let written = self.scratch.len() as u64;
        self.data_bytes += written;
        self.bytes_since_refresh += written;
        if self.bytes_since_refresh >= self.refresh_interval {
            self.refresh_header()?;
        }
        Ok(())
    }

    /// Patch the sizes, flush, close the handle and checksum the file.
    pub fn finalize(&mut self) -> Result<FinalizedFile, CaptureError> {
        self.close()?;
        let checksum = sha256_file(&self.path)?;
        let frames = self.frames_written();
        log::debug!(
            "Finalized {} ({} frames, {} data bytes)",
            self.path.display(),
            frames,
            self.data_bytes
        );

        Ok(FinalizedFile {
            path: self.path.clone(),
            frames,
            data_bytes: self.data_bytes,
            checksum,
        })
    }

    /// Patch the sizes, flush and close the handle, leaving a complete file.
    pub fn close(&mut self) -> Result<(), CaptureError> {
        let mut file = self.file.take().ok_or(CaptureError::WriterClosed)?;

        wav_format::patch_sizes(&mut self.header, self.data_bytes);
        write_header_at_start(&mut file, &self.header)
            .map_err(|e| CaptureError::from_io(&e, "finalize WAV header"))?;

        let file = file
            .into_inner()
            .map_err(|e| CaptureError::from_io(e.error(), "flush WAV data"))?;
        file.sync_all()
            .map_err(|e| CaptureError::from_io(&e, "sync WAV file"))
    }

    /// Close without finalizing and delete the file.
    pub fn discard(&mut self) {
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn frames_written(&self) -> u64 {
        self.data_bytes / self.settings.block_align()
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn settings(&self) -> WavSettings {
        self.settings
    }

    /// Path of the output file.
    pub fn file_path(&self) -> &Path {
        &self.path
    }

    fn refresh_header(&mut self) -> Result<(), CaptureError> {
        let file = self.file.as_mut().ok_or(CaptureError::WriterClosed)?;
        wav_format::patch_sizes(&mut self.header, self.data_bytes);
        write_header_at_start(file, &self.header)
            .and_then(|_| file.seek(SeekFrom::End(0)).map(|_| ()))
            .map_err(|e| CaptureError::from_io(&e, "refresh WAV header"))?;
        self.bytes_since_refresh = 0;
        Ok(())
    }
}

impl Drop for WavWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            log::warn!("{} dropped without finalize", self.path.display());
            if let Err(e) = self.refresh_header() {
                log::warn!("Could not patch header of {}: {}", self.path.display(), e);
            }
        }
    }
}

fn write_header_at_start(file: &mut BufWriter<File>, header: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(header)?;
    file.flush()
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file(path: &Path) -> Result<String, CaptureError> {
    let mut file = File::open(path).map_err(|e| CaptureError::from_io(&e, "open file for checksum"))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| CaptureError::from_io(&e, "read file for checksum"))?;
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
