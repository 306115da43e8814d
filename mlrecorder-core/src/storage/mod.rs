pub mod flac_writer;
pub mod metadata;
pub mod naming;
pub mod output_writer;
pub mod wav_writer;
