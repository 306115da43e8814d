pub mod frame_ring;
pub mod ring_buffer;
pub mod stream_mixer;
pub mod wav_format;
