//! audio - Capture, playback, PCM codec and playback scheduling
//!
//! Device I/O runs on dedicated OS threads (ALSA); everything the session
//! touches per event (codec, capture loop, scheduler) is plain
//! single-threaded code.

mod alsa_device;
pub mod capture_loop;
pub mod device;
pub mod pcm_codec;
mod play;
mod record;
pub mod scheduler;

pub use capture_loop::CaptureLoop;
pub use device::{
    AlsaDevices, AudioDevices, InputStream, OutputDevice, ScheduledVoice, VoiceId,
};
pub use pcm_codec::{AudioFrame, DecodedBuffer, PcmDecoder, PcmEncoder, WireChunk};
pub use play::AlsaOutput;
pub use record::AlsaInput;
pub use scheduler::PlaybackScheduler;
