pub mod audio_output;
pub mod client;
pub mod compositor;
pub mod console_display;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod json_library;
pub mod keyboard;
pub mod library;
pub mod protocol;
pub mod state_buffer;
pub mod surface;
pub mod timeline;
pub mod types;
pub mod wav_export;
pub mod worker;
