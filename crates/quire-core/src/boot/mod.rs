pub mod sequencer;

pub use sequencer::{AppPhase, BOOT_TOPIC, BootEvent, BootSequencer};
