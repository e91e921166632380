//! Core emulator primitives and traits.

pub mod cpu_z80;

use serde_json::Value;

/// A CPU-like component that can be stepped; returns cycles consumed.
pub trait Cpu {
    fn reset(&mut self);
    fn step(&mut self) -> u32;
}

/// A high-level System trait tying components together.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Emulate one full video frame.
    fn step_frame(&mut self) -> Result<(), Self::Error>;

    /// Return a JSON-serializable save state.
    /// Note: Save states should NOT include ROM/cartridge data.
    /// Only save emulator state (CPU, RAM, video state, etc.)
    fn save_state(&self) -> Value;

    /// Load a JSON save state.
    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error>;

    /// Check if this system supports save/load state functionality
    fn supports_save_states(&self) -> bool {
        false // Default: no save state support
    }
}
