//! WASM bindings for Patchwork
//!
//! This module provides the JavaScript-facing API for editing a patch graph
//! in the browser, mirrored onto a Web Audio `AudioContext`.

mod editor;
mod error;
mod web_audio;

pub use editor::PatchworkEditor;
pub use error::PatchworkError;
pub use web_audio::WebAudioEngine;

// Re-export wasm_bindgen for convenience
pub use wasm_bindgen::prelude::*;
