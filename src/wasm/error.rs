//! Error types for WASM bindings

use crate::engine::EngineError;
use crate::graph::PatchError;
use wasm_bindgen::prelude::*;

/// Error type for WASM bindings
#[wasm_bindgen]
pub struct PatchworkError {
    message: String,
}

#[wasm_bindgen]
impl PatchworkError {
    /// Get the error message
    #[wasm_bindgen(getter)]
    pub fn message(&self) -> String {
        self.message.clone()
    }
}

impl From<PatchError> for PatchworkError {
    fn from(e: PatchError) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

impl From<EngineError> for PatchworkError {
    fn from(e: EngineError) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

impl From<serde_wasm_bindgen::Error> for PatchworkError {
    fn from(e: serde_wasm_bindgen::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

impl From<String> for PatchworkError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for PatchworkError {
    fn from(message: &str) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl PatchworkError {
    /// Convert to JsValue for use as error return
    pub fn into_js(self) -> JsValue {
        JsValue::from_str(&self.message)
    }
}

/// Map any convertible error straight to a `JsValue`
pub(crate) fn js_err(e: impl Into<PatchworkError>) -> JsValue {
    let error: PatchworkError = e.into();
    error.into_js()
}
