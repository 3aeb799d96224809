//! Web Audio backend
//!
//! Implements [`AudioEngine`] over a JavaScript `AudioContext` by calling its
//! factory methods (`createOscillator`, `createGain`, ...) reflectively.

use crate::engine::{AudioEngine, ConnectTarget, EngineError, NodeHandle};
use crate::port::{AttributeValue, PortIndex};
use js_sys::{Array, Function, Reflect};
use serde_json::Value;
use std::collections::HashMap;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;

fn js_error(e: JsValue) -> EngineError {
    EngineError::Backend(e.as_string().unwrap_or_else(|| format!("{:?}", e)))
}

/// Audio engine backed by a browser `AudioContext`
pub struct WebAudioEngine {
    context: JsValue,
    nodes: HashMap<NodeHandle, JsValue>,
    next_handle: u64,
}

impl WebAudioEngine {
    pub fn new(context: JsValue) -> Self {
        Self {
            context,
            nodes: HashMap::new(),
            next_handle: 0,
        }
    }

    pub fn context(&self) -> &JsValue {
        &self.context
    }

    fn node(&self, node: NodeHandle) -> Result<&JsValue, EngineError> {
        self.nodes.get(&node).ok_or(EngineError::UnknownNode(node))
    }

    fn call(target: &JsValue, method: &str, args: &Array) -> Result<JsValue, EngineError> {
        let function: Function = Reflect::get(target, &JsValue::from_str(method))
            .map_err(js_error)?
            .dyn_into()
            .map_err(|_| EngineError::UnsupportedType(method.to_string()))?;
        function.apply(target, args).map_err(js_error)
    }

    /// The `AudioParam` behind `param`, if the property is one
    fn audio_param(node: &JsValue, param: &str) -> Option<JsValue> {
        let value = Reflect::get(node, &JsValue::from_str(param)).ok()?;
        let is_param =
            value.is_object() && Reflect::has(&value, &JsValue::from_str("value")).unwrap_or(false);
        is_param.then_some(value)
    }
}

impl AudioEngine for WebAudioEngine {
    fn create_node(
        &mut self,
        constructor: &str,
        args: &[Value],
    ) -> Result<NodeHandle, EngineError> {
        let known = Reflect::has(&self.context, &JsValue::from_str(constructor)).unwrap_or(false);
        if !known {
            return Err(EngineError::UnsupportedType(constructor.to_string()));
        }

        let js_args = Array::new();
        for arg in args {
            let value = serde_wasm_bindgen::to_value(arg)
                .map_err(|e| EngineError::Backend(e.to_string()))?;
            js_args.push(&value);
        }
        let created = Self::call(&self.context, constructor, &js_args)?;

        self.next_handle += 1;
        let node = NodeHandle::new(self.next_handle);
        self.nodes.insert(node, created);
        Ok(node)
    }

    fn start(&mut self, node: NodeHandle) -> Result<(), EngineError> {
        Self::call(self.node(node)?, "start", &Array::new())?;
        Ok(())
    }

    fn set_param(
        &mut self,
        node: NodeHandle,
        param: &str,
        value: &AttributeValue,
    ) -> Result<(), EngineError> {
        let target = self.node(node)?;
        let js_value = match value {
            AttributeValue::Number(n) => JsValue::from_f64(*n),
            AttributeValue::Text(s) => JsValue::from_str(s),
        };

        match Self::audio_param(target, param) {
            Some(audio_param) => Reflect::set(&audio_param, &JsValue::from_str("value"), &js_value),
            None => Reflect::set(target, &JsValue::from_str(param), &js_value),
        }
        .map_err(js_error)?;
        Ok(())
    }

    fn get_param(&self, node: NodeHandle, param: &str) -> Option<AttributeValue> {
        let target = self.nodes.get(&node)?;
        let value = match Self::audio_param(target, param) {
            Some(audio_param) => Reflect::get(&audio_param, &JsValue::from_str("value")).ok()?,
            None => Reflect::get(target, &JsValue::from_str(param)).ok()?,
        };
        value
            .as_f64()
            .map(AttributeValue::Number)
            .or_else(|| value.as_string().map(AttributeValue::Text))
    }

    fn connect(
        &mut self,
        node: NodeHandle,
        output: PortIndex,
        target: &ConnectTarget,
    ) -> Result<(), EngineError> {
        let source = self.node(node)?;
        let output = JsValue::from_f64(f64::from(output));
        let args = match target {
            ConnectTarget::Input { node, input } => {
                Array::of3(self.node(*node)?, &output, &JsValue::from_f64(f64::from(*input)))
            }
            ConnectTarget::Param { node, param } => {
                let audio_param =
                    Self::audio_param(self.node(*node)?, param).ok_or_else(|| {
                        EngineError::Backend(format!("{} is not an AudioParam", param))
                    })?;
                Array::of2(&audio_param, &output)
            }
            ConnectTarget::Destination => {
                let destination = Reflect::get(&self.context, &JsValue::from_str("destination"))
                    .map_err(js_error)?;
                Array::of2(&destination, &output)
            }
        };
        Self::call(source, "connect", &args)?;
        Ok(())
    }

    fn disconnect(&mut self, node: NodeHandle, output: PortIndex) -> Result<(), EngineError> {
        let args = Array::of1(&JsValue::from_f64(f64::from(output)));
        Self::call(self.node(node)?, "disconnect", &args)?;
        Ok(())
    }

    fn release(&mut self, node: NodeHandle) -> Result<(), EngineError> {
        let released = self.nodes.remove(&node).ok_or(EngineError::UnknownNode(node))?;
        Self::call(&released, "disconnect", &Array::new())?;
        Ok(())
    }
}
