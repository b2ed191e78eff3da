pub mod bank;
pub mod clock;
pub mod compiler;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod pattern;
pub mod pitch;
pub mod rack;
pub mod renderer;
pub mod routing;
pub mod session;
pub mod voice_manager;

use crate::compiler::{CompileContext, compile_all};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::pattern::{PatternDocument, PatternSettings, Track};
use crate::rack::RackSettings;
use crate::routing::SendMatrix;
use wasm_bindgen::prelude::*;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the loopbrush-core version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// WASM-exposed: frequency of a vertical pad position.
#[wasm_bindgen]
pub fn map_pitch(y: f64, height: f64) -> f64 {
    pitch::map_pitch(y, height)
}

/// WASM-exposed: snap a frequency to a named scale.
#[wasm_bindgen]
pub fn quantize_frequency(freq: f64, scale: &str) -> f64 {
    pitch::quantize(freq, pitch::Scale::from_name(scale))
}

/// Everything a pattern document pins down, starting from defaults.
fn snapshot(json: &str) -> Result<(PatternSettings, RackSettings, SendMatrix, Vec<Track>)> {
    let document = PatternDocument::from_json(json)?;
    let mut rack = RackSettings::default();
    let mut matrix = SendMatrix::new();
    if let Some(fx) = &document.fx {
        fx.apply(&mut rack, &mut matrix);
    }
    let tracks = document.normalized_tracks();
    Ok((document.settings.unwrap_or_default(), rack, matrix, tracks))
}

/// WASM-exposed: compile a pattern document into the voice events of its
/// first loop cycle.
#[wasm_bindgen]
pub fn compile_pattern(json: &str) -> std::result::Result<JsValue, JsValue> {
    let (settings, rack, _, tracks) = snapshot(json).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    let ctx = CompileContext::new(&EngineConfig::default(), &settings, 0.0, rack.chaos());
    let events = compile_all(&tracks, &ctx);
    serde_wasm_bindgen::to_value(&events).map_err(|e| JsValue::from_str(&format!("{e}")))
}

/// WASM-exposed: render one loop of a pattern document to a WAV byte array.
#[wasm_bindgen]
pub fn render_pattern_wav(json: &str, sample_rate: u32) -> std::result::Result<Vec<u8>, JsValue> {
    let (settings, rack, matrix, tracks) = snapshot(json).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    let config = EngineConfig {
        sample_rate: sample_rate as f64,
        ..EngineConfig::default()
    };
    let (left, right) = renderer::render_offline(&config, &tracks, &settings, &rack, &matrix);
    Ok(renderer::encode_wav(&left, &right, sample_rate))
}
