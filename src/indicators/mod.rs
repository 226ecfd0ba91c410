// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the technical indicators the
// Market-Data Assembler feeds to the model. Every public function returns
// `Option`/empty-`Vec` so callers are forced to handle insufficient-data and
// numerical-edge-case scenarios.

pub mod atr;
pub mod ema;
pub mod macd;
pub mod rsi;
