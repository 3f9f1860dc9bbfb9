//! Trading decision logic
//!
//! - Signal combinator: five layers folded into one decision under unanimity rules
//! - FUD-attack override: three-state machine that can preempt the combinator
//! - Order gate: AI validation of new opens with a rejection cooldown

pub mod combinator;
pub mod fud_mode;
pub mod order_gate;

pub use combinator::{
    activity_signal, combine, fud_activity_signal, sentiment_signal, DecisionKey, Layer,
    LayerSignals, LayerVerdict, TradingDecision,
};
pub use fud_mode::{step as step_fud_mode, FudAction, FudMode, FudStep};
pub use order_gate::{GateVerdict, OrderGate, Rejection};
