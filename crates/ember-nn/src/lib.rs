//! # ember-nn
//!
//! Recurrent layers over the fused libtorch kernels.

pub mod config;
pub mod gru;
pub mod lstm;
pub mod rnn;
pub mod state;

pub use config::RnnConfig;
pub use gru::Gru;
pub use lstm::Lstm;
pub use rnn::{Rnn, Step};
pub use state::RecurrentState;
