//! Configuration for recurrent layers.

use ember_core::ops::RnnFlags;
use ember_core::{EmberError, Result};
use serde::{Deserialize, Serialize};

/// Options shared by [`crate::Lstm`] and [`crate::Gru`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RnnConfig {
    pub has_biases: bool,
    pub num_layers: usize,
    /// Dropout between stacked layers, applied only when `train` is set.
    pub dropout: f64,
    pub train: bool,
    pub bidirectional: bool,
    /// Inputs and outputs are `[batch, seq, feature]` instead of `[seq, batch, feature]`.
    pub batch_first: bool,
}

impl Default for RnnConfig {
    fn default() -> Self {
        Self {
            has_biases: true,
            num_layers: 1,
            dropout: 0.0,
            train: true,
            bidirectional: false,
            batch_first: true,
        }
    }
}

impl RnnConfig {
    pub fn directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// First dimension of every state tensor: layers × directions.
    pub fn state_layers(&self) -> usize {
        self.num_layers * self.directions()
    }

    /// Axis of the batch dimension in sequence inputs.
    pub fn batch_axis(&self) -> i64 {
        if self.batch_first {
            0
        } else {
            1
        }
    }

    /// Axis of the time dimension in sequence inputs.
    pub fn seq_axis(&self) -> i64 {
        1 - self.batch_axis()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(EmberError::InvalidArgument("num_layers must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(EmberError::InvalidArgument(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    pub(crate) fn flags(&self) -> Result<RnnFlags> {
        let num_layers = i64::try_from(self.num_layers)
            .map_err(|_| EmberError::InvalidArgument(format!("num_layers {} out of range", self.num_layers)))?;
        Ok(RnnFlags {
            has_biases: self.has_biases,
            num_layers,
            dropout: self.dropout,
            train: self.train,
            bidirectional: self.bidirectional,
            batch_first: self.batch_first,
        })
    }
}
