use ember_core::{EmberError, Result, Tensor};

/// Recurrent memory carried between steps.
///
/// Every tensor has shape `[layers × directions, batch, hidden]`; for
/// [`RecurrentState::Dual`] the two tensors share that shape. The state owns
/// its tensors and releases them when dropped.
#[derive(Debug)]
pub enum RecurrentState {
    /// One memory tensor (GRU).
    Single(Tensor),
    /// Split hidden/cell memory (LSTM).
    Dual { hidden: Tensor, cell: Tensor },
}

impl RecurrentState {
    pub fn tag(&self) -> &'static str {
        match self {
            RecurrentState::Single(_) => "single",
            RecurrentState::Dual { .. } => "dual",
        }
    }

    /// The hidden tensor, present in both variants.
    pub fn hidden(&self) -> &Tensor {
        match self {
            RecurrentState::Single(h) => h,
            RecurrentState::Dual { hidden, .. } => hidden,
        }
    }

    pub fn cell(&self) -> Option<&Tensor> {
        match self {
            RecurrentState::Single(_) => None,
            RecurrentState::Dual { cell, .. } => Some(cell),
        }
    }

    /// All tensors in native order.
    pub fn tensors(&self) -> Vec<&Tensor> {
        match self {
            RecurrentState::Single(h) => vec![h],
            RecurrentState::Dual { hidden, cell } => vec![hidden, cell],
        }
    }

    pub fn batch_size(&self) -> Result<i64> {
        self.hidden()
            .shape()?
            .dim(1)
            .ok_or_else(|| EmberError::InvalidArgument("state tensor has no batch dimension".into()))
    }

    pub(crate) fn expect_single(&self) -> Result<&Tensor> {
        match self {
            RecurrentState::Single(h) => Ok(h),
            other => Err(EmberError::StateMismatch {
                expected: "single",
                found: other.tag(),
            }),
        }
    }

    pub(crate) fn expect_dual(&self) -> Result<[&Tensor; 2]> {
        match self {
            RecurrentState::Dual { hidden, cell } => Ok([hidden, cell]),
            other => Err(EmberError::StateMismatch {
                expected: "dual",
                found: other.tag(),
            }),
        }
    }
}
