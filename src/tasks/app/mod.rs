//! Application integration tasks.
//!
//! - [`AppSrc`]: Push host arrays from application code into a graph root
//! - [`AppSink`]: Pull finished arrays from a graph leaf into application code

mod appsink;
mod appsrc;

pub use appsink::{AppSink, AppSinkHandle, AppSinkStats};
pub use appsrc::{AppSrc, AppSrcHandle, AppSrcStats};

use crate::buffer::Requisition;
use crate::error::{Error, Result};
use crate::metadata::Metadata;

/// An n-dimensional array in application memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    /// Shape of the data.
    pub requisition: Requisition,
    /// Elements in row-major order.
    pub data: Vec<f32>,
    /// Metadata carried along with the data.
    pub metadata: Metadata,
}

impl HostArray {
    /// Create an array, checking that `data` fills `requisition` exactly.
    pub fn new(requisition: Requisition, data: Vec<f32>) -> Result<Self> {
        if requisition.is_none() || data.len() != requisition.n_elements() {
            return Err(Error::shape(format!(
                "{} elements do not fill {:?}",
                data.len(),
                requisition
            )));
        }
        Ok(Self {
            requisition,
            data,
            metadata: Metadata::new(),
        })
    }

    /// A one-dimensional array.
    pub fn from_vec(data: Vec<f32>) -> Result<Self> {
        Self::new(Requisition::new(&[data.len()]), data)
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}
