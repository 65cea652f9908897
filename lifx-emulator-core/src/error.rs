//! Aggregated construction-time error type. Each variant wraps a more specific error raised by
//! an earlier step of bringing a device or server into existence.

use thiserror::Error;

use crate::manager::DuplicateSerial;
use crate::product::UnknownProduct;
use crate::serial::InvalidSerial;

#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error(transparent)]
    UnknownProduct(#[from] UnknownProduct),
    #[error(transparent)]
    InvalidSerial(#[from] InvalidSerial),
    #[error(transparent)]
    DuplicateSerial(#[from] DuplicateSerial),
}
