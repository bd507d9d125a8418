//! In-memory tier medium. Bytes live only in the [`Handle`] already held by
//! the tier; there is nothing extra to store or remove on this medium.

use async_trait::async_trait;

use crate::error::AppError;
use crate::handle::Handle;

use super::TierMedium;

pub struct MemoryMedium;

#[async_trait]
impl TierMedium for MemoryMedium {
    fn label(&self) -> &'static str {
        "memory"
    }

    async fn store_bytes(&self, _name: &str, _handle: &Handle) -> Result<(), AppError> {
        Ok(())
    }

    async fn remove_bytes(&self, _name: &str) -> Result<(), AppError> {
        Ok(())
    }

    async fn read_bytes(&self, _name: &str) -> Result<Option<Handle>, AppError> {
        Ok(None)
    }
}
