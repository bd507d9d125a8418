pub mod image_backend;
pub mod memory_store;
pub mod object_store;

pub use image_backend::{DecodedImage, ImageBackend, RealImageBackend};
pub use memory_store::MemoryObjectStore;
pub use object_store::{ObjectInfo, ObjectStat, ObjectStoreClient, S3ObjectStoreClient};
