//! Repository traits for metadata operations.

pub mod assets;
pub mod keyed;

pub use assets::AssetRecordRepo;
pub use keyed::KeyedRecordRepo;
