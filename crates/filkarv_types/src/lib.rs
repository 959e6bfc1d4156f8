//! Public types shared by the filkarv engine, parsers and front ends

pub mod hashes;
pub mod info;
pub mod rejection;
pub mod signature;
mod utils;

pub use hashes::ContentHashes;
pub use info::ExtractedSpan;
pub use info::LabelSet;
pub use info::Metadata;
pub use info::MetaDirInfo;
pub use rejection::ParseRejection;
pub use rejection::RejectKind;
pub use signature::Signature;
