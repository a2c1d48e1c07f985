pub mod asset;

pub use asset::AssetRepository;
