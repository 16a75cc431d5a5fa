pub mod preferences;

pub use preferences::PreferenceRepository;
