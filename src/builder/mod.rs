//! Background repair of chunk batches.

mod map_builder;

pub use map_builder::MapBuilder;
