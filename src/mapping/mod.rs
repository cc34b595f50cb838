//! Mapping orchestration: GetMapping, PutMapping and capacity repair.

mod get_mapping;
mod put_mapping;
mod room;

pub use get_mapping::GetMapping;
pub use put_mapping::PutMapping;
pub use room::RoomManager;
