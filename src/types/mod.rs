pub mod event;
pub mod job;
pub mod params;
pub mod states;
pub mod value;
