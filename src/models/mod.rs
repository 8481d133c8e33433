pub mod import;
pub mod media;
pub mod task;
