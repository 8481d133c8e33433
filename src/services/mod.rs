pub mod formats;
pub mod imports;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod storage;
pub mod store;
pub mod temp_cleaner;
pub mod transcoder;
pub mod worker;
