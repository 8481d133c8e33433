pub mod health;
pub mod imports;
pub mod metrics;
