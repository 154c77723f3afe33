pub mod annotation_client;
pub mod cancellation;
pub mod clock;
pub mod generator;
pub mod item_worker;
pub mod job_store;
pub mod processor;
pub mod progress;
pub mod rate_limiter;
pub mod retry;
