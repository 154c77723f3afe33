pub mod annotation;
pub mod batch;
pub mod job;
pub mod tier;
