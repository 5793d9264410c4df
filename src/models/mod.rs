pub mod batch;
pub mod field;
pub mod resume;
