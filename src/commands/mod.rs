pub mod batch;
pub mod quality_check;
