pub mod segment_pool;
pub mod segment_ring;
