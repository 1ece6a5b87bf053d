pub mod buffer_pool;
