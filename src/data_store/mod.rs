pub mod mem_stream;
pub mod tuple_store;
