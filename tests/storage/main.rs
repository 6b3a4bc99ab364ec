// Storage integration tests

mod arena_test;
mod store_test;
