// Gateway file to expose integration tests from the integration/ subdirectory
// This file allows Rust's test runner to discover tests in subdirectories

mod common;

// Each test file in integration/ needs to be included here
#[path = "integration/test_end_to_end.rs"]
mod test_end_to_end;

#[path = "integration/test_build_barrier.rs"]
mod test_build_barrier;

#[path = "integration/test_id_partition.rs"]
mod test_id_partition;

#[path = "integration/test_serving.rs"]
mod test_serving;
