
#[cfg(test)]
pub mod scheduler_tests;
