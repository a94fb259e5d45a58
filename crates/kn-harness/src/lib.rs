pub mod hardware;
pub mod shutdown;
pub mod test_runner;
