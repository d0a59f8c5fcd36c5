mod cancel_tests;
mod common;
mod run_tests;
