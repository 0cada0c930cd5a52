//! Library integration tests.

mod common;

mod driver_tests;
