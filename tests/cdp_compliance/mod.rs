//! CDP Compliance Test Suite
//!
//! Domain enable/disable, event shapes and error responses of the Network
//! domain as seen by a devtools client.

mod domain_enable_disable_tests;
mod error_response_tests;
mod event_shape_tests;
