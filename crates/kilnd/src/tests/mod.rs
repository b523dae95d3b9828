//! Test suites for the compilation server.

mod dispatcher_behaviour;
mod support;
