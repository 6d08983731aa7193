//! Extract metrics from log files with small pattern/action programs.
//!
//! Program source is compiled by [`dsl`] into bytecode, bound to a shared
//! [`metrics::MetricStore`] by [`program`], and run against every line of
//! every tailed source by the [`dispatcher::Dispatcher`].

pub mod dispatcher;
pub mod dsl;
pub mod error;
pub mod metrics;
pub mod poller;
pub mod program;
pub mod settings;
pub mod source;
