pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod formula;
pub mod report;
pub mod sink;
pub mod source;
