pub mod admission;
pub mod audit;
pub mod config;
pub mod controller;
pub mod errors;
pub mod fanout;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod remediation;
pub mod review;
pub mod state;
pub mod worker;
