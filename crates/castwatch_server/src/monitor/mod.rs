#![forbid(unsafe_code)]

pub mod clients;
pub mod credentials;
pub mod fetchers;
pub mod liveness;
pub mod orchestrator;
pub mod poller;
pub mod report;
pub mod sessions;

#[cfg(test)]
mod testkit;

#[cfg(test)]
mod fetchers_tests;
