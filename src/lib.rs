//! Orchestration core for long-form video analysis.
//!
//! Ingress hands the core a local file and options via [`queue::JobQueue::submit`];
//! a [`worker::Worker`] leases the job, uploads the file once per credential,
//! plans time-based chunks, fans the analyses out across the credential pool,
//! merges the chunk outputs into one artifact with absolute timestamps, and
//! publishes progress and the terminal event on the job's channel.

pub mod analyzer;
pub mod config;
pub mod logging;
pub mod merger;
pub mod planner;
pub mod pool;
pub mod queue;
pub mod timecode;
pub mod trimmer;
pub mod uploader;
pub mod worker;
