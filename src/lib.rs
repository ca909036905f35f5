//! Resumable download-and-delete engine for remote asset libraries.
//!
//! The [`orchestrator`] drives a [`driver::BrowserDriver`] through each
//! item's variants, deletes fully downloaded items through a
//! [`driver::RemoteApi`], and records them in the [`progress`] store. The
//! [`cache`] and [`gatekeeper`] modules keep repeat runs cheap.

pub mod cache;
pub mod config;
pub mod driver;
pub mod gatekeeper;
pub mod item;
pub mod orchestrator;
pub mod persist;
pub mod progress;
pub mod remote;
pub mod webdriver;
