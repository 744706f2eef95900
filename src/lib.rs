//! plugwright - plugin lifecycle manager for a host application
//!
//! Uploads packaged plugins, merges their dependencies into the host's
//! `composer.json` / `package.json`, deploys and removes their files with
//! backups, restarts the host, and streams allow-listed build commands.
//!
//! This library exposes the core functionality for both the CLI binary and
//! integration testing.

pub mod archive;
pub mod config;
pub mod depends;
pub mod host;
pub mod install;
pub mod manifest;
pub mod server;
pub mod sql;
pub mod terminal;
pub mod version;
