//! Resumable, integrity-verified build installation and patching.
//!
//! A [`install::BuildInstaller`] brings an install directory from an optional
//! current build to a target build, sourcing content-addressed chunks through
//! pluggable collaborators ([`install::InstallBackend`]). [`local`] provides a
//! filesystem-backed implementation of those collaborators.

pub mod api;
pub mod install;
pub mod local;
pub mod manifest;
pub mod utils;
