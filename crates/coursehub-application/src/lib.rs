//! Application layer for coursehub.
//!
//! This crate provides the use case that coordinates identity, workspace and
//! session lifecycle components for each session request.

pub mod keyed_lock;
pub mod session_launch_usecase;

pub use keyed_lock::KeyedLocks;
pub use session_launch_usecase::{LaunchRequest, SessionLaunchUseCase};
