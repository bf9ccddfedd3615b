//! Centralized constants for the irsa-operator project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod controller;
pub mod iam;
pub mod naming;
pub mod paths;
pub mod state;
