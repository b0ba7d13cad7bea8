//! Test doubles and fixtures for build tests.
//!
//! This module provides:
//! - File-backed fakes of [`crate::image::ImageBuilder`] and
//!   [`crate::validation::ImageValidator`]
//! - Unpacked image and configuration fixtures

pub mod fixtures;
pub mod mocks;

pub use fixtures::{build_config, unpacked_image, UnpackedImage};
pub use mocks::{FakeImageBuilder, FakeValidator};
