// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Dotfile manager engine.
//!
//! A __source directory__ describes the desired state of a __destination
//! directory__, usually the user's home, through specially named files and
//! directories. Names like `private_dot_ssh` or `executable_dot_local` carry
//! attributes, so the source directory itself can be kept in any version
//! control system without losing permission bits.
//!
//! The engine reads the source directory into a [`source::SourceState`],
//! computes the concrete target state of each destination path, compares it
//! against what is actually there and against what was last written there,
//! and then converges the destination through a [`system::System`]. Every
//! side effect goes through that abstraction, so dry runs, diffs, and status
//! reports are the same code path as a real apply.
//!
//! # See Also
//!
//! 1. [chezmoi](https://www.chezmoi.io/)

pub mod actual;
pub mod apply;
pub mod attr;
pub mod config;
pub mod encryption;
pub mod error;
pub mod filter;
pub mod lazy;
pub mod path;
pub mod source;
pub mod state;
pub mod system;
pub mod target;
pub mod template;
