//! Declarative file-state manager.
//!
//! A source directory describes the desired state of a destination
//! directory through encoded file names (`private_dot_bashrc`,
//! `exact_dot_config`, `run_once_before_setup.sh`), templates, externals
//! and pattern files. `dotstate` reads it into a [`source_state::SourceState`],
//! compares each target with the live destination and the last written
//! state kept in a [`persistent_state::PersistentState`], and reconciles the
//! difference through a [`system::System`].
//!
//! The public API is organised into layers:
//!
//! - **[`attr`], [`relpath`]**: source name codec and path types
//! - **[`entry_state`], [`actual_state`], [`target_state`]**: state models
//! - **[`source_state`]**: reading the source directory and applying it
//! - **[`persistent_state`]**, **[`system`]**: storage and destination I/O
//! - **[`commands`]**: top-level subcommand orchestration
#![deny(clippy::or_fun_call)]
#![deny(clippy::bool_to_int_with_if)]

pub mod actual_state;
pub mod attr;
pub mod cli;
pub mod commands;
pub mod concurrent_tree;
pub mod config;
pub mod digest;
pub mod encryption;
pub mod entry_state;
pub mod entry_type_set;
pub mod error;
pub mod exec;
pub mod lazy;
pub mod logging;
pub mod persistent_state;
pub mod relpath;
pub mod source_state;
pub mod status;
pub mod system;
pub mod target_state;
pub mod template;
