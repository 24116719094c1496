//! Lifectl controls an externally managed process through delegate control
//! scripts. It starts, stops and force-kills the process by invoking
//! `<prefix><operation><suffix> <tag>` scripts, confirms every transition by
//! polling the `running` script, drains the process's output streams on
//! dedicated threads, and notifies listeners before and after each transition.

/// CLI interface.
pub mod cli;

/// Control script invocation assembly.
pub mod command;

/// Configuration management.
pub mod config;

/// Output stream draining.
pub mod drain;

/// Error handling.
pub mod error;

/// Control script launching.
pub mod invoker;

/// The lifecycle controller.
pub mod lifecycle;

/// Transition listeners.
pub mod listener;

#[doc(hidden)]
pub mod test_utils;
