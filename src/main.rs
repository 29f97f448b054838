#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    missing_docs,
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::unused_async,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
    clippy::cloned_instead_of_copied
)]
#![cfg_attr(not(test), forbid(clippy::indexing_slicing))]
#![cfg_attr(not(test), forbid(clippy::string_slice))]
#![allow(
    clippy::match_bool,
    clippy::mixed_read_write_in_expression,
    clippy::bool_assert_comparison,
    clippy::manual_split_once,
    clippy::format_push_string,
    clippy::bool_to_int_with_if
)]
mod command;
mod config;
pub(crate) mod credentials;
pub(crate) mod error;
pub(crate) mod lifecycle;
pub(crate) mod listener;
pub(crate) mod logging;
pub(crate) mod message;
pub(crate) mod notifier;
pub(crate) mod session;
#[cfg(test)]
mod smtp_client;
pub(crate) mod smtp_server;
pub(crate) mod utils;

use clap::Parser;
use config::{Args, Config};
use std::process;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    // `--version` and `--help` exit here with status 0.
    let args = Args::parse();

    let config = match Config::load(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to read config: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = logging::init(config.log_dir.as_deref()) {
        eprintln!("{}", e);
        process::exit(1);
    }

    if let Err(e) = lifecycle::run(&config).await {
        log::error!("error: {}", e);
        process::exit(1);
    }
}
