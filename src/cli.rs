// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "arbor", version, about = "Multi-tenant autonomous agent runtime")]
pub struct Cli {
    /// Explicit config file, merged over the standard search locations.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (RUST_LOG further refines the filter).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a task and stream the session's events to stdout as JSON lines.
    Submit {
        /// Natural-language task description.
        task: String,
        /// Session id; generated when omitted.
        #[arg(long)]
        session_id: Option<String>,
        /// Owner user id, used for key resolution and memory scoping.
        #[arg(long)]
        owner: Option<String>,
    },

    /// Print a session row as JSON.
    Show {
        session_id: String,
    },

    /// Append a message to a finished session and re-run it.
    Resume {
        session_id: String,
        message: String,
    },

    /// Print the effective merged configuration.
    ShowConfig,
}
