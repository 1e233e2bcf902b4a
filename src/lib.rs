//! # Dev Assistant
//!
//! A retrieval-augmented development assistant over JIRA tickets, git
//! history, and codebase metadata.
//!
//! Raw records from each source are normalized into text documents,
//! embedded, and stored in a portable on-disk vector index. A chat session
//! answers questions by retrieving the nearest documents and handing them
//! to a text-generation backend. A tool dispatcher exposes the same
//! capabilities to the CLI, an HTTP API, and MCP clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │   Sources    │──▶│  Normalize  │──▶│ Embedding    │
//! │ JIRA/git/code│   │  + Ingest   │   │ Index (.idx) │
//! └──────────────┘   └─────────────┘   └──────┬───────┘
//!                                             │
//!                    ┌────────────────────────┤
//!                    ▼                        ▼
//!               ┌──────────┐          ┌──────────────┐
//!               │   Chat   │◀────────▶│    Tools     │
//!               │ session  │          │  dispatcher  │
//!               └────┬─────┘          └──────┬───────┘
//!                    └──────────┬────────────┘
//!                       ┌───────┴───────┐
//!                       ▼               ▼
//!                  ┌─────────┐    ┌───────────┐
//!                  │   CLI   │    │ HTTP + MCP│
//!                  │  (dax)  │    │  server   │
//!                  └─────────┘    └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dax fetch git --repo . --output data/git_history.json
//! dax ingest git --input data/git_history.json
//! dax search "login redirect"
//! dax chat
//! dax serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Documents, hits, turns |
//! | [`normalize`] | Raw record → document text + metadata |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index: add, search, merge, persist |
//! | [`ingest`] | Payload validation and index builds |
//! | [`sources`] | Git history and JIRA fetchers |
//! | [`codebase`] | Source tree scanning and symbol extraction |
//! | [`generation`] | Text-generation backends |
//! | [`chat`] | Retrieval-augmented chat sessions |
//! | [`traits`] | Tool trait and registry |
//! | [`tools`] | Built-in tools and `tools.json` loading |
//! | [`server`] | HTTP front-end |
//! | [`mcp`] | MCP bridge |

pub mod chat;
pub mod codebase;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod normalize;
pub mod server;
pub mod sources;
pub mod tools;
pub mod traits;

pub use error::{Error, Result};
