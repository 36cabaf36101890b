//! # ctxpack
//!
//! **A repository indexing and hybrid-retrieval engine with an agentic
//! research loop.**
//!
//! ctxpack registers source-code resources (remote git repositories or
//! local directories), materializes them on disk, chunks and embeds their
//! files, and answers natural-language or keyword questions by fusing
//! lexical and dense-vector retrieval — optionally driving an LLM agent
//! that can call back into the index.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌───────────┐
//! │ Resources  │──▶│   Indexer     │──▶│  SQLite   │
//! │ git/local  │   │ chunk + embed │   │ chunks+vec│
//! └────────────┘   └───────────────┘   └─────┬─────┘
//!        │                 ▲                 │
//!        ▼                 │                 ▼
//! ┌────────────┐   ┌───────────────┐   ┌───────────┐
//! │Materializer│   │   Scheduler   │   │  Hybrid   │
//! │ clone/walk │   │ per-resource  │   │  Search   │
//! └────────────┘   └───────────────┘   └─────┬─────┘
//!                                            │
//!                              ┌─────────────┤
//!                              ▼             ▼
//!                        ┌──────────┐  ┌──────────┐
//!                        │  Agent   │  │  Tools   │
//!                        │ 3 modes  │  │ r/g/l/g  │
//!                        └──────────┘  └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A **[`models::Resource`]** is registered via [`resources::ResourceStore`].
//! 2. A **sync job** materializes content ([`repo::Materializer`]) and
//!    records commits; an **index job** reads files, chunks them
//!    ([`chunker`]), embeds the contextualized text ([`embedder`]), and
//!    atomically replaces the chunk set ([`chunk_store::ChunkStore`]).
//! 3. Jobs run through the per-resource [`scheduler::Scheduler`]: one
//!    writer per resource, strict queue order, volatile per-request
//!    provider overrides.
//! 4. Queries go to [`search::SearchEngine`]: concurrent text and vector
//!    subtracks fused by reciprocal rank.
//! 5. The [`agent::AgentDriver`] runs quick-answer, exploration, or
//!    deep-research loops over [`tools`], buffered or streamed as
//!    [`events::StreamEvent`] sequences.
//! 6. The [`update_check::UpdateChecker`] flags resources whose remote
//!    branch head moved.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and the `~/.ctxpack` home layout |
//! | [`models`] | Core row types, statuses, search options and results |
//! | [`db`] | SQLite pool and schema bootstrap |
//! | [`resources`] | Resource metadata store |
//! | [`repo`] | Git materializer and local-tree walker |
//! | [`languages`] | Language detection and tree-sitter grammars |
//! | [`chunker`] | AST-aware chunking with contextualized embedding text |
//! | [`embedder`] | Embedding provider trait and OpenAI implementation |
//! | [`chunk_store`] | Chunk persistence and cosine nearest-neighbour scan |
//! | [`jobs`] | Index job rows and transitions |
//! | [`scheduler`] | Per-resource FIFO job execution |
//! | [`indexer`] | Sync and index pipelines |
//! | [`text_search`] | Keyword extraction and ripgrep subtrack |
//! | [`search`] | Hybrid fusion engine |
//! | [`chat`] | Chat model trait and OpenAI-compatible client |
//! | [`providers`] | Per-request capability resolution |
//! | [`tools`] | Resource-scoped read/grep/list/glob + agent registry |
//! | [`agent`] | Quick answer, exploration, deep research, streaming |
//! | [`events`] | Stream event union (NDJSON) |
//! | [`research`] | Asynchronous research jobs |
//! | [`update_check`] | Background remote-HEAD staleness checks |

pub mod agent;
pub mod chat;
pub mod chunk_store;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedder;
pub mod error;
pub mod events;
pub mod indexer;
pub mod jobs;
pub mod languages;
pub mod models;
pub mod providers;
pub mod repo;
pub mod research;
pub mod resources;
pub mod scheduler;
pub mod search;
pub mod text_search;
pub mod tools;
pub mod update_check;

pub use error::{Error, Result};
