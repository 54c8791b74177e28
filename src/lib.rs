//! # Meshtrace - Meshtastic MQTT Collector
//!
//! Meshtrace subscribes to the MQTT feed that Meshtastic gateways publish, stores every packet
//! it receives (decoded, decrypted or not), and reconstructs the path traceroute probes took
//! through the radio mesh.
//!
//! ## Features
//!
//! - **Lossless ingestion**: one `packet_history` row per message, with parse errors recorded
//!   rather than dropped.
//! - **Channel decryption**: AES-CTR with per-channel key derivation over a configurable list
//!   of candidate keys.
//! - **Traceroute reconstruction**: forward, return and actual-RF paths, with hop SNR and
//!   great-circle hop distances.
//! - **Combined graphs**: many receptions of one probe merged into a node/edge graph.
//! - **Retention**: periodic pruning of old packets and orphaned node records.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshtrace::config::Config;
//! use meshtrace::service::CollectorService;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut service = CollectorService::open(config)?;
//!     service.start();
//!     service.wait().await;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`ingest`] - Per-message pipeline and node-name directory
//! - [`crypto`] - Channel key derivation and payload decryption
//! - [`decode`] - Envelope and application payload decoding
//! - [`traceroute`] - Path reconstruction for a single traceroute reception
//! - [`graph`] - Multi-reception graph aggregation
//! - [`location`] - Node positions and hop distances
//! - [`storage`] - SQLite packet store
//! - [`retention`] / [`scheduler`] - Background cleanup on a cancellable timer
//! - [`mqtt`] - Broker subscription and reconnect policy
//! - [`service`] - Lifecycle owner tying the above together
//! - [`config`] - Configuration management
//! - [`protobuf`] - Generated Meshtastic protocol buffer types
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  MQTT feed      │ ← gateway publishes
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Ingestor       │ ← decode, decrypt, persist
//! └─────────────────┘
//!          │
//! ┌─────────────────┐      ┌──────────────────────┐
//! │  Storage        │ ───► │ Traceroute / Graph   │ ← read-only reconstruction
//! └─────────────────┘      └──────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod decode;
pub mod graph;
pub mod ingest;
pub mod location;
pub mod logutil;
pub mod metrics;
pub mod mqtt;
pub mod node_id;
pub mod protobuf;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod topic;
pub mod traceroute;
