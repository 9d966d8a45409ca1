// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:       Configuration structs loaded from JSON
// - schema:       Strongly typed readings, state and records
// - util:         Shared helpers (time, symbols, tokens)
// - metrics:      Process-global runtime counters
// - aggregation:  Outlier-rejecting averaging (node and fleet)
// - storage:      Persistence collaborator (Redis, in-memory)
// - alert:        Outbound alerting collaborator (Slack, log)
// - notification: Typed node events and the emission bus
// - exchanges:    REST ticker adapters and the feed fetcher
// - chain:        Chain-push collaborator and its relay client
// - rpc:          Supervisor <-> collector polling protocol
// - collector:    Collector node controller and update loop
// - supervisor:   Fleet registry, sweep loop, price history
// - control:      Authenticated operator WebSocket channel
//
pub mod aggregation;
pub mod alert;
pub mod chain;
pub mod collector;
pub mod config;
pub mod control;
pub mod exchanges;
pub mod metrics;
pub mod notification;
pub mod rpc;
pub mod schema;
pub mod storage;
pub mod supervisor;
pub mod util;
