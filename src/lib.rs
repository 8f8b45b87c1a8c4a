// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// - config:       Configuration structs loaded from JSON
// - schema:       Rate observation and its persisted wire format
// - error:        Collector and history error taxonomy
// - util:         Rate-text parsing, HTTP client, time helpers
// - metrics:      Process-wide runtime counters
// - status:       Live per-source status board
// - collector:    Collector contract, rendering sessions, per-source harness
// - banks:        Source registry and extraction strategies
// - orchestrator: Two-phase run scheduling and batch hand-off
// - history:      Rolling on-disk history
// - display:      Live table and final summary
//
pub mod banks;
pub mod collector;
pub mod config;
pub mod display;
pub mod error;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod schema;
pub mod status;
pub mod util;
