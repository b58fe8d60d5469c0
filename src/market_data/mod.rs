// Market data module entrypoint
pub mod adapters;       // per-venue REST fetchers + streaming framing
pub mod auth;           // ECDSA request signing for the streaming feed
pub mod backoff;        // jittered reconnect delays
pub mod external_book;  // in-memory price -> size book for one symbol
pub mod normaliser;     // wire levels -> canonical decimal sides
pub mod reconstructor;  // snapshot + diff state machine per symbol
pub mod scheduler;      // fixed-cadence polling over (exchange, symbol)
pub mod session;        // authenticated streaming session lifecycle
pub mod types;
