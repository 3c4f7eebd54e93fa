// =============================================================================
// Control API
// =============================================================================
//
// REST endpoints for the system/session/data verbs plus a WebSocket feed
// that pushes incremental session-state exports. No authentication layer —
// the control surface binds to the operator's own host.
// =============================================================================

pub mod rest;
pub mod ws;
