// =============================================================================
// Control surface — REST binding for start / stop / trigger-analysis / status
// =============================================================================

pub mod rest;
